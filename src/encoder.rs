// Voxel encoders ("voxel2clip"): fMRI voxels to the embedding space.

use crate::checkpoint::{assign_params, load_state_dict};
use crate::config::VoxelLayout;
use crate::error::TrainError;
use crate::layers::{dropout, GradRmsNorm, ResidualBlock};
use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{linear, Linear, VarBuilder, VarMap};
use std::path::Path;

/// Parameter namespace of the encoder inside a run's `VarMap`.
pub const ENCODER_PREFIX: &str = "voxel2clip";

const INPUT_DROPOUT: f32 = 0.5;
const BLOCK_DROPOUT: f32 = 0.15;

pub trait VoxelEncoder: Send + Sync {
    fn out_dim(&self) -> usize;

    /// `(B, ...)` voxels to `(B, out_dim)`. Dropout only when `train`.
    fn encode(&self, voxels: &Tensor, train: bool) -> Result<Tensor>;
}

#[derive(Debug, Clone, Copy)]
pub struct EncoderConfig {
    pub hidden: usize,
    pub blocks: usize,
    pub out_dim: usize,
}

// ---------------------------------------------------------------------------
// Flat voxels: residual MLP
// ---------------------------------------------------------------------------

pub struct BrainNetwork {
    input: Linear,
    input_norm: GradRmsNorm,
    blocks: Vec<ResidualBlock>,
    output: Linear,
    in_dim: usize,
    out_dim: usize,
}

impl BrainNetwork {
    pub fn new(in_dim: usize, cfg: &EncoderConfig, vb: VarBuilder) -> Result<Self> {
        let mut blocks = Vec::with_capacity(cfg.blocks);
        for i in 0..cfg.blocks {
            blocks.push(ResidualBlock::new(cfg.hidden, BLOCK_DROPOUT, vb.pp(format!("block_{i}")))?);
        }
        Ok(Self {
            input: linear(in_dim, cfg.hidden, vb.pp("input"))?,
            input_norm: GradRmsNorm::new(cfg.hidden, 1e-6, vb.pp("input_norm"))?,
            blocks,
            output: linear(cfg.hidden, cfg.out_dim, vb.pp("output"))?,
            in_dim,
            out_dim: cfg.out_dim,
        })
    }
}

impl VoxelEncoder for BrainNetwork {
    fn out_dim(&self) -> usize {
        self.out_dim
    }

    fn encode(&self, voxels: &Tensor, train: bool) -> Result<Tensor> {
        let (_, v) = voxels.dims2()?;
        if v != self.in_dim {
            return Err(TrainError::ShapeMismatch(format!(
                "encoder expects {} voxels, got {v}",
                self.in_dim
            ))
            .into());
        }
        let h = self.input.forward(voxels)?;
        let h = self.input_norm.forward(&h)?.gelu()?;
        let mut h = dropout(&h, INPUT_DROPOUT, train)?;
        for block in &self.blocks {
            h = block.forward(&h, train)?;
        }
        self.output.forward(&h).map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// Volumes: 2x2x2 mean pooling, then the MLP
// ---------------------------------------------------------------------------

pub struct VolumeEncoder {
    mlp: BrainNetwork,
    shape: (usize, usize, usize),
}

/// Mean over non-overlapping 2x2x2 cells of `(B, X, Y, Z)`. Odd trailing
/// planes are dropped.
pub fn pool_volume(voxels: &Tensor) -> Result<Tensor> {
    let (b, x, y, z) = voxels.dims4()?;
    let (px, py, pz) = (x / 2, y / 2, z / 2);
    if px == 0 || py == 0 || pz == 0 {
        return Err(TrainError::ShapeMismatch(format!("volume {:?} too small to pool", voxels.dims())).into());
    }
    let cropped = voxels
        .narrow(1, 0, px * 2)?
        .narrow(2, 0, py * 2)?
        .narrow(3, 0, pz * 2)?
        .contiguous()?;
    let cells = cropped.reshape(&[b, px, 2, py, 2, pz, 2][..])?;
    cells.mean(6)?.mean(4)?.mean(2).map_err(Into::into)
}

impl VolumeEncoder {
    pub fn new(shape: (usize, usize, usize), cfg: &EncoderConfig, vb: VarBuilder) -> Result<Self> {
        let in_dim = (shape.0 / 2) * (shape.1 / 2) * (shape.2 / 2);
        Ok(Self { mlp: BrainNetwork::new(in_dim, cfg, vb)?, shape })
    }
}

impl VoxelEncoder for VolumeEncoder {
    fn out_dim(&self) -> usize {
        self.mlp.out_dim
    }

    fn encode(&self, voxels: &Tensor, train: bool) -> Result<Tensor> {
        let (_, x, y, z) = voxels.dims4()?;
        if (x, y, z) != self.shape {
            return Err(TrainError::ShapeMismatch(format!(
                "encoder expects volume {:?}, got {:?}",
                self.shape,
                (x, y, z)
            ))
            .into());
        }
        let pooled = pool_volume(voxels)?.flatten_from(1)?;
        self.mlp.encode(&pooled, train)
    }
}

/// Build the encoder for `layout`, sizing its input from a sample batch.
pub fn build_encoder(
    layout: VoxelLayout,
    sample: &Tensor,
    cfg: &EncoderConfig,
    vb: VarBuilder,
) -> Result<Box<dyn VoxelEncoder>> {
    let vb = vb.pp(ENCODER_PREFIX);
    match layout {
        VoxelLayout::Flat => {
            let (_, v) = sample.dims2().context("flat voxels must be (B, V)")?;
            Ok(Box::new(BrainNetwork::new(v, cfg, vb)?))
        }
        VoxelLayout::Volume => {
            let (_, x, y, z) = sample.dims4().context("volume voxels must be (B, X, Y, Z)")?;
            Ok(Box::new(VolumeEncoder::new((x, y, z), cfg, vb)?))
        }
    }
}

/// A frozen encoder restored from a checkpoint or bare parameter file.
/// Its parameters live in their own `VarMap` that no optimizer sees.
pub fn load_frozen_encoder(
    path: &Path,
    layout: VoxelLayout,
    sample: &Tensor,
    cfg: &EncoderConfig,
    device: &Device,
) -> Result<(Box<dyn VoxelEncoder>, VarMap)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let encoder = build_encoder(layout, sample, cfg, vb)?;
    let state = load_state_dict(path).with_context(|| format!("loading voxel encoder {}", path.display()))?;
    let n = assign_params(&varmap, &state, &format!("{ENCODER_PREFIX}."))?;
    tracing::info!(path = %path.display(), params = n, "frozen voxel encoder loaded");
    Ok((encoder, varmap))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> EncoderConfig {
        EncoderConfig { hidden: 32, blocks: 2, out_dim: 16 }
    }

    #[test]
    fn test_flat_encoder_shape() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let voxels = Tensor::randn(0f32, 1.0, (4, 50), &Device::Cpu)?;
        let enc = build_encoder(VoxelLayout::Flat, &voxels, &cfg(), vb)?;
        assert_eq!(enc.encode(&voxels, true)?.dims(), &[4, 16]);
        assert!(varmap.data().lock().unwrap().contains_key("voxel2clip.input.weight"));
        Ok(())
    }

    #[test]
    fn test_eval_mode_is_deterministic() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let voxels = Tensor::randn(0f32, 1.0, (3, 20), &Device::Cpu)?;
        let enc = build_encoder(VoxelLayout::Flat, &voxels, &cfg(), vb)?;
        let a = enc.encode(&voxels, false)?;
        let b = enc.encode(&voxels, false)?;
        assert_eq!(a.to_vec2::<f32>()?, b.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_pool_volume_means_cells() -> Result<()> {
        let data: Vec<f32> = (0..8).map(|v| v as f32).collect();
        let vol = Tensor::from_vec(data, (1, 2, 2, 2), &Device::Cpu)?;
        let pooled = pool_volume(&vol)?;
        assert_eq!(pooled.dims(), &[1, 1, 1, 1]);
        let v = pooled.flatten_all()?.to_vec1::<f32>()?;
        assert!((v[0] - 3.5).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_volume_encoder_crops_odd_planes() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let voxels = Tensor::randn(0f32, 1.0, (2, 5, 4, 6), &Device::Cpu)?;
        let enc = build_encoder(VoxelLayout::Volume, &voxels, &cfg(), vb)?;
        assert_eq!(enc.encode(&voxels, false)?.dims(), &[2, 16]);
        Ok(())
    }

    #[test]
    fn test_frozen_encoder_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("encoder.safetensors");
        let voxels = Tensor::randn(0f32, 1.0, (2, 12), &Device::Cpu)?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let trained = build_encoder(VoxelLayout::Flat, &voxels, &cfg(), vb)?;
        let expected = trained.encode(&voxels, false)?.to_vec2::<f32>()?;
        varmap.save(&path)?;

        let (frozen, _) = load_frozen_encoder(&path, VoxelLayout::Flat, &voxels, &cfg(), &Device::Cpu)?;
        assert_eq!(frozen.encode(&voxels, false)?.to_vec2::<f32>()?, expected);
        Ok(())
    }
}
