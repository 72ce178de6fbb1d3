// Frozen image feature extractor.
//
// The production extractor is a CLIP image tower; the harness only needs
// something that maps (B, 3, H, W) images in [0, 1] to (B, D) embeddings and
// never trains. `PooledProjectionExtractor` pools the image onto a 16x16 grid
// and applies a fixed near-orthogonal projection, so the decoder in
// `variation.rs` can approximately invert it.

use crate::checkpoint::load_state_dict;
use crate::error::TrainError;
use anyhow::Result;
use candle_core::{Device, Module, Tensor};
use candle_nn::Linear;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::path::Path;

/// Side of the pooled grid the projection reads.
pub const GRID: usize = 16;
/// Flattened pooled image width: 3 channels on a 16x16 grid.
pub const POOLED_FEATURES: usize = 3 * GRID * GRID;
const CLAMP: f64 = 1.5;
const PROJECTION_SEED: u64 = 0x00c1_1b5e;

pub trait FeatureExtractor: Send + Sync {
    fn embed_dim(&self) -> usize;

    /// `(B, 3, H, W)` in `[0, 1]` to `(B, embed_dim)`. The output carries no
    /// gradient history.
    fn embed_image(&self, images: &Tensor) -> Result<Tensor>;
}

pub struct PooledProjectionExtractor {
    proj: Linear,
    weight: Tensor,
    bias: Tensor,
    embed_dim: usize,
    clamp: bool,
}

impl PooledProjectionExtractor {
    /// Deterministic projection drawn from a fixed seed.
    pub fn new(embed_dim: usize, clamp: bool, device: &Device) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(PROJECTION_SEED);
        let normal = Normal::new(0f32, 1.0 / (POOLED_FEATURES as f32).sqrt())?;
        let w: Vec<f32> = (0..embed_dim * POOLED_FEATURES).map(|_| normal.sample(&mut rng)).collect();
        let weight = Tensor::from_vec(w, (embed_dim, POOLED_FEATURES), device)?;
        let bias = Tensor::zeros(embed_dim, candle_core::DType::F32, device)?;
        Ok(Self::from_parts(weight, bias, clamp))
    }

    /// Projection stored as `proj.weight` `(D, 768)` and `proj.bias` `(D)`.
    pub fn load(path: &Path, expected_dim: usize, clamp: bool, device: &Device) -> Result<Self> {
        let state = load_state_dict(path)?;
        let get = |key: &str| {
            state
                .get(key)
                .cloned()
                .ok_or_else(|| TrainError::CheckpointFormat(format!("{} has no {key}", path.display())))
        };
        let weight = get("proj.weight")?.to_device(device)?;
        let bias = get("proj.bias")?.to_device(device)?;
        let (d, f) = weight.dims2()?;
        if f != POOLED_FEATURES {
            return Err(TrainError::ShapeMismatch(format!(
                "extractor projection reads {f} features, expected {POOLED_FEATURES}"
            ))
            .into());
        }
        if d != expected_dim {
            return Err(TrainError::EmbeddingDimMismatch {
                component: "feature extractor",
                expected: expected_dim,
                actual: d,
            }
            .into());
        }
        tracing::info!(path = %path.display(), dim = d, "extractor weights loaded");
        Ok(Self::from_parts(weight, bias, clamp))
    }

    fn from_parts(weight: Tensor, bias: Tensor, clamp: bool) -> Self {
        let embed_dim = weight.dim(0).unwrap_or(0);
        Self {
            proj: Linear::new(weight.clone(), Some(bias.clone())),
            weight,
            bias,
            embed_dim,
            clamp,
        }
    }

    /// `(D, 768)` projection matrix and `(D)` bias.
    pub fn projection(&self) -> (&Tensor, &Tensor) {
        (&self.weight, &self.bias)
    }
}

/// Average-pool `(B, C, H, W)` onto a `GRID x GRID` grid.
pub fn pool_to_grid(images: &Tensor) -> Result<Tensor> {
    let (_, c, h, w) = images.dims4()?;
    if c != 3 || h % GRID != 0 || w % GRID != 0 {
        return Err(TrainError::ShapeMismatch(format!(
            "images must be (B, 3, H, W) with H, W multiples of {GRID}, got {:?}",
            images.dims()
        ))
        .into());
    }
    if h == GRID && w == GRID {
        return Ok(images.clone());
    }
    images.avg_pool2d((h / GRID, w / GRID)).map_err(Into::into)
}

impl FeatureExtractor for PooledProjectionExtractor {
    fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    fn embed_image(&self, images: &Tensor) -> Result<Tensor> {
        let images = images.detach();
        let pooled = pool_to_grid(&images)?.flatten_from(1)?;
        let centered = (pooled - 0.5)?;
        let mut emb = self.proj.forward(&centered)?;
        if self.clamp {
            emb = emb.clamp(-CLAMP, CLAMP)?;
        }
        Ok(emb.detach())
    }
}
