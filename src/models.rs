// Model assembly from a validated RunConfig.

use crate::checkpoint::load_state_dict;
use crate::config::{Modality, RunConfig};
use crate::encoder::{build_encoder, load_frozen_encoder, EncoderConfig, VoxelEncoder, ENCODER_PREFIX};
use crate::error::TrainError;
use crate::extractor::{FeatureExtractor, PooledProjectionExtractor};
use crate::prior::{DiffusionPrior, MlpDiffusionPrior, PriorConfig, PRIOR_PREFIX};
use crate::training::count_params;
use crate::variation::{ImageVariation, ProjectionVariation};
use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use std::path::Path;
use std::sync::Arc;

/// Everything one replica trains or queries.
pub struct Models {
    pub extractor: Arc<dyn FeatureExtractor>,
    pub encoder: Box<dyn VoxelEncoder>,
    pub encoder_trainable: bool,
    pub prior: Box<dyn DiffusionPrior>,
    pub variation: Arc<dyn ImageVariation>,
    /// Trainable parameters (prior, plus the encoder when it trains).
    pub varmap: VarMap,
    /// Parameters of a frozen encoder, kept apart from the optimizer.
    pub frozen: Option<VarMap>,
}

pub fn encoder_config(config: &RunConfig) -> EncoderConfig {
    EncoderConfig {
        hidden: config.encoder_hidden,
        blocks: config.encoder_blocks,
        out_dim: config.embed_dim(),
    }
}

/// Prior architecture from the options.
pub fn prior_config(config: &RunConfig) -> PriorConfig {
    PriorConfig {
        dim: config.dim,
        depth: config.depth,
        hidden: config.heads * config.dim_head,
        timesteps: config.timesteps,
        sample_timesteps: config.sample_timesteps,
        cond_drop_prob: config.cond_drop_prob,
        image_embed_scale: config.image_embed_scale.unwrap_or((config.dim as f64).sqrt()),
    }
}

/// Prior architecture read off a pretrained parameter file.
pub fn infer_prior_config(config: &RunConfig, path: &Path) -> Result<PriorConfig> {
    let state = load_state_dict(path)?;
    let input = state
        .get(&format!("{PRIOR_PREFIX}.input.weight"))
        .ok_or_else(|| TrainError::CheckpointFormat(format!("{} holds no prior", path.display())))?;
    let (hidden, fan_in) = input.dims2()?;
    let depth = (0..)
        .take_while(|i| state.contains_key(&format!("{PRIOR_PREFIX}.block_{i}.lin.weight")))
        .count();
    let dim = fan_in / 3;
    let mut cfg = prior_config(config);
    cfg.dim = dim;
    cfg.depth = depth;
    cfg.hidden = hidden;
    cfg.image_embed_scale = config.image_embed_scale.unwrap_or((dim as f64).sqrt());
    Ok(cfg)
}

fn ensure_dim(component: &'static str, expected: usize, actual: usize) -> Result<(), TrainError> {
    if expected != actual {
        return Err(TrainError::EmbeddingDimMismatch { component, expected, actual });
    }
    Ok(())
}

/// Build every model for one replica. `sample_voxels` sizes the encoder input.
pub fn build_models(config: &RunConfig, sample_voxels: &Tensor, device: &Device, seed: u64) -> Result<Models> {
    if config.modality() == Modality::Text {
        return Err(TrainError::invalid_option("modality", "the built-in feature extractor has no text tower").into());
    }
    let embed_dim = config.embed_dim();

    let extractor = if config.extractor_weights.is_empty() {
        PooledProjectionExtractor::new(embed_dim, config.clamp_embs, device)?
    } else {
        PooledProjectionExtractor::load(Path::new(&config.extractor_weights), embed_dim, config.clamp_embs, device)?
    };
    ensure_dim("feature extractor", embed_dim, extractor.embed_dim())?;
    let variation = ProjectionVariation::from_extractor(&extractor, config.guidance_scale, seed);

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let sample_voxels = sample_voxels.to_device(device)?;
    let enc_cfg = encoder_config(config);
    let (encoder, frozen) = if config.train_voxel_encoder {
        (build_encoder(config.voxel_layout(), &sample_voxels, &enc_cfg, vb.clone())?, None)
    } else {
        let (enc, map) = load_frozen_encoder(
            Path::new(&config.voxel_encoder_ckpt),
            config.voxel_layout(),
            &sample_voxels,
            &enc_cfg,
            device,
        )?;
        (enc, Some(map))
    };
    ensure_dim("voxel encoder", embed_dim, encoder.out_dim())?;

    let prior_cfg = if config.pretrained_prior {
        tracing::warn!("pretrained prior: dim, depth, heads and dim_head options are ignored");
        infer_prior_config(config, Path::new(&config.prior_ckpt))?
    } else {
        prior_config(config)
    };
    let prior = MlpDiffusionPrior::new(prior_cfg, seed, vb)?;
    ensure_dim("diffusion prior", embed_dim, prior.embed_dim())?;
    if config.pretrained_prior {
        MlpDiffusionPrior::load_pretrained(&varmap, Path::new(&config.prior_ckpt))
            .context("loading pretrained prior")?;
    }

    Ok(Models {
        extractor: Arc::new(extractor),
        encoder,
        encoder_trainable: config.train_voxel_encoder,
        prior: Box::new(prior),
        variation: Arc::new(variation),
        varmap,
        frozen,
    })
}

/// Log parameter counts per model. Failures only warn.
pub fn log_param_counts(models: &Models) {
    let encoder_map = models.frozen.as_ref().unwrap_or(&models.varmap);
    let entries = [
        ("voxel2clip", encoder_map, ENCODER_PREFIX),
        ("diffusion prior", &models.varmap, PRIOR_PREFIX),
    ];
    for (label, map, prefix) in entries {
        match count_params(map, prefix) {
            Ok(c) => tracing::info!(model = label, params = c.total, tensors = c.tensors, "parameter count"),
            Err(e) => tracing::warn!(model = label, "could not count parameters: {e:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> RunConfig {
        RunConfig {
            clip_variant: "ViT-B/32".into(),
            dim: 512,
            depth: 1,
            heads: 2,
            dim_head: 8,
            encoder_hidden: 16,
            encoder_blocks: 1,
            timesteps: 10,
            sample_timesteps: 2,
            ..RunConfig::default()
        }
    }

    #[test]
    fn test_build_models_names_params() -> Result<()> {
        let voxels = Tensor::zeros((2, 6), DType::F32, &Device::Cpu)?;
        let models = build_models(&tiny_config(), &voxels, &Device::Cpu, 0)?;
        assert!(models.encoder_trainable && models.frozen.is_none());
        assert_eq!(models.encoder.out_dim(), 512);
        let data = models.varmap.data().lock().unwrap();
        assert!(data.keys().any(|k| k.starts_with("voxel2clip.")));
        assert!(data.keys().any(|k| k.starts_with("prior.")));
        Ok(())
    }

    #[test]
    fn test_text_modality_rejected() -> Result<()> {
        let cfg = RunConfig { modality: "text".into(), ..tiny_config() };
        let voxels = Tensor::zeros((2, 6), DType::F32, &Device::Cpu)?;
        let err = build_models(&cfg, &voxels, &Device::Cpu, 0).err().unwrap();
        assert!(err.downcast_ref::<TrainError>().is_some_and(|e| e.is_config_error()));
        Ok(())
    }

    #[test]
    fn test_pretrained_prior_architecture_is_inferred() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("prior.safetensors");
        let voxels = Tensor::zeros((2, 6), DType::F32, &Device::Cpu)?;
        let source = build_models(&RunConfig { depth: 2, ..tiny_config() }, &voxels, &Device::Cpu, 0)?;
        source.varmap.save(&path)?;

        let cfg = RunConfig {
            pretrained_prior: true,
            prior_ckpt: path.display().to_string(),
            timesteps: 1000,
            ..tiny_config()
        };
        let inferred = infer_prior_config(&cfg, &path)?;
        assert_eq!((inferred.dim, inferred.depth, inferred.hidden), (512, 2, 16));
        let models = build_models(&cfg, &voxels, &Device::Cpu, 0)?;
        assert_eq!(models.prior.embed_dim(), 512);
        Ok(())
    }
}
