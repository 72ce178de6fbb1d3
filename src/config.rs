// Run configuration: a flat table of scalar options.
//
// Defaults live in `RunConfig::default()`. Overrides come from JSON files
// (positional arguments) and `--key=value` arguments, applied in order.
// An override is parsed to the type of the option it replaces; unknown
// keys are rejected. The resolved table is written to `<outdir>/config.json`
// and reloading that file reproduces the same options.

use crate::error::TrainError;
use crate::extractor::GRID;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Option domains
// ---------------------------------------------------------------------------

/// Which stimulus the extractor embeds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Modality {
    Image,
    Text,
}

impl Modality {
    pub fn parse(s: &str) -> Result<Self, TrainError> {
        match s {
            "image" => Ok(Self::Image),
            "text" => Ok(Self::Text),
            other => Err(TrainError::UnknownModality(other.to_string())),
        }
    }

    /// Record key holding the stimulus inside a data shard.
    pub fn record_key(&self) -> &'static str {
        match self {
            Self::Image => "images",
            Self::Text => "trial",
        }
    }
}

/// Layout of the voxel recordings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoxelLayout {
    /// `(B, V)` flattened cortical voxels.
    Flat,
    /// `(B, X, Y, Z)` whole-brain volume.
    Volume,
}

impl VoxelLayout {
    pub fn from_dims(voxel_dims: usize) -> Result<Self, TrainError> {
        match voxel_dims {
            1 => Ok(Self::Flat),
            3 => Ok(Self::Volume),
            other => Err(TrainError::UnsupportedVoxelDims(other)),
        }
    }

    pub fn record_key(&self) -> &'static str {
        match self {
            Self::Flat => "nsdgeneral",
            Self::Volume => "wholebrain_3d",
        }
    }
}

/// Augmentation mode: replace the condition ("x"), the target ("y"), or nothing ("n").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AugMode {
    X,
    Y,
    None,
}

impl AugMode {
    pub fn parse(s: &str) -> Result<Self, TrainError> {
        match s {
            "x" => Ok(Self::X),
            "y" => Ok(Self::Y),
            "n" => Ok(Self::None),
            other => Err(TrainError::invalid_option(
                "clip_aug_mode",
                format!("expected one of x, y, n; got '{other}'"),
            )),
        }
    }
}

/// Weight of the prior loss against the contrastive loss, per epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlphaSchedule {
    Constant,
    Linear,
}

impl AlphaSchedule {
    pub fn parse(s: &str) -> Result<Self, TrainError> {
        match s {
            "constant" => Ok(Self::Constant),
            "linear" => Ok(Self::Linear),
            other => Err(TrainError::invalid_option(
                "alpha_schedule",
                format!("unknown alpha_schedule: {other}"),
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LrScheduleKind {
    Fixed,
    Cycle,
}

impl LrScheduleKind {
    pub fn parse(s: &str) -> Result<Self, TrainError> {
        match s {
            "fixed" => Ok(Self::Fixed),
            "cycle" => Ok(Self::Cycle),
            other => Err(TrainError::invalid_option(
                "lr_scheduler",
                format!("expected fixed or cycle; got '{other}'"),
            )),
        }
    }
}

/// Embedding width produced by each supported CLIP variant.
pub fn clip_embed_dim(variant: &str) -> Result<usize, TrainError> {
    match variant {
        "ViT-L/14" => Ok(768),
        "ViT-B/32" => Ok(512),
        "RN50" => Ok(1024),
        other => Err(TrainError::invalid_option(
            "clip_variant",
            format!("unsupported variant '{other}' (ViT-L/14, ViT-B/32, RN50)"),
        )),
    }
}

// ---------------------------------------------------------------------------
// RunConfig
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    // model
    pub model_name: String,
    pub modality: String,
    pub clip_variant: String,
    pub clamp_embs: bool,
    pub extractor_weights: String,
    pub timesteps: usize,
    pub alpha_schedule: String,
    pub contrastive_loss: bool,
    // voxel encoder
    pub train_voxel_encoder: bool,
    pub voxel_encoder_ckpt: String,
    pub voxel_dims: usize,
    pub encoder_hidden: usize,
    pub encoder_blocks: usize,
    // diffusion prior; architecture options are ignored when pretrained_prior=true
    pub pretrained_prior: bool,
    pub prior_ckpt: String,
    pub dim: usize,
    pub depth: usize,
    pub dim_head: usize,
    pub heads: usize,
    pub cond_drop_prob: f64,
    pub image_embed_scale: Option<f64>,
    pub sample_timesteps: usize,
    // augmentation and sampling
    pub clip_aug_mode: String,
    pub clip_aug_prob: f64,
    pub variation_size: usize,
    pub guidance_scale: f64,
    pub n_samples_save: usize,
    pub save_samples_at_end: bool,
    pub n_aug_save: usize,
    // data
    pub remote_data: bool,
    pub data_commit: String,
    pub remote_base_url: String,
    pub cache_dir: String,
    pub train_url: String,
    pub val_url: String,
    pub num_train_samples: usize,
    // optimisation
    pub seed: u64,
    pub batch_size: usize,
    pub num_devices: usize,
    pub device: String,
    pub num_epochs: usize,
    pub lr_scheduler: String,
    pub initial_lr: f64,
    pub max_lr: f64,
    pub weight_decay: f64,
    // logging and checkpoints
    pub telemetry_log: bool,
    pub telemetry_project: String,
    pub run_name: String,
    pub run_notes: String,
    pub first_batch: bool,
    pub ckpt_saving: bool,
    pub ckpt_interval: Option<usize>,
    pub save_at_end: bool,
    pub resume_from: String,
    pub outdir: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model_name: "prior-w-voxel2clip".into(),
            modality: "image".into(),
            clip_variant: "ViT-L/14".into(),
            clamp_embs: false,
            extractor_weights: String::new(),
            timesteps: 1000,
            alpha_schedule: "constant".into(),
            contrastive_loss: true,
            train_voxel_encoder: true,
            voxel_encoder_ckpt: String::new(),
            voxel_dims: 1,
            encoder_hidden: 4096,
            encoder_blocks: 4,
            pretrained_prior: false,
            prior_ckpt: String::new(),
            dim: 768,
            depth: 6,
            dim_head: 64,
            heads: 12,
            cond_drop_prob: 0.2,
            image_embed_scale: None,
            sample_timesteps: 64,
            clip_aug_mode: "n".into(),
            clip_aug_prob: 0.3,
            variation_size: 256,
            guidance_scale: 7.5,
            n_samples_save: 8,
            save_samples_at_end: false,
            n_aug_save: 16,
            remote_data: false,
            data_commit: "9947586218b6b7c8cab804009ddca5045249a38d".into(),
            remote_base_url: "https://huggingface.co/datasets/neuroprior/nsd-shards".into(),
            cache_dir: "/tmp/wds-cache".into(),
            train_url: "data/train/train_subj01_{0..49}.safetensors".into(),
            val_url: "data/val/val_subj01_0.safetensors".into(),
            num_train_samples: 24983,
            seed: 0,
            batch_size: 64,
            num_devices: 1,
            device: "auto".into(),
            num_epochs: 60,
            lr_scheduler: "cycle".into(),
            initial_lr: 1e-3,
            max_lr: 3e-4,
            weight_decay: 0.01,
            telemetry_log: false,
            telemetry_project: "laion-fmri".into(),
            run_name: String::new(),
            run_notes: String::new(),
            first_batch: false,
            ckpt_saving: true,
            ckpt_interval: None,
            save_at_end: false,
            resume_from: String::new(),
            outdir: "~/data/neuro/models/prior-w-voxel2clip/test".into(),
        }
    }
}

impl RunConfig {
    /// Resolve defaults + overrides. `args` mixes JSON config paths and
    /// `--key=value` pairs; later arguments win.
    pub fn from_args(args: &[String]) -> Result<Self> {
        let Value::Object(mut map) = serde_json::to_value(Self::default())? else {
            anyhow::bail!("default config did not serialize to an object");
        };

        for arg in args {
            if let Some(kv) = arg.strip_prefix("--") {
                let (key, raw) = kv.split_once('=').ok_or_else(|| {
                    TrainError::invalid_option(kv, "overrides must look like --key=value")
                })?;
                apply_override(&mut map, key, raw)?;
            } else {
                let text = std::fs::read_to_string(arg)
                    .with_context(|| format!("reading config file {arg}"))?;
                let file: Map<String, Value> = serde_json::from_str(&text)
                    .with_context(|| format!("parsing config file {arg}"))?;
                for (key, value) in file {
                    let raw = match value {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    apply_override(&mut map, &key, &raw)?;
                }
            }
        }

        let config: RunConfig = serde_json::from_value(Value::Object(map))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every option domain. Runs before any model or optimizer exists.
    pub fn validate(&self) -> Result<(), TrainError> {
        Modality::parse(&self.modality)?;
        VoxelLayout::from_dims(self.voxel_dims)?;
        AugMode::parse(&self.clip_aug_mode)?;
        AlphaSchedule::parse(&self.alpha_schedule)?;
        LrScheduleKind::parse(&self.lr_scheduler)?;

        let embed_dim = clip_embed_dim(&self.clip_variant)?;
        if !self.pretrained_prior && self.dim != embed_dim {
            return Err(TrainError::EmbeddingDimMismatch {
                component: "diffusion prior",
                expected: embed_dim,
                actual: self.dim,
            });
        }

        if self.batch_size == 0 {
            return Err(TrainError::invalid_option("batch_size", "must be > 0"));
        }
        if self.num_epochs == 0 {
            return Err(TrainError::invalid_option("num_epochs", "must be > 0"));
        }
        if self.num_devices == 0 {
            return Err(TrainError::invalid_option("num_devices", "must be > 0"));
        }
        if self.n_aug_save > self.batch_size {
            return Err(TrainError::invalid_option(
                "n_aug_save",
                format!("{} exceeds batch_size {}", self.n_aug_save, self.batch_size),
            ));
        }
        if !(0.0..=1.0).contains(&self.clip_aug_prob) {
            return Err(TrainError::invalid_option("clip_aug_prob", "must be in [0, 1]"));
        }
        if !(0.0..1.0).contains(&self.cond_drop_prob) {
            return Err(TrainError::invalid_option("cond_drop_prob", "must be in [0, 1)"));
        }
        if self.timesteps == 0 || self.sample_timesteps == 0 {
            return Err(TrainError::invalid_option("timesteps", "must be > 0"));
        }
        if self.sample_timesteps > self.timesteps {
            return Err(TrainError::invalid_option(
                "sample_timesteps",
                format!("{} exceeds timesteps {}", self.sample_timesteps, self.timesteps),
            ));
        }
        if self.variation_size == 0 || self.variation_size % GRID != 0 {
            return Err(TrainError::invalid_option(
                "variation_size",
                format!("must be a positive multiple of {GRID}"),
            ));
        }
        if self.ckpt_interval == Some(0) {
            return Err(TrainError::invalid_option("ckpt_interval", "must be > 0 when set"));
        }
        if self.pretrained_prior {
            if self.timesteps != 1000 {
                return Err(TrainError::invalid_option(
                    "timesteps",
                    "a pretrained prior is trained with 1000 timesteps",
                ));
            }
            if self.prior_ckpt.is_empty() {
                return Err(TrainError::invalid_option(
                    "prior_ckpt",
                    "required when pretrained_prior=true",
                ));
            }
        }
        if !self.train_voxel_encoder && self.voxel_encoder_ckpt.is_empty() {
            return Err(TrainError::invalid_option(
                "voxel_encoder_ckpt",
                "a frozen voxel encoder must be loaded from a checkpoint",
            ));
        }
        if !matches!(self.device.as_str(), "auto" | "cpu" | "cuda") {
            return Err(TrainError::invalid_option("device", "expected auto, cpu or cuda"));
        }
        Ok(())
    }

    pub fn modality(&self) -> Modality {
        Modality::parse(&self.modality).unwrap_or(Modality::Image)
    }

    pub fn voxel_layout(&self) -> VoxelLayout {
        VoxelLayout::from_dims(self.voxel_dims).unwrap_or(VoxelLayout::Flat)
    }

    pub fn aug_mode(&self) -> AugMode {
        AugMode::parse(&self.clip_aug_mode).unwrap_or(AugMode::None)
    }

    pub fn alpha_schedule(&self) -> AlphaSchedule {
        AlphaSchedule::parse(&self.alpha_schedule).unwrap_or(AlphaSchedule::Constant)
    }

    pub fn lr_schedule_kind(&self) -> LrScheduleKind {
        LrScheduleKind::parse(&self.lr_scheduler).unwrap_or(LrScheduleKind::Fixed)
    }

    pub fn embed_dim(&self) -> usize {
        clip_embed_dim(&self.clip_variant).unwrap_or(self.dim)
    }

    /// Output directory with a leading `~` expanded.
    pub fn outdir(&self) -> PathBuf {
        expand_home(&self.outdir)
    }

    pub fn is_last_epoch(&self, epoch: usize) -> bool {
        epoch + 1 == self.num_epochs
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

fn apply_override(map: &mut Map<String, Value>, key: &str, raw: &str) -> Result<(), TrainError> {
    let current = map
        .get(key)
        .ok_or_else(|| TrainError::UnknownOption(key.to_string()))?;

    let bad = |what: &str| TrainError::invalid_option(key, format!("expected {what}, got '{raw}'"));

    let parsed = match current {
        Value::Bool(_) => match raw {
            "true" | "True" | "1" => Value::Bool(true),
            "false" | "False" | "0" => Value::Bool(false),
            _ => return Err(bad("a boolean")),
        },
        Value::Number(n) if n.is_f64() => {
            let v: f64 = raw.parse().map_err(|_| bad("a float"))?;
            serde_json::Number::from_f64(v)
                .map(Value::Number)
                .ok_or_else(|| bad("a finite float"))?
        }
        Value::Number(_) => {
            let v: u64 = raw.parse().map_err(|_| bad("a non-negative integer"))?;
            Value::Number(v.into())
        }
        Value::String(_) => Value::String(raw.to_string()),
        // Optional options default to null; accept none/null or a JSON scalar.
        Value::Null => match raw {
            "none" | "None" | "null" => Value::Null,
            _ => serde_json::from_str(raw).map_err(|_| bad("a number or none"))?,
        },
        _ => return Err(bad("a scalar")),
    };
    map.insert(key.to_string(), parsed);
    Ok(())
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults_validate() {
        RunConfig::default().validate().unwrap();
        assert_eq!(RunConfig::default().embed_dim(), 768);
    }

    #[test]
    fn test_overrides_are_typed() -> Result<()> {
        let cfg = RunConfig::from_args(&args(&[
            "--batch_size=8",
            "--clip_aug_mode=x",
            "--clip_aug_prob=0.5",
            "--ckpt_interval=5",
            "--telemetry_log=True",
        ]))?;
        assert_eq!(cfg.batch_size, 8);
        assert_eq!(cfg.aug_mode(), AugMode::X);
        assert!((cfg.clip_aug_prob - 0.5).abs() < 1e-12);
        assert_eq!(cfg.ckpt_interval, Some(5));
        assert!(cfg.telemetry_log);
        Ok(())
    }

    #[test]
    fn test_float_option_accepts_integer_literal() -> Result<()> {
        let cfg = RunConfig::from_args(&args(&["--guidance_scale=3"]))?;
        assert_eq!(cfg.guidance_scale, 3.0);
        Ok(())
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = RunConfig::from_args(&args(&["--no_such_option=1"])).unwrap_err();
        let err = err.downcast::<TrainError>().unwrap();
        assert!(matches!(err, TrainError::UnknownOption(k) if k == "no_such_option"));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let err = RunConfig::from_args(&args(&["--batch_size=big"])).unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_unknown_modality_is_fatal() {
        let err = RunConfig::from_args(&args(&["--modality=audio"])).unwrap_err();
        let err = err.downcast::<TrainError>().unwrap();
        assert!(matches!(err, TrainError::UnknownModality(m) if m == "audio"));
    }

    #[test]
    fn test_unsupported_voxel_dims_is_fatal() {
        let err = RunConfig::from_args(&args(&["--voxel_dims=2"])).unwrap_err();
        let err = err.downcast::<TrainError>().unwrap();
        assert!(matches!(err, TrainError::UnsupportedVoxelDims(2)));
    }

    #[test]
    fn test_n_aug_save_bounded_by_batch() {
        let err = RunConfig::from_args(&args(&["--batch_size=4", "--n_aug_save=8"])).unwrap_err();
        assert!(err.to_string().contains("n_aug_save"));
    }

    #[test]
    fn test_variation_size_checked_at_startup() {
        let err = RunConfig::from_args(&args(&["--variation_size=100"])).unwrap_err();
        let err = err.downcast::<TrainError>().unwrap();
        assert!(matches!(&err, TrainError::InvalidOption { key, .. } if key == "variation_size"));
        assert!(err.is_config_error());
        assert!(RunConfig::from_args(&args(&["--variation_size=0"])).is_err());
        assert!(RunConfig::from_args(&args(&["--variation_size=64"])).is_ok());
    }

    #[test]
    fn test_frozen_encoder_needs_checkpoint() {
        let err = RunConfig::from_args(&args(&["--train_voxel_encoder=false"])).unwrap_err();
        assert!(err.to_string().contains("voxel_encoder_ckpt"));
    }

    #[test]
    fn test_json_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.json");
        let cfg = RunConfig::from_args(&args(&[
            "--batch_size=16",
            "--clip_aug_mode=y",
            "--image_embed_scale=1.0",
            "--run_name=roundtrip",
        ]))?;
        cfg.save_json(&path)?;
        let loaded = RunConfig::from_args(&args(&[path.to_str().unwrap()]))?;
        assert_eq!(cfg, loaded);
        Ok(())
    }

    #[test]
    fn test_config_file_then_override() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("over.json");
        std::fs::write(&path, r#"{"batch_size": 32, "num_epochs": 3, "lr_scheduler": "fixed"}"#)?;
        let cfg = RunConfig::from_args(&args(&[path.to_str().unwrap(), "--num_epochs=5"]))?;
        assert_eq!(cfg.batch_size, 32);
        assert_eq!(cfg.num_epochs, 5);
        assert_eq!(cfg.lr_schedule_kind(), LrScheduleKind::Fixed);
        Ok(())
    }

    #[test]
    fn test_record_keys() {
        assert_eq!(Modality::Image.record_key(), "images");
        assert_eq!(Modality::Text.record_key(), "trial");
        assert_eq!(VoxelLayout::Flat.record_key(), "nsdgeneral");
        assert_eq!(VoxelLayout::Volume.record_key(), "wholebrain_3d");
    }
}
