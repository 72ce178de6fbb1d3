// End-to-end training runs on synthetic shards
//
// Tiny CPU configuration: ViT-B/32 width (512), a one-block prior, a
// 16-unit voxel encoder, 16x16 stimuli and 10 diffusion steps.

use anyhow::Result;
use candle_core::{Device, Tensor};
use neuroprior::checkpoint::{checkpoint_path, summarize_checkpoint};
use neuroprior::config::RunConfig;
use neuroprior::error::TrainError;
use neuroprior::pipeline;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::path::Path;

const VOXELS: usize = 6;
const ROWS_PER_SHARD: usize = 8;

fn write_shard(path: &Path, rows: usize, seed: u64) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let voxels: Vec<f32> = (0..rows * VOXELS).map(|_| rng.gen_range(-1.0..1.0)).collect();
    write_records(path, rows, voxels, &mut rng)
}

fn write_records(path: &Path, rows: usize, voxels: Vec<f32>, rng: &mut StdRng) -> Result<()> {
    let pixels: Vec<u8> = (0..rows * 3 * 16 * 16).map(|_| rng.gen()).collect();
    let mut tensors = HashMap::new();
    tensors.insert("nsdgeneral".to_string(), Tensor::from_vec(voxels, (rows, VOXELS), &Device::Cpu)?);
    tensors.insert("images".to_string(), Tensor::from_vec(pixels, (rows, 3, 16, 16), &Device::Cpu)?);
    candle_core::safetensors::save(&tensors, path)?;
    Ok(())
}

/// Two train shards of 8 records and one val shard of 4.
fn write_dataset(dir: &Path) -> Result<()> {
    write_shard(&dir.join("train_0.safetensors"), ROWS_PER_SHARD, 1)?;
    write_shard(&dir.join("train_1.safetensors"), ROWS_PER_SHARD, 2)?;
    write_shard(&dir.join("val_0.safetensors"), 4, 3)?;
    Ok(())
}

fn tiny_args(data: &Path, outdir: &Path, extra: &[&str]) -> Vec<String> {
    let mut args = vec![
        "--clip_variant=ViT-B/32".to_string(),
        "--dim=512".into(),
        "--depth=1".into(),
        "--heads=2".into(),
        "--dim_head=8".into(),
        "--encoder_hidden=16".into(),
        "--encoder_blocks=1".into(),
        "--timesteps=10".into(),
        "--sample_timesteps=2".into(),
        "--variation_size=16".into(),
        "--batch_size=4".into(),
        "--num_epochs=2".into(),
        "--num_train_samples=16".into(),
        "--n_samples_save=1".into(),
        "--n_aug_save=2".into(),
        "--device=cpu".into(),
        format!("--train_url={}/train_{{0..1}}.safetensors", data.display()),
        format!("--val_url={}/val_0.safetensors", data.display()),
        format!("--outdir={}", outdir.display()),
    ];
    args.extend(extra.iter().map(|s| s.to_string()));
    args
}

#[test]
fn test_full_run_writes_artifacts() -> Result<()> {
    let data = tempfile::tempdir()?;
    let out = tempfile::tempdir()?;
    write_dataset(data.path())?;
    let config = RunConfig::from_args(&tiny_args(data.path(), out.path(), &["--telemetry_log=true"]))?;

    let state = pipeline::run(&config)?;

    assert_eq!(state.epoch, 1);
    // 16 records / batch 4 = 4 steps per epoch
    assert_eq!(state.train_losses.len(), 8);
    assert_eq!(state.lrs.len(), 8);
    assert_eq!(state.val_losses.len(), 2);
    assert_eq!(state.optimizer_step, 8);
    assert!(state.best_val_loss.is_finite());

    for name in [
        "config.json",
        "ckpt-best.pth",
        "ckpt-epoch001.pth",
        "samples-train-000.png",
        "samples-val-000.png",
        "telemetry.sqlite",
    ] {
        assert!(out.path().join(name).exists(), "{name} missing");
    }
    assert!(!out.path().join("ckpt-epoch000.pth").exists());

    let last = summarize_checkpoint(&checkpoint_path(out.path(), "epoch001"))?;
    assert_eq!(last.state, state);
    assert!(last.model_params > 0);
    assert!(last.optimizer_tensors > 0);

    let db = rusqlite::Connection::open(out.path().join("telemetry.sqlite"))?;
    let epochs: i64 =
        db.query_row("SELECT COUNT(*) FROM metrics WHERE key = 'train/loss'", [], |row| row.get(0))?;
    assert_eq!(epochs, 2);
    let finished: Option<String> = db.query_row("SELECT finished_at FROM runs", [], |row| row.get(0))?;
    assert!(finished.is_some());
    Ok(())
}

#[test]
fn test_saved_config_reproduces_options() -> Result<()> {
    let data = tempfile::tempdir()?;
    let out = tempfile::tempdir()?;
    write_dataset(data.path())?;
    let config = RunConfig::from_args(&tiny_args(data.path(), out.path(), &["--num_epochs=1"]))?;
    pipeline::run(&config)?;

    let saved = out.path().join("config.json");
    let via_file = RunConfig::from_args(&[saved.display().to_string()])?;
    assert_eq!(via_file, config);
    Ok(())
}

#[test]
fn test_resume_continues_from_next_epoch() -> Result<()> {
    let data = tempfile::tempdir()?;
    let out = tempfile::tempdir()?;
    write_dataset(data.path())?;
    let first = RunConfig::from_args(&tiny_args(data.path(), out.path(), &[]))?;
    let before = pipeline::run(&first)?;

    let ckpt = checkpoint_path(out.path(), "epoch001");
    let resume = format!("--resume_from={}", ckpt.display());
    let second = RunConfig::from_args(&tiny_args(data.path(), out.path(), &["--num_epochs=3", &resume]))?;
    let after = pipeline::run(&second)?;

    assert_eq!(after.epoch, 2);
    assert_eq!(after.train_losses.len(), 12);
    assert_eq!(&after.train_losses[..8], &before.train_losses[..]);
    assert_eq!(after.optimizer_step, 12);
    assert!(after.best_val_loss <= before.best_val_loss);
    assert!(out.path().join("ckpt-epoch002.pth").exists());
    Ok(())
}

#[test]
fn test_two_replicas_take_equal_steps() -> Result<()> {
    let data = tempfile::tempdir()?;
    let out = tempfile::tempdir()?;
    write_dataset(data.path())?;
    let config = RunConfig::from_args(&tiny_args(data.path(), out.path(), &["--num_devices=2"]))?;

    let state = pipeline::run(&config)?;

    // (16 / 4) / 2 replicas = 2 steps per epoch each
    assert_eq!(state.train_losses.len(), 4);
    assert_eq!(state.optimizer_step, 4);
    assert!(out.path().join("ckpt-epoch001.pth").exists());
    Ok(())
}

#[test]
fn test_replica_failure_is_returned() -> Result<()> {
    let data = tempfile::tempdir()?;
    let out = tempfile::tempdir()?;
    write_dataset(data.path())?;
    let mut rng = StdRng::seed_from_u64(9);
    write_records(&data.path().join("train_1.safetensors"), ROWS_PER_SHARD, vec![f32::NAN; ROWS_PER_SHARD * VOXELS], &mut rng)?;
    let config = RunConfig::from_args(&tiny_args(data.path(), out.path(), &["--num_devices=2"]))?;

    // replica 1 reads the NaN shard; replica 0 must be released, not hang
    let err = pipeline::run(&config).unwrap_err();
    assert!(matches!(err.downcast_ref::<TrainError>(), Some(TrainError::InvalidLoss { .. })), "{err:#}");
    assert!(!out.path().join("ckpt-epoch001.pth").exists());
    Ok(())
}

#[test]
fn test_text_modality_is_rejected() -> Result<()> {
    let data = tempfile::tempdir()?;
    let out = tempfile::tempdir()?;
    write_dataset(data.path())?;
    let config = RunConfig::from_args(&tiny_args(data.path(), out.path(), &["--modality=text"]))?;
    assert!(pipeline::run(&config).is_err());
    Ok(())
}
