// End-to-end training run.
//
// fn run(config) -> RunState
// Steps: persist config → per replica: resolve shards → hold out first
// batches → build models → resume → epoch loop (train, validate, all-reduce
// val loss, checkpoint, samples, telemetry)
//
// With num_devices > 1 every replica runs on its own thread and device,
// sharing a LocalGroup rendezvous; replica 0 is primary. A failing replica
// aborts the group so its peers return instead of waiting forever.

use crate::checkpoint::{load_checkpoint, CheckpointPolicy, CheckpointWriter};
use crate::config::RunConfig;
use crate::data::{first_batch, resolve_shards, Batch, BatchSource, MemoryBatches, RecordKeys, ShardLoader};
use crate::distributed::{LocalGroup, ProcessGroup, SingleProcess};
use crate::epoch::{EpochStats, Trainer};
use crate::error::TrainError;
use crate::imaging::{make_grid, resize_area, save_png};
use crate::models::{build_models, log_param_counts};
use crate::state::RunState;
use crate::telemetry::{RunInfo, TelemetrySink};
use anyhow::{anyhow, Context, Result};
use candle_core::{Device, Tensor};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const PAIR_SIZE: usize = 256;
const PAIR_PADDING: usize = 10;

/// Resolve a device by name: `cpu`, `cuda`, or `auto` (CUDA when built with
/// the `cuda` feature and one is present, else CPU).
pub fn select_device(kind: &str, ordinal: usize) -> Result<Device> {
    match kind {
        "cpu" => Ok(Device::Cpu),
        "cuda" => cuda_device(ordinal),
        _ => Ok(cuda_device(ordinal).unwrap_or(Device::Cpu)),
    }
}

#[cfg(feature = "cuda")]
fn cuda_device(ordinal: usize) -> Result<Device> {
    let device = Device::new_cuda(ordinal)?;
    tracing::info!(ordinal, "using CUDA device");
    Ok(device)
}

#[cfg(not(feature = "cuda"))]
fn cuda_device(_ordinal: usize) -> Result<Device> {
    Err(anyhow!("built without the cuda feature"))
}

/// Run training to completion and return the primary's final state.
pub fn run(config: &RunConfig) -> Result<RunState> {
    config.validate()?;
    let outdir = config.outdir();
    std::fs::create_dir_all(&outdir).with_context(|| format!("creating {}", outdir.display()))?;
    config.save_json(&outdir.join("config.json"))?;
    tracing::info!(outdir = %outdir.display(), model = %config.model_name, "starting run");

    if config.num_devices == 1 {
        let device = select_device(&config.device, 0)?;
        return run_replica(config, Arc::new(SingleProcess), device);
    }

    let members = LocalGroup::create(config.num_devices);
    let results: Vec<Result<RunState>> = std::thread::scope(|scope| {
        let handles: Vec<_> = members
            .into_iter()
            .map(|member| {
                scope.spawn(move || {
                    let rank = member.rank();
                    let group: Arc<dyn ProcessGroup> = Arc::new(member);
                    let _abort = AbortOnPanic(group.clone());
                    let result = select_device(&config.device, rank).and_then(|d| run_replica(config, group.clone(), d));
                    if let Err(e) = &result {
                        if !is_peer_abort(e) {
                            tracing::error!(rank, "replica failed: {e:#}");
                        }
                        group.abort();
                    }
                    result
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().map_err(|_| anyhow!("replica thread panicked"))?)
            .collect()
    });

    // report the failure that tore the group down, not the peers' aborts
    let mut primary = None;
    let mut aborted = None;
    for result in results {
        match result {
            Ok(state) => {
                primary.get_or_insert(state);
            }
            Err(e) if is_peer_abort(&e) => {
                aborted.get_or_insert(e);
            }
            Err(e) => return Err(e),
        }
    }
    if let Some(e) = aborted {
        return Err(e);
    }
    primary.ok_or_else(|| anyhow!("no replicas ran"))
}

fn is_peer_abort(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<TrainError>(), Some(TrainError::ReplicaAborted))
}

/// Tears the group down if the replica thread unwinds.
struct AbortOnPanic(Arc<dyn ProcessGroup>);

impl Drop for AbortOnPanic {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.abort();
        }
    }
}

fn shards_for(config: &RunConfig, group: &dyn ProcessGroup, pattern: &str) -> Result<Vec<PathBuf>> {
    // primary downloads first so replicas never race on the cache
    if group.is_primary() {
        let shards = resolve_shards(config, pattern)?;
        group.barrier()?;
        Ok(shards)
    } else {
        group.barrier()?;
        resolve_shards(config, pattern)
    }
}

fn run_replica(config: &RunConfig, group: Arc<dyn ProcessGroup>, device: Device) -> Result<RunState> {
    let rank = group.rank();
    let world = group.world_size();
    let primary = group.is_primary();
    let outdir = config.outdir();

    // -- data
    let keys = RecordKeys::from_config(config);
    let per_epoch = ((config.num_train_samples / config.batch_size) / world).max(1);
    let train_loader = ShardLoader::new(shards_for(config, group.as_ref(), &config.train_url)?, keys.clone(), config.batch_size, config.seed)
        .shuffled()
        .drop_last()
        .with_batches_per_epoch(per_epoch)
        .for_rank(rank, world);
    let val_loader =
        ShardLoader::new(shards_for(config, group.as_ref(), &config.val_url)?, keys, config.batch_size, config.seed)
            .for_rank(rank, world);

    let train_first = first_batch(&train_loader).context("reading first train batch")?;
    let val_first = first_batch(&val_loader).context("reading first val batch")?;
    let (train_src, val_src): (Box<dyn BatchSource>, Box<dyn BatchSource>) = if config.first_batch {
        tracing::warn!("first_batch mode: every epoch replays one train and one val batch");
        (
            Box::new(MemoryBatches::new(vec![train_first.clone()])),
            Box::new(MemoryBatches::new(vec![val_first.clone()])),
        )
    } else {
        (Box::new(train_loader), Box::new(val_loader))
    };

    // -- models
    let models = build_models(config, &train_first.voxels, &device, config.seed)?;
    if primary {
        log_param_counts(&models);
    }
    let mut trainer = Trainer::new(models, config, group.clone(), device)?;

    let mut state = RunState::new();
    let mut start_epoch = 0;
    if !config.resume_from.is_empty() {
        let ckpt = load_checkpoint(Path::new(&config.resume_from))
            .with_context(|| format!("resuming from {}", config.resume_from))?;
        trainer.restore(&ckpt)?;
        state = ckpt.state;
        start_epoch = state.epoch + 1;
        tracing::info!(epoch = start_epoch, best_val_loss = state.best_val_loss, "resumed");
    }

    let telemetry = if primary && config.telemetry_log {
        let info = RunInfo {
            project: config.telemetry_project.clone(),
            name: if config.run_name.is_empty() { config.model_name.clone() } else { config.run_name.clone() },
            notes: config.run_notes.clone(),
            config_json: serde_json::to_string(config)?,
        };
        Some(TelemetrySink::open(&outdir.join("telemetry.sqlite"), &info)?)
    } else {
        None
    };

    let writer = CheckpointWriter::new(outdir.clone(), group.clone());
    let policy = CheckpointPolicy::from_config(config);

    for epoch in start_epoch..config.num_epochs {
        let (next, stats) = trainer.run_epoch(epoch, state, train_src.as_ref(), val_src.as_ref())?;
        state = next;

        let (val_loss, _) = trainer.checkpoint_epoch(&writer, &policy, &stats, &mut state)?;

        if !primary {
            continue;
        }
        let metrics = stats.metrics(&state, val_loss, config.contrastive_loss);
        tracing::info!(
            epoch,
            train_loss = metrics.get("train/loss").copied().unwrap_or(f64::NAN),
            val_loss,
            lr = stats.last_lr,
            "epoch complete"
        );
        let images = write_epoch_images(config, &trainer, &stats, &train_first, &val_first, epoch, &outdir)?;
        if let Some(sink) = &telemetry {
            sink.log_metrics(epoch, &metrics)?;
            for (key, path) in &images {
                sink.log_image(epoch, key, path)?;
            }
        }
    }

    if let Some(sink) = &telemetry {
        sink.finish()?;
    }
    tracing::info!(rank, best_val_loss = state.best_val_loss, "run finished");
    Ok(state)
}

/// Sample grids and the augmentation pairs grid for one epoch.
/// Returns `(telemetry key, path)` for every file written.
fn write_epoch_images(
    config: &RunConfig,
    trainer: &Trainer,
    stats: &EpochStats,
    train_first: &Batch,
    val_first: &Batch,
    epoch: usize,
    outdir: &Path,
) -> Result<Vec<(String, PathBuf)>> {
    let mut written = Vec::new();
    let last = config.is_last_epoch(epoch);
    if (!config.save_samples_at_end && config.n_samples_save > 0) || (config.save_samples_at_end && last) {
        for (split, batch) in [("train", train_first), ("val", val_first)] {
            let grids = trainer.sample_grids(batch, config.n_samples_save, config.seed)?;
            for (i, grid) in grids.iter().enumerate() {
                let path = outdir.join(format!("samples-{split}-{i:03}.png"));
                save_png(grid, &path)?;
                written.push((format!("samples-{split}"), path));
            }
        }
    }

    if config.n_aug_save > 0 {
        if let Some(pair) = &stats.aug_pair {
            let n = pair.original.dim(0)?;
            let originals = resize_area(&pair.original, PAIR_SIZE, PAIR_SIZE)?;
            let augmented = resize_area(&pair.augmented, PAIR_SIZE, PAIR_SIZE)?;
            let both = Tensor::cat(&[originals, augmented], 0)?;
            let path = outdir.join("augmented-pairs.png");
            save_png(&make_grid(&both, n, PAIR_PADDING)?, &path)?;
            written.push(("augmented-pairs".to_string(), path));
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_cpu() -> Result<()> {
        assert!(matches!(select_device("cpu", 0)?, Device::Cpu));
        Ok(())
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_cuda_requires_feature() {
        assert!(select_device("cuda", 0).is_err());
        assert!(matches!(select_device("auto", 0), Ok(Device::Cpu)));
    }
}
