// Checkpoint persistence and selection.
//
// A checkpoint is a safetensors container:
//   model.<param>     trainable parameters
//   optim.m.<param>   AdamW first moments
//   optim.v.<param>   AdamW second moments
// with the run state in the header metadata (see `RunState::to_metadata`).

use crate::config::RunConfig;
use crate::distributed::ProcessGroup;
use crate::error::TrainError;
use crate::state::RunState;
use crate::training::AdamW;
use anyhow::{anyhow, Context, Result};
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const BEST_TAG: &str = "best";
const MODEL_PREFIX: &str = "model.";
const OPTIM_PREFIX: &str = "optim.";
const REPLICA_PREFIX: &str = "module.";

pub fn epoch_tag(epoch: usize) -> String {
    format!("epoch{epoch:03}")
}

pub fn checkpoint_path(outdir: &Path, tag: &str) -> PathBuf {
    outdir.join(format!("ckpt-{tag}.pth"))
}

/// Strip data-parallel wrapper prefixes so names match an unwrapped model.
/// Used on every write and on every foreign load.
pub fn normalize_state(tensors: HashMap<String, Tensor>) -> HashMap<String, Tensor> {
    tensors
        .into_iter()
        .map(|(name, t)| {
            let mut key = name.as_str();
            while let Some(rest) = key.strip_prefix(REPLICA_PREFIX) {
                key = rest;
            }
            (key.to_string(), t)
        })
        .collect()
}

fn section(tensors: &HashMap<String, Tensor>, prefix: &str) -> HashMap<String, Tensor> {
    tensors
        .iter()
        .filter_map(|(k, t)| k.strip_prefix(prefix).map(|rest| (rest.to_string(), t.clone())))
        .collect()
}

fn varmap_tensors(varmap: &VarMap) -> Result<HashMap<String, Tensor>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow!("parameter map lock poisoned"))?;
    let mut out = HashMap::with_capacity(data.len());
    for (name, var) in data.iter() {
        out.insert(name.clone(), var.as_tensor().to_device(&Device::Cpu)?);
    }
    Ok(out)
}

/// Write a checkpoint to `path` via a temporary file renamed into place.
pub fn save_checkpoint(path: &Path, varmap: &VarMap, optimizer: &AdamW, state: &RunState) -> Result<()> {
    let mut named: Vec<(String, Tensor)> = Vec::new();
    for (name, t) in normalize_state(varmap_tensors(varmap)?) {
        named.push((format!("{MODEL_PREFIX}{name}"), t));
    }
    let moments: HashMap<String, Tensor> = optimizer.state().into_iter().collect();
    for (name, t) in normalize_state(moments) {
        named.push((format!("{OPTIM_PREFIX}{name}"), t.to_device(&Device::Cpu)?));
    }
    named.sort_by(|a, b| a.0.cmp(&b.0));

    let metadata = Some(state.to_metadata()?);
    let tmp = path.with_extension("pth.tmp");
    safetensors::serialize_to_file(named, &metadata, &tmp)
        .with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("moving checkpoint to {}", path.display()))?;
    tracing::info!(path = %path.display(), epoch = state.epoch, "checkpoint saved");
    Ok(())
}

pub struct LoadedCheckpoint {
    pub model: HashMap<String, Tensor>,
    pub optimizer: HashMap<String, Tensor>,
    pub state: RunState,
}

impl LoadedCheckpoint {
    /// Copy parameters into `varmap` and moments into `optimizer`.
    pub fn restore(&self, varmap: &VarMap, optimizer: &mut AdamW) -> Result<()> {
        let loaded = assign_params(varmap, &self.model, "")?;
        let moments = optimizer.load_state(&self.optimizer, self.state.optimizer_step)?;
        tracing::info!(params = loaded, moments, epoch = self.state.epoch, "checkpoint restored");
        Ok(())
    }
}

fn read_file(path: &Path) -> Result<(HashMap<String, Tensor>, HashMap<String, String>)> {
    let buffer = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let (_, header) = SafeTensors::read_metadata(&buffer)
        .map_err(|e| TrainError::CheckpointFormat(format!("{}: {e}", path.display())))?;
    let metadata = header.metadata().clone().unwrap_or_default();
    let tensors = candle_core::safetensors::load_buffer(&buffer, &Device::Cpu)?;
    Ok((tensors, metadata))
}

pub fn load_checkpoint(path: &Path) -> Result<LoadedCheckpoint> {
    let (tensors, metadata) = read_file(path)?;
    let model = section(&tensors, MODEL_PREFIX);
    if model.is_empty() {
        return Err(TrainError::CheckpointFormat(format!(
            "{} has no {MODEL_PREFIX} section",
            path.display()
        ))
        .into());
    }
    Ok(LoadedCheckpoint {
        model: normalize_state(model),
        optimizer: section(&tensors, OPTIM_PREFIX),
        state: RunState::from_metadata(&metadata)?,
    })
}

/// Headline numbers of a checkpoint file.
#[derive(Debug, Clone)]
pub struct CheckpointSummary {
    pub state: RunState,
    pub model_tensors: usize,
    pub model_params: usize,
    pub optimizer_tensors: usize,
}

pub fn summarize_checkpoint(path: &Path) -> Result<CheckpointSummary> {
    let ckpt = load_checkpoint(path)?;
    Ok(CheckpointSummary {
        model_tensors: ckpt.model.len(),
        model_params: ckpt.model.values().map(|t| t.elem_count()).sum(),
        optimizer_tensors: ckpt.optimizer.len(),
        state: ckpt.state,
    })
}

/// Parameters from either a full checkpoint (its `model.` section) or a
/// bare parameter file.
pub fn load_state_dict(path: &Path) -> Result<HashMap<String, Tensor>> {
    let (tensors, _) = read_file(path)?;
    let model = section(&tensors, MODEL_PREFIX);
    let params = if model.is_empty() { tensors } else { model };
    Ok(normalize_state(params))
}

/// Set every variable in `varmap` whose name starts with `prefix` from
/// `tensors`. Errors when nothing matched or a shape disagrees.
pub fn assign_params(varmap: &VarMap, tensors: &HashMap<String, Tensor>, prefix: &str) -> Result<usize> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow!("parameter map lock poisoned"))?;
    let mut loaded = 0usize;
    let mut wanted = 0usize;
    for (name, var) in data.iter().filter(|(n, _)| n.starts_with(prefix)) {
        wanted += 1;
        let Some(saved) = tensors.get(name) else {
            tracing::warn!(param = %name, "missing from loaded state");
            continue;
        };
        if saved.dims() != var.dims() {
            return Err(TrainError::ShapeMismatch(format!(
                "{name}: saved {:?}, model {:?}",
                saved.dims(),
                var.dims()
            ))
            .into());
        }
        var.set(&saved.to_device(var.device())?.to_dtype(var.dtype())?)?;
        loaded += 1;
    }
    if loaded == 0 && wanted > 0 {
        return Err(TrainError::CheckpointFormat(format!("no parameters matching '{prefix}*'")).into());
    }
    tracing::debug!(loaded, wanted, prefix, "parameters assigned");
    Ok(loaded)
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct CheckpointPolicy {
    pub ckpt_saving: bool,
    pub save_at_end: bool,
    pub interval: Option<usize>,
    pub num_epochs: usize,
}

impl CheckpointPolicy {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            ckpt_saving: config.ckpt_saving,
            save_at_end: config.save_at_end,
            interval: config.ckpt_interval,
            num_epochs: config.num_epochs,
        }
    }

    fn is_last(&self, epoch: usize) -> bool {
        epoch + 1 == self.num_epochs
    }

    pub fn considers(&self, epoch: usize) -> bool {
        (!self.save_at_end && self.ckpt_saving) || (self.save_at_end && self.is_last(epoch))
    }

    pub fn wants_epoch_tag(&self, epoch: usize) -> bool {
        self.interval.is_some_and(|i| (epoch + 1) % i == 0) || self.is_last(epoch)
    }
}

/// What the end-of-epoch checkpoint step did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpochCheckpoint {
    pub tags: Vec<String>,
    pub improved: bool,
    pub not_best: Option<String>,
}

/// Writes on the primary replica only; every replica waits at a barrier.
pub struct CheckpointWriter {
    outdir: PathBuf,
    group: Arc<dyn ProcessGroup>,
}

impl CheckpointWriter {
    pub fn new(outdir: PathBuf, group: Arc<dyn ProcessGroup>) -> Self {
        Self { outdir, group }
    }

    pub fn path(&self, tag: &str) -> PathBuf {
        checkpoint_path(&self.outdir, tag)
    }

    pub fn write(&self, tag: &str, varmap: &VarMap, optimizer: &AdamW, state: &RunState) -> Result<()> {
        if self.group.is_primary() {
            save_checkpoint(&self.path(tag), varmap, optimizer, state)?;
        }
        self.group.barrier()?;
        Ok(())
    }

    /// Apply the selection rules for `state.epoch` given the replica-mean
    /// validation loss. Updates `state.best_val_loss` on improvement.
    pub fn end_of_epoch(
        &self,
        policy: &CheckpointPolicy,
        val_loss: f32,
        state: &mut RunState,
        varmap: &VarMap,
        optimizer: &AdamW,
    ) -> Result<EpochCheckpoint> {
        let epoch = state.epoch;
        let mut out = EpochCheckpoint::default();
        if !policy.considers(epoch) {
            return Ok(out);
        }
        if val_loss < state.best_val_loss {
            state.best_val_loss = val_loss;
            self.write(BEST_TAG, varmap, optimizer, state)?;
            out.tags.push(BEST_TAG.to_string());
            out.improved = true;
        } else {
            let msg = format!("not best - val_loss: {val_loss:.3}, best_val_loss: {:.3}", state.best_val_loss);
            if self.group.is_primary() {
                tracing::info!("{msg}");
            }
            out.not_best = Some(msg);
        }
        if policy.wants_epoch_tag(epoch) {
            let tag = epoch_tag(epoch);
            self.write(&tag, varmap, optimizer, state)?;
            out.tags.push(tag);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::SingleProcess;
    use candle_core::DType;
    use candle_nn::{ParamsAdamW, VarBuilder};

    fn tiny_model() -> Result<(VarMap, AdamW)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let _ = candle_nn::linear(4, 3, vb.pp("voxel2clip").pp("lin0"))?;
        let opt = AdamW::new(&varmap, ParamsAdamW::default())?;
        Ok((varmap, opt))
    }

    fn policy(num_epochs: usize) -> CheckpointPolicy {
        CheckpointPolicy { ckpt_saving: true, save_at_end: false, interval: None, num_epochs }
    }

    #[test]
    fn test_normalize_strips_wrapper_prefix() -> Result<()> {
        let t = Tensor::zeros(2, DType::F32, &Device::Cpu)?;
        let mut m = HashMap::new();
        m.insert("module.prior.w".to_string(), t.clone());
        m.insert("voxel2clip.b".to_string(), t);
        let n = normalize_state(m);
        assert!(n.contains_key("prior.w"));
        assert!(n.contains_key("voxel2clip.b"));
        Ok(())
    }

    #[test]
    fn test_save_load_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (varmap, mut opt) = tiny_model()?;

        // take one optimizer step so the moments are non-zero
        let vars = opt.vars();
        let loss = vars[0].as_tensor().sqr()?.sum_all()?;
        opt.step(&loss.backward()?)?;

        let mut state = RunState::new();
        state.epoch = 3;
        state.optimizer_step = opt.step_count();
        state.scheduler_step = 1;
        state.train_losses = vec![0.5, 0.25];
        state.lrs = vec![1e-3];

        let path = checkpoint_path(dir.path(), BEST_TAG);
        save_checkpoint(&path, &varmap, &opt, &state)?;
        assert!(path.exists());
        assert!(!path.with_extension("pth.tmp").exists());

        let (fresh, mut fresh_opt) = tiny_model()?;
        let loaded = load_checkpoint(&path)?;
        assert_eq!(loaded.state, state);
        loaded.restore(&fresh, &mut fresh_opt)?;
        assert_eq!(fresh_opt.step_count(), 1);

        let before = varmap_tensors(&varmap)?;
        let after = varmap_tensors(&fresh)?;
        for (name, t) in &before {
            let a: Vec<f32> = t.flatten_all()?.to_vec1()?;
            let b: Vec<f32> = after[name].flatten_all()?.to_vec1()?;
            assert_eq!(a, b, "{name}");
        }
        let m0: HashMap<String, Tensor> = opt.state().into_iter().collect();
        let m1: HashMap<String, Tensor> = fresh_opt.state().into_iter().collect();
        for (name, t) in &m0 {
            let a: Vec<f32> = t.flatten_all()?.to_vec1()?;
            let b: Vec<f32> = m1[name].flatten_all()?.to_vec1()?;
            assert_eq!(a, b, "{name}");
        }
        Ok(())
    }

    #[test]
    fn test_infinite_loss_history_is_saved() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (varmap, opt) = tiny_model()?;
        let mut state = RunState::new();
        state.train_losses = vec![0.5, f32::INFINITY];
        state.val_losses = vec![f32::INFINITY];

        let path = checkpoint_path(dir.path(), "epoch000");
        save_checkpoint(&path, &varmap, &opt, &state)?;
        assert_eq!(load_checkpoint(&path)?.state, state);
        Ok(())
    }

    #[test]
    fn test_state_dict_accepts_bare_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bare.safetensors");
        let mut m = HashMap::new();
        m.insert("module.voxel2clip.lin0.weight".to_string(), Tensor::ones((3, 4), DType::F32, &Device::Cpu)?);
        m.insert("module.voxel2clip.lin0.bias".to_string(), Tensor::ones(3, DType::F32, &Device::Cpu)?);
        candle_core::safetensors::save(&m, &path)?;

        let (varmap, _) = tiny_model()?;
        let state = load_state_dict(&path)?;
        assert_eq!(assign_params(&varmap, &state, "voxel2clip.")?, 2);
        let w: Vec<Vec<f32>> = varmap.data().lock().unwrap()["voxel2clip.lin0.weight"].to_vec2()?;
        assert_eq!(w[0], vec![1.0; 4]);
        Ok(())
    }

    #[test]
    fn test_assign_rejects_shape_mismatch() -> Result<()> {
        let (varmap, _) = tiny_model()?;
        let mut m = HashMap::new();
        m.insert("voxel2clip.lin0.weight".to_string(), Tensor::ones((2, 2), DType::F32, &Device::Cpu)?);
        let err = assign_params(&varmap, &m, "voxel2clip.").unwrap_err();
        assert!(matches!(err.downcast_ref::<TrainError>(), Some(TrainError::ShapeMismatch(_))));
        Ok(())
    }

    #[test]
    fn test_best_selection_sequence() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (varmap, opt) = tiny_model()?;
        let writer = CheckpointWriter::new(dir.path().to_path_buf(), Arc::new(SingleProcess));
        let policy = policy(3);
        let mut state = RunState::new();

        let mut outcomes = Vec::new();
        for (epoch, loss) in [0.9f32, 0.5, 0.7].into_iter().enumerate() {
            state.epoch = epoch;
            outcomes.push(writer.end_of_epoch(&policy, loss, &mut state, &varmap, &opt)?);
        }
        assert!(outcomes[0].improved && outcomes[1].improved);
        assert!(!outcomes[2].improved);
        assert_eq!(
            outcomes[2].not_best.as_deref(),
            Some("not best - val_loss: 0.700, best_val_loss: 0.500")
        );
        // last epoch always gets its own tag
        assert_eq!(outcomes[2].tags, vec!["epoch002".to_string()]);
        assert_eq!(state.best_val_loss, 0.5);

        let best = summarize_checkpoint(&writer.path(BEST_TAG))?;
        assert_eq!(best.state.epoch, 1);
        assert_eq!(best.model_tensors, 2);
        assert_eq!(best.model_params, 15);
        assert_eq!(best.optimizer_tensors, 4);
        assert!(writer.path("epoch002").exists());
        assert!(!writer.path("epoch000").exists());
        Ok(())
    }

    #[test]
    fn test_policy_gates() {
        let mut p = policy(10);
        p.interval = Some(3);
        assert!(p.considers(0));
        assert!(p.wants_epoch_tag(2));
        assert!(!p.wants_epoch_tag(3));
        assert!(p.wants_epoch_tag(9));

        p.save_at_end = true;
        assert!(!p.considers(4));
        assert!(p.considers(9));

        p.save_at_end = false;
        p.ckpt_saving = false;
        assert!(!p.considers(9));
    }
}
