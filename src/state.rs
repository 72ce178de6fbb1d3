// Run state threaded through the epoch loop and persisted with checkpoints.

use crate::error::TrainError;
use anyhow::Result;
use serde::de::DeserializeOwned;
use serde_json::{Number, Value};
use std::collections::HashMap;

pub const INITIAL_BEST_VAL_LOSS: f32 = 1e9;

/// Everything the epoch loop carries forward besides the parameters
/// themselves. Histories hold one entry per batch across the whole run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunState {
    /// Last completed epoch.
    pub epoch: usize,
    pub best_val_loss: f32,
    pub train_losses: Vec<f32>,
    pub val_losses: Vec<f32>,
    pub lrs: Vec<f64>,
    pub train_sims: Vec<f32>,
    pub val_sims: Vec<f32>,
    pub scheduler_step: usize,
    pub optimizer_step: usize,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            epoch: 0,
            best_val_loss: INITIAL_BEST_VAL_LOSS,
            train_losses: Vec::new(),
            val_losses: Vec::new(),
            lrs: Vec::new(),
            train_sims: Vec::new(),
            val_sims: Vec::new(),
            scheduler_step: 0,
            optimizer_step: 0,
        }
    }
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// String metadata for a safetensors header. Scalars and histories are JSON.
    pub fn to_metadata(&self) -> Result<HashMap<String, String>> {
        let mut meta = HashMap::new();
        meta.insert("epoch".into(), serde_json::to_string(&self.epoch)?);
        meta.insert("optimizer_step".into(), serde_json::to_string(&self.optimizer_step)?);
        meta.insert("scheduler_step".into(), serde_json::to_string(&self.scheduler_step)?);
        meta.insert("best_val_loss".into(), serde_json::to_string(&float_value(self.best_val_loss as f64))?);
        meta.insert("train_losses".into(), floats_to_json(self.train_losses.iter().map(|&v| v as f64))?);
        meta.insert("val_losses".into(), floats_to_json(self.val_losses.iter().map(|&v| v as f64))?);
        meta.insert("lrs".into(), floats_to_json(self.lrs.iter().copied())?);
        meta.insert("train_sims".into(), floats_to_json(self.train_sims.iter().map(|&v| v as f64))?);
        meta.insert("val_sims".into(), floats_to_json(self.val_sims.iter().map(|&v| v as f64))?);
        Ok(meta)
    }

    pub fn from_metadata(meta: &HashMap<String, String>) -> Result<Self> {
        let best: Value = field(meta, "best_val_loss")?;
        Ok(Self {
            epoch: field(meta, "epoch")?,
            optimizer_step: field(meta, "optimizer_step")?,
            scheduler_step: field(meta, "scheduler_step")?,
            best_val_loss: value_float(&best, "best_val_loss")? as f32,
            train_losses: narrow(float_field(meta, "train_losses")?),
            val_losses: narrow(float_field(meta, "val_losses")?),
            lrs: float_field(meta, "lrs")?,
            train_sims: narrow(float_field(meta, "train_sims")?),
            val_sims: narrow(float_field(meta, "val_sims")?),
        })
    }
}

// JSON numbers cannot hold inf or NaN; those are written as the strings
// "inf", "-inf" and "NaN".
fn float_value(v: f64) -> Value {
    Number::from_f64(v).map(Value::Number).unwrap_or_else(|| Value::String(v.to_string()))
}

fn value_float(v: &Value, key: &str) -> Result<f64> {
    let parsed = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| TrainError::CheckpointFormat(format!("metadata key {key}: not a float: {v}")).into())
}

fn floats_to_json(values: impl Iterator<Item = f64>) -> Result<String> {
    let items: Vec<Value> = values.map(float_value).collect();
    Ok(serde_json::to_string(&items)?)
}

fn float_field(meta: &HashMap<String, String>, key: &str) -> Result<Vec<f64>> {
    let items: Vec<Value> = field(meta, key)?;
    items.iter().map(|v| value_float(v, key)).collect()
}

fn narrow(values: Vec<f64>) -> Vec<f32> {
    values.into_iter().map(|v| v as f32).collect()
}

fn field<T: DeserializeOwned>(meta: &HashMap<String, String>, key: &str) -> Result<T> {
    let raw = meta
        .get(key)
        .ok_or_else(|| TrainError::CheckpointFormat(format!("missing metadata key {key}")))?;
    serde_json::from_str(raw)
        .map_err(|e| TrainError::CheckpointFormat(format!("metadata key {key}: {e}")).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state() {
        let s = RunState::new();
        assert_eq!(s.best_val_loss, 1e9);
        assert!(s.train_losses.is_empty());
    }

    #[test]
    fn test_metadata_round_trip() -> Result<()> {
        let s = RunState {
            epoch: 4,
            best_val_loss: 0.25,
            train_losses: vec![1.0, 0.5],
            val_losses: vec![0.75],
            lrs: vec![1e-4, 2e-4],
            train_sims: vec![0.1, 0.2],
            val_sims: vec![0.3],
            scheduler_step: 2,
            optimizer_step: 2,
        };
        let back = RunState::from_metadata(&s.to_metadata()?)?;
        assert_eq!(back, s);
        Ok(())
    }

    #[test]
    fn test_non_finite_history_round_trips() -> Result<()> {
        let s = RunState {
            train_losses: vec![0.5, f32::INFINITY, f32::NEG_INFINITY],
            val_losses: vec![f32::NAN, 0.125],
            ..RunState::new()
        };
        let meta = s.to_metadata()?;
        assert_eq!(meta["train_losses"], r#"[0.5,"inf","-inf"]"#);
        let back = RunState::from_metadata(&meta)?;
        assert_eq!(back.train_losses, s.train_losses);
        assert!(back.val_losses[0].is_nan());
        assert_eq!(back.val_losses[1], 0.125);
        Ok(())
    }

    #[test]
    fn test_bad_float_is_format_error() -> Result<()> {
        let mut meta = RunState::new().to_metadata()?;
        meta.insert("lrs".into(), r#"[true]"#.into());
        let err = RunState::from_metadata(&meta).unwrap_err();
        assert!(matches!(err.downcast_ref::<TrainError>(), Some(TrainError::CheckpointFormat(_))));
        Ok(())
    }

    #[test]
    fn test_missing_key_is_format_error() {
        let err = RunState::from_metadata(&HashMap::new()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TrainError>(),
            Some(TrainError::CheckpointFormat(_))
        ));
    }
}
