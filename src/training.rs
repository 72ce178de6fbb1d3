use anyhow::{anyhow, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use candle_nn::{ParamsAdamW, VarMap};
use std::collections::HashMap;

use crate::config::{LrScheduleKind, RunConfig};

// ---------------------------------------------------------------------------
// One-cycle LR schedule (cosine warmup to max_lr, cosine anneal to min)
// ---------------------------------------------------------------------------

const DIV_FACTOR: f64 = 25.0;
const FINAL_DIV_FACTOR: f64 = 1000.0;

fn anneal_cos(start: f64, end: f64, pct: f64) -> f64 {
    end + (start - end) / 2.0 * ((std::f64::consts::PI * pct).cos() + 1.0)
}

#[derive(Clone, Debug)]
pub struct OneCycle {
    max_lr: f64,
    initial_lr: f64,
    min_lr: f64,
    pct_start: f64,
    total_steps: usize,
}

impl OneCycle {
    pub fn new(max_lr: f64, total_steps: usize, pct_start: f64) -> Self {
        let initial_lr = max_lr / DIV_FACTOR;
        Self {
            max_lr,
            initial_lr,
            min_lr: initial_lr / FINAL_DIV_FACTOR,
            pct_start,
            total_steps: total_steps.max(1),
        }
    }

    /// Learning rate at optimizer step `step`. Steps past the end hold the final value.
    pub fn lr_at(&self, step: usize) -> f64 {
        let last = (self.total_steps - 1) as f64;
        let step = (step as f64).min(last);
        let warm_end = (self.pct_start * self.total_steps as f64 - 1.0).max(0.0);
        if step <= warm_end {
            let pct = if warm_end > 0.0 { step / warm_end } else { 1.0 };
            anneal_cos(self.initial_lr, self.max_lr, pct)
        } else {
            let span = (last - warm_end).max(1.0);
            anneal_cos(self.max_lr, self.min_lr, ((step - warm_end) / span).min(1.0))
        }
    }

    pub fn min_lr(&self) -> f64 {
        self.min_lr
    }
}

/// Learning-rate schedule stepped once per optimizer step.
#[derive(Clone, Debug)]
pub struct LrSchedule {
    kind: ScheduleKind,
    step: usize,
}

#[derive(Clone, Debug)]
enum ScheduleKind {
    Fixed(f64),
    Cycle(OneCycle),
}

impl LrSchedule {
    pub fn fixed(lr: f64) -> Self {
        Self { kind: ScheduleKind::Fixed(lr), step: 0 }
    }

    pub fn one_cycle(cycle: OneCycle) -> Self {
        Self { kind: ScheduleKind::Cycle(cycle), step: 0 }
    }

    /// `fixed` keeps `initial_lr`; `cycle` spans
    /// `num_epochs * ((num_train_samples / batch_size) / num_devices)` steps
    /// and peaks after `2 / num_epochs` of them.
    pub fn from_config(config: &RunConfig) -> Self {
        match config.lr_schedule_kind() {
            LrScheduleKind::Fixed => Self::fixed(config.initial_lr),
            LrScheduleKind::Cycle => {
                let per_epoch = (config.num_train_samples / config.batch_size) / config.num_devices;
                let total = config.num_epochs * per_epoch;
                let pct_start = (2.0 / config.num_epochs as f64).min(1.0);
                Self::one_cycle(OneCycle::new(config.max_lr, total, pct_start))
            }
        }
    }

    pub fn current_lr(&self) -> f64 {
        match &self.kind {
            ScheduleKind::Fixed(lr) => *lr,
            ScheduleKind::Cycle(c) => c.lr_at(self.step),
        }
    }

    /// Advance one step; returns the new learning rate.
    pub fn step(&mut self) -> f64 {
        self.step += 1;
        self.current_lr()
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    pub fn set_step(&mut self, step: usize) {
        self.step = step;
    }
}

// ---------------------------------------------------------------------------
// AdamW with inspectable state
// ---------------------------------------------------------------------------

struct AdamSlot {
    name: String,
    var: Var,
    m: Tensor,
    v: Tensor,
}

/// Decoupled-weight-decay Adam over the named variables of a `VarMap`.
///
/// Same update as `candle_nn::AdamW`; the moment buffers are kept by name so
/// checkpoints can persist and restore them.
pub struct AdamW {
    params: ParamsAdamW,
    slots: Vec<AdamSlot>,
    step_t: usize,
}

impl AdamW {
    pub fn new(varmap: &VarMap, params: ParamsAdamW) -> Result<Self> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| anyhow!("parameter map lock poisoned"))?;
        let mut slots: Vec<AdamSlot> = Vec::with_capacity(data.len());
        for (name, var) in data.iter() {
            if var.dtype() != DType::F32 {
                continue;
            }
            let m = var.as_tensor().zeros_like()?;
            let v = var.as_tensor().zeros_like()?;
            slots.push(AdamSlot { name: name.clone(), var: var.clone(), m, v });
        }
        slots.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self { params, slots, step_t: 0 })
    }

    pub fn vars(&self) -> Vec<Var> {
        self.slots.iter().map(|s| s.var.clone()).collect()
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_t += 1;
        let p = &self.params;
        let lr_lambda = p.lr * p.weight_decay;
        let scale_m = 1.0 / (1.0 - p.beta1.powi(self.step_t as i32));
        let scale_v = 1.0 / (1.0 - p.beta2.powi(self.step_t as i32));
        for slot in self.slots.iter_mut() {
            let theta = slot.var.as_tensor();
            let Some(g) = grads.get(theta) else { continue };
            let m = ((&slot.m * p.beta1)? + (g * (1.0 - p.beta1))?)?;
            let v = ((&slot.v * p.beta2)? + (g.sqr()? * (1.0 - p.beta2))?)?;
            let m_hat = (&m * scale_m)?;
            let v_hat = (&v * scale_v)?;
            let next = ((theta * (1.0 - lr_lambda))?
                - (m_hat / (v_hat.sqrt()? + p.eps)?)?.affine(p.lr, 0.0)?)?;
            slot.var.set(&next)?;
            slot.m = m;
            slot.v = v;
        }
        Ok(())
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    pub fn step_count(&self) -> usize {
        self.step_t
    }

    /// Moment buffers keyed `m.<param>` / `v.<param>`.
    pub fn state(&self) -> Vec<(String, Tensor)> {
        let mut out = Vec::with_capacity(self.slots.len() * 2);
        for slot in &self.slots {
            out.push((format!("m.{}", slot.name), slot.m.clone()));
            out.push((format!("v.{}", slot.name), slot.v.clone()));
        }
        out
    }

    /// Restore moments saved by `state()`. Parameters absent from `state`
    /// keep zeroed moments.
    pub fn load_state(&mut self, state: &HashMap<String, Tensor>, step_t: usize) -> Result<usize> {
        let mut restored = 0usize;
        for slot in self.slots.iter_mut() {
            let m = state.get(&format!("m.{}", slot.name));
            let v = state.get(&format!("v.{}", slot.name));
            if let (Some(m), Some(v)) = (m, v) {
                anyhow::ensure!(
                    m.dims() == slot.m.dims() && v.dims() == slot.v.dims(),
                    "optimizer state for {} has shape {:?}, expected {:?}",
                    slot.name,
                    m.dims(),
                    slot.m.dims()
                );
                slot.m = m.to_device(slot.m.device())?;
                slot.v = v.to_device(slot.v.device())?;
                restored += 1;
            }
        }
        self.step_t = step_t;
        Ok(restored)
    }
}

pub fn adamw_params(config: &RunConfig, lr: f64) -> ParamsAdamW {
    ParamsAdamW {
        lr,
        weight_decay: config.weight_decay,
        beta1: 0.9,
        beta2: 0.999,
        eps: 1e-8,
    }
}

// ---------------------------------------------------------------------------
// Parameter counting
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParamCount {
    pub total: usize,
    pub tensors: usize,
}

/// Count parameters of a `VarMap` whose names start with `prefix`.
/// Fails when the map is unreadable.
pub fn count_params(varmap: &VarMap, prefix: &str) -> Result<ParamCount> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow!("parameter map lock poisoned"))?;
    let mut count = ParamCount { total: 0, tensors: 0 };
    for (_, var) in data.iter().filter(|(name, _)| name.starts_with(prefix)) {
        count.total += var.elem_count();
        count.tensors += 1;
    }
    Ok(count)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn small_varmap() -> Result<VarMap> {
        let varmap = VarMap::new();
        varmap.get(
            (4, 4),
            "w",
            candle_nn::Init::Randn { mean: 0.0, stdev: 0.1 },
            DType::F32,
            &Device::Cpu,
        )?;
        varmap.get((4,), "b", candle_nn::Init::Const(0.0), DType::F32, &Device::Cpu)?;
        Ok(varmap)
    }

    #[test]
    fn test_one_cycle_shape() {
        let c = OneCycle::new(3e-4, 100, 0.2);
        let start = c.lr_at(0);
        assert!((start - 3e-4 / 25.0).abs() < 1e-12, "start {start}");
        let peak = c.lr_at(19);
        assert!((peak - 3e-4).abs() < 1e-12, "peak {peak}");
        let end = c.lr_at(99);
        assert!((end - c.min_lr()).abs() < 1e-15, "end {end}");
        assert!(c.lr_at(10) > start && c.lr_at(10) < peak);
        assert!(c.lr_at(60) < peak && c.lr_at(60) > end);
        // Past the end it holds.
        assert_eq!(c.lr_at(500), c.lr_at(99));
    }

    #[test]
    fn test_one_cycle_bounds() {
        let c = OneCycle::new(1e-3, 50, 0.1);
        for s in 0..60 {
            let lr = c.lr_at(s);
            assert!(lr >= c.min_lr() - 1e-15 && lr <= 1e-3 + 1e-15, "step {s}: {lr}");
        }
    }

    #[test]
    fn test_one_cycle_tiny_warmup() {
        // pct_start * total < 1 must not divide by zero.
        let c = OneCycle::new(1e-3, 4, 0.1);
        assert!(c.lr_at(0).is_finite());
        assert!(c.lr_at(3).is_finite());
    }

    #[test]
    fn test_schedule_from_config() {
        let mut cfg = RunConfig::default();
        cfg.lr_scheduler = "fixed".into();
        let mut s = LrSchedule::from_config(&cfg);
        assert_eq!(s.current_lr(), cfg.initial_lr);
        assert_eq!(s.step(), cfg.initial_lr);

        cfg.lr_scheduler = "cycle".into();
        let mut s = LrSchedule::from_config(&cfg);
        let first = s.current_lr();
        assert!((first - cfg.max_lr / 25.0).abs() < 1e-12);
        s.step();
        assert!(s.current_lr() > first);
        assert_eq!(s.step_count(), 1);
    }

    #[test]
    fn test_adamw_moves_params_downhill() -> Result<()> {
        let varmap = small_varmap()?;
        let mut opt = AdamW::new(&varmap, ParamsAdamW { lr: 0.05, ..Default::default() })?;
        let vars = opt.vars();
        let loss_of = |vars: &[Var]| -> Result<Tensor> {
            let mut total = Tensor::new(0f32, &Device::Cpu)?;
            for v in vars {
                total = (total + v.as_tensor().sqr()?.sum_all()?)?;
            }
            Ok(total)
        };
        let before = loss_of(&vars)?.to_scalar::<f32>()?;
        for _ in 0..20 {
            let loss = loss_of(&vars)?;
            let grads = loss.backward()?;
            opt.step(&grads)?;
        }
        let after = loss_of(&vars)?.to_scalar::<f32>()?;
        assert!(after < before, "{before} -> {after}");
        assert_eq!(opt.step_count(), 20);
        Ok(())
    }

    #[test]
    fn test_adamw_state_roundtrip() -> Result<()> {
        let varmap = small_varmap()?;
        let mut opt = AdamW::new(&varmap, ParamsAdamW::default())?;
        let loss = opt.vars()[1].as_tensor().sqr()?.sum_all()?;
        opt.step(&loss.backward()?)?;

        let state: HashMap<String, Tensor> = opt.state().into_iter().collect();
        assert_eq!(state.len(), 4);

        let mut fresh = AdamW::new(&varmap, ParamsAdamW::default())?;
        let restored = fresh.load_state(&state, opt.step_count())?;
        assert_eq!(restored, 2);
        assert_eq!(fresh.step_count(), 1);
        for (name, t) in fresh.state() {
            let a: Vec<f32> = t.flatten_all()?.to_vec1()?;
            let b: Vec<f32> = state[&name].flatten_all()?.to_vec1()?;
            assert_eq!(a, b, "{name}");
        }
        Ok(())
    }

    #[test]
    fn test_count_params() -> Result<()> {
        let varmap = small_varmap()?;
        assert_eq!(count_params(&varmap, "")?, ParamCount { total: 20, tensors: 2 });
        assert_eq!(count_params(&varmap, "nothing.")?, ParamCount { total: 0, tensors: 0 });
        Ok(())
    }
}
