// Diffusion prior: denoise a target embedding conditioned on another one.
//
// `MlpDiffusionPrior` is a compact stand-in for the DALLE-2 prior network:
//   - cosine beta schedule over `timesteps` steps
//   - the network predicts x0 directly, trained with MSE
//   - targets are multiplied by `image_embed_scale` (sqrt(dim) by default)
//   - the condition is zeroed per sample with probability `cond_drop_prob`
//   - sampling is deterministic DDIM over `sample_timesteps` strided steps

use crate::checkpoint::{assign_params, load_state_dict};
use crate::error::TrainError;
use crate::layers::{timestep_embedding, GradRmsNorm, ResidualBlock};
use anyhow::{anyhow, Result};
use candle_core::{Device, Module, Tensor};
use candle_nn::{linear, Linear, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::path::Path;
use std::sync::Mutex;

/// Parameter namespace of the prior inside a run's `VarMap`.
pub const PRIOR_PREFIX: &str = "prior";

pub struct PriorOutput {
    pub loss: Tensor,
    /// Reconstructed target in the caller's (unscaled) space.
    pub pred: Tensor,
}

pub trait DiffusionPrior: Send + Sync {
    fn embed_dim(&self) -> usize;

    /// One training-objective evaluation on `(cond, target)`, both `(B, D)`.
    /// `train` enables condition dropout.
    fn forward(&self, cond: &Tensor, target: &Tensor, train: bool) -> Result<PriorOutput>;

    /// Generate `(B, D)` embeddings for `cond`. Deterministic given `seed`.
    fn sample(&self, cond: &Tensor, seed: u64) -> Result<Tensor>;
}

#[derive(Debug, Clone, Copy)]
pub struct PriorConfig {
    pub dim: usize,
    pub depth: usize,
    pub hidden: usize,
    pub timesteps: usize,
    pub sample_timesteps: usize,
    pub cond_drop_prob: f64,
    pub image_embed_scale: f64,
}

/// Cumulative alpha products for the cosine schedule, one per timestep.
pub fn cosine_alphas_cumprod(timesteps: usize) -> Vec<f64> {
    let s = 0.008;
    let f = |t: f64| (((t / timesteps as f64) + s) / (1.0 + s) * std::f64::consts::FRAC_PI_2).cos().powi(2);
    let f0 = f(0.0);
    let mut out = Vec::with_capacity(timesteps);
    let mut acc = 1.0;
    for t in 0..timesteps {
        let beta = (1.0 - (f(t as f64 + 1.0) / f0) / (f(t as f64) / f0)).clamp(0.0, 0.999);
        acc *= 1.0 - beta;
        out.push(acc);
    }
    out
}

/// Evenly spaced timesteps from `timesteps - 1` down to 0.
pub fn sampling_steps(timesteps: usize, count: usize) -> Vec<usize> {
    let count = count.clamp(1, timesteps);
    if count == 1 {
        return vec![timesteps - 1];
    }
    let mut steps: Vec<usize> = (0..count)
        .map(|i| ((timesteps - 1) as f64 * i as f64 / (count - 1) as f64).round() as usize)
        .collect();
    steps.dedup();
    steps.reverse();
    steps
}

pub struct MlpDiffusionPrior {
    cfg: PriorConfig,
    input: Linear,
    blocks: Vec<ResidualBlock>,
    out_norm: GradRmsNorm,
    output: Linear,
    alphas_cumprod: Vec<f64>,
    rng: Mutex<StdRng>,
    device: Device,
}

impl MlpDiffusionPrior {
    pub fn new(cfg: PriorConfig, seed: u64, vb: VarBuilder) -> Result<Self> {
        let device = vb.device().clone();
        let vb = vb.pp(PRIOR_PREFIX);
        let mut blocks = Vec::with_capacity(cfg.depth);
        for i in 0..cfg.depth {
            blocks.push(ResidualBlock::new(cfg.hidden, 0.0, vb.pp(format!("block_{i}")))?);
        }
        Ok(Self {
            input: linear(3 * cfg.dim, cfg.hidden, vb.pp("input"))?,
            blocks,
            out_norm: GradRmsNorm::new(cfg.hidden, 1e-6, vb.pp("out_norm"))?,
            output: linear(cfg.hidden, cfg.dim, vb.pp("output"))?,
            alphas_cumprod: cosine_alphas_cumprod(cfg.timesteps),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            cfg,
            device,
        })
    }

    /// Overwrite the prior's parameters in `varmap` from a pretrained file.
    pub fn load_pretrained(varmap: &VarMap, path: &Path) -> Result<usize> {
        let state = load_state_dict(path)?;
        let n = assign_params(varmap, &state, &format!("{PRIOR_PREFIX}."))?;
        tracing::info!(path = %path.display(), params = n, "pretrained prior loaded");
        Ok(n)
    }

    pub fn config(&self) -> &PriorConfig {
        &self.cfg
    }

    fn denoise(&self, x_t: &Tensor, cond: &Tensor, timesteps: &[usize]) -> Result<Tensor> {
        let t_emb = timestep_embedding(timesteps, self.cfg.dim, &self.device)?;
        let h = Tensor::cat(&[x_t, cond, &t_emb], 1)?;
        let mut h = self.input.forward(&h)?.gelu()?;
        for block in &self.blocks {
            h = block.forward(&h, false)?;
        }
        let h = self.out_norm.forward(&h)?;
        self.output.forward(&h).map_err(Into::into)
    }

    fn gaussian(&self, rng: &mut StdRng, rows: usize) -> Result<Tensor> {
        let data: Vec<f32> = (0..rows * self.cfg.dim).map(|_| rng.sample(StandardNormal)).collect();
        Tensor::from_vec(data, (rows, self.cfg.dim), &self.device).map_err(Into::into)
    }

    fn column(&self, values: Vec<f32>) -> Result<Tensor> {
        let n = values.len();
        Tensor::from_vec(values, (n, 1), &self.device).map_err(Into::into)
    }

    fn check_dims(&self, t: &Tensor, what: &str) -> Result<usize> {
        let (b, d) = t.dims2()?;
        if d != self.cfg.dim {
            return Err(TrainError::ShapeMismatch(format!("prior {what} has width {d}, expected {}", self.cfg.dim)).into());
        }
        Ok(b)
    }
}

impl DiffusionPrior for MlpDiffusionPrior {
    fn embed_dim(&self) -> usize {
        self.cfg.dim
    }

    fn forward(&self, cond: &Tensor, target: &Tensor, train: bool) -> Result<PriorOutput> {
        let b = self.check_dims(target, "target")?;
        self.check_dims(cond, "condition")?;
        let scale = self.cfg.image_embed_scale;

        let (timesteps, noise, keep) = {
            let mut rng = self.rng.lock().map_err(|_| anyhow!("prior rng poisoned"))?;
            let timesteps: Vec<usize> = (0..b).map(|_| rng.gen_range(0..self.cfg.timesteps)).collect();
            let noise = self.gaussian(&mut *rng, b)?;
            let keep: Vec<f32> = (0..b)
                .map(|_| {
                    let drop = train && rng.gen::<f64>() < self.cfg.cond_drop_prob;
                    if drop { 0.0 } else { 1.0 }
                })
                .collect();
            (timesteps, noise, keep)
        };

        let x0 = (target * scale)?;
        let sa = self.column(timesteps.iter().map(|&t| self.alphas_cumprod[t].sqrt() as f32).collect())?;
        let s1a = self.column(timesteps.iter().map(|&t| (1.0 - self.alphas_cumprod[t]).sqrt() as f32).collect())?;
        let x_t = (x0.broadcast_mul(&sa)? + noise.broadcast_mul(&s1a)?)?;
        let cond = cond.broadcast_mul(&self.column(keep)?)?;

        let pred_x0 = self.denoise(&x_t, &cond, &timesteps)?;
        let loss = candle_nn::loss::mse(&pred_x0, &x0)?;
        let pred = (pred_x0 / scale)?;
        Ok(PriorOutput { loss, pred })
    }

    fn sample(&self, cond: &Tensor, seed: u64) -> Result<Tensor> {
        let b = self.check_dims(cond, "condition")?;
        let cond = cond.detach();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut x = self.gaussian(&mut rng, b)?;
        let steps = sampling_steps(self.cfg.timesteps, self.cfg.sample_timesteps);
        for (i, &t) in steps.iter().enumerate() {
            let x0 = self.denoise(&x, &cond, &vec![t; b])?.detach();
            let ab = self.alphas_cumprod[t];
            let ab_prev = steps.get(i + 1).map_or(1.0, |&n| self.alphas_cumprod[n]);
            let eps = ((&x - (&x0 * ab.sqrt())?)? / (1.0 - ab).sqrt().max(1e-12))?;
            x = ((&x0 * ab_prev.sqrt())? + (eps * (1.0 - ab_prev).sqrt())?)?;
        }
        (x / self.cfg.image_embed_scale).map_err(Into::into)
    }
}
