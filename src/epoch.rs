// One epoch of training and validation.
//
// The run state goes in and comes back out of `Trainer::run_epoch`; the
// trainer owns the models, the optimizer, the LR schedule and the
// augmentation policy for one replica.

use crate::augment::{augment_condition, augment_target, AugmentationPolicy, Augmented, AugmentedPair};
use crate::checkpoint::{CheckpointPolicy, CheckpointWriter, EpochCheckpoint, LoadedCheckpoint};
use crate::config::{AugMode, RunConfig};
use crate::data::{Batch, BatchSource};
use crate::distributed::{all_reduce_grads, broadcast_params, ProcessGroup};
use crate::eval::{batchwise_cosine_similarity, cosine_similarity, diagonal_topk, mean};
use crate::imaging::{make_grid, resize_area};
use crate::loss::{alpha_schedule, check_loss, info_nce, mix, NCE_TEMPERATURE};
use crate::models::Models;
use crate::state::RunState;
use crate::telemetry::MetricLog;
use crate::training::{adamw_params, AdamW, LrSchedule};
use crate::variation::guidance_batch;
use anyhow::Result;
use candle_core::{Device, Tensor, Var};
use image::RgbImage;
use std::sync::Arc;

/// Metrics of one batch.
#[derive(Debug, Clone, Copy)]
pub struct StepMetrics {
    pub loss: f32,
    pub loss_prior: f32,
    pub loss_nce: Option<f32>,
    pub sim: f32,
    pub sim_base: f32,
    pub fwd_pct_correct: f32,
    pub bwd_pct_correct: f32,
    pub augmented: bool,
    /// Learning rate the step ran with (train only).
    pub lr: f64,
}

/// Per-pass lists, one entry per batch.
#[derive(Debug, Clone, Default)]
pub struct PassStats {
    pub losses: Vec<f32>,
    pub prior_losses: Vec<f32>,
    pub nce_losses: Vec<f32>,
    pub sims: Vec<f32>,
    pub base_sims: Vec<f32>,
    pub fwd: Vec<f32>,
    pub bwd: Vec<f32>,
}

impl PassStats {
    fn push(&mut self, m: &StepMetrics) {
        self.losses.push(m.loss);
        self.prior_losses.push(m.loss_prior);
        if let Some(nce) = m.loss_nce {
            self.nce_losses.push(nce);
        }
        self.sims.push(m.sim);
        self.base_sims.push(m.sim_base);
        self.fwd.push(m.fwd_pct_correct);
        self.bwd.push(m.bwd_pct_correct);
    }
}

#[derive(Default)]
pub struct EpochStats {
    pub train: PassStats,
    pub val: PassStats,
    pub loss_on_aug: Vec<f32>,
    pub loss_off_aug: Vec<f32>,
    pub alpha: f64,
    pub last_lr: f64,
    /// First augmented batch of the epoch, for the pairs grid.
    pub aug_pair: Option<AugmentedPair>,
}

impl EpochStats {
    pub fn mean_val_loss(&self) -> f32 {
        mean(&self.val.losses)
    }

    /// Epoch metric map. `val_loss` is the replica-mean validation loss.
    pub fn metrics(&self, state: &RunState, val_loss: f32, contrastive: bool) -> MetricLog {
        let mut m = MetricLog::new();
        let mut put = |k: &str, v: f64| {
            m.insert(k.to_string(), v);
        };
        put("train/loss", mean(&self.train.losses) as f64);
        put("val/loss", val_loss as f64);
        put("train/lr", self.last_lr);
        put("train/num_steps", state.train_losses.len() as f64);
        put("train/cosine_sim", mean(&self.train.sims) as f64);
        put("val/cosine_sim", mean(&self.val.sims) as f64);
        put("train/cosine_sim_base", mean(&self.train.base_sims) as f64);
        put("val/cosine_sim_base", mean(&self.val.base_sims) as f64);
        put("train/fwd_pct_correct", mean(&self.train.fwd) as f64);
        put("train/bwd_pct_correct", mean(&self.train.bwd) as f64);
        put("val/val_fwd_pct_correct", mean(&self.val.fwd) as f64);
        put("val/val_bwd_pct_correct", mean(&self.val.bwd) as f64);
        put("train/loss_prior", mean(&self.train.prior_losses) as f64);
        put("val/loss_prior", mean(&self.val.prior_losses) as f64);
        if contrastive {
            put("train/loss_nce", mean(&self.train.nce_losses) as f64);
            put("val/loss_nce", mean(&self.val.nce_losses) as f64);
            put("train/alpha", self.alpha);
        }
        put("train/loss_on_aug", mean(&self.loss_on_aug) as f64);
        put("train/loss_off_aug", mean(&self.loss_off_aug) as f64);
        m
    }
}

fn scalar(t: &Tensor) -> Result<f32> {
    Ok(t.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?)
}

pub struct Trainer {
    models: Models,
    optimizer: AdamW,
    vars: Vec<Var>,
    scheduler: LrSchedule,
    policy: AugmentationPolicy,
    alphas: Vec<f64>,
    contrastive: bool,
    variation_size: usize,
    n_aug_save: usize,
    group: Arc<dyn ProcessGroup>,
    device: Device,
}

impl Trainer {
    /// Wire up the optimizer and schedule and sync parameters from the primary.
    pub fn new(models: Models, config: &RunConfig, group: Arc<dyn ProcessGroup>, device: Device) -> Result<Self> {
        let scheduler = LrSchedule::from_config(config);
        let optimizer = AdamW::new(&models.varmap, adamw_params(config, scheduler.current_lr()))?;
        let vars = optimizer.vars();
        broadcast_params(group.as_ref(), &vars)?;
        let seed = config.seed.wrapping_add(group.rank() as u64);
        Ok(Self {
            models,
            optimizer,
            vars,
            scheduler,
            policy: AugmentationPolicy::new(config.aug_mode(), config.clip_aug_prob, seed),
            alphas: alpha_schedule(config.alpha_schedule(), config.num_epochs),
            contrastive: config.contrastive_loss,
            variation_size: config.variation_size,
            n_aug_save: config.n_aug_save,
            group,
            device,
        })
    }

    /// Restore parameters, optimizer moments and the schedule position.
    pub fn restore(&mut self, ckpt: &LoadedCheckpoint) -> Result<()> {
        ckpt.restore(&self.models.varmap, &mut self.optimizer)?;
        self.scheduler.set_step(ckpt.state.scheduler_step);
        broadcast_params(self.group.as_ref(), &self.vars)?;
        Ok(())
    }

    fn alpha(&self, epoch: usize) -> f64 {
        self.alphas.get(epoch).or(self.alphas.last()).copied().unwrap_or(0.01)
    }

    fn encode(&self, voxels: &Tensor, train: bool) -> Result<Tensor> {
        let pred = self.models.encoder.encode(voxels, train)?;
        Ok(if self.models.encoder_trainable { pred } else { pred.detach() })
    }

    /// Prior + optional contrastive loss. Every loss is NaN-checked.
    fn losses(
        &self,
        pred: &Tensor,
        cond: &Tensor,
        target: &Tensor,
        alpha: f64,
        train: bool,
    ) -> Result<(Tensor, Tensor, Option<Tensor>, Tensor)> {
        let (prior_stage, nce_stage) = if train { ("train/prior", "train/nce") } else { ("val/prior", "val/nce") };
        let out = self.models.prior.forward(cond, target, train)?;
        check_loss(&out.loss, prior_stage)?;
        if !self.contrastive {
            return Ok((out.loss.clone(), out.loss, None, out.pred));
        }
        let nce = info_nce(pred, target, NCE_TEMPERATURE)?;
        check_loss(&nce, nce_stage)?;
        let total = mix(&out.loss, &nce, alpha)?;
        Ok((total, out.loss, Some(nce), out.pred))
    }

    fn step_metrics(
        &self,
        loss: &Tensor,
        loss_prior: &Tensor,
        loss_nce: Option<&Tensor>,
        recon: &Tensor,
        pred: &Tensor,
        target: &Tensor,
    ) -> Result<StepMetrics> {
        let recon = recon.detach();
        let pred = pred.detach();
        // retrieval is scored on the voxel embedding: rows are targets
        let sims = batchwise_cosine_similarity(target, &pred)?;
        Ok(StepMetrics {
            loss: scalar(loss)?,
            loss_prior: scalar(loss_prior)?,
            loss_nce: loss_nce.map(scalar).transpose()?,
            sim: cosine_similarity(&recon, target)?,
            sim_base: cosine_similarity(&pred, target)?,
            fwd_pct_correct: diagonal_topk(&sims, 1)?,
            bwd_pct_correct: diagonal_topk(&sims.t()?, 1)?,
            augmented: false,
            lr: 0.0,
        })
    }

    /// One optimizer step. Fails with `InvalidLoss` before touching parameters.
    pub fn train_step(&mut self, batch: &Batch, alpha: f64) -> Result<(StepMetrics, Option<Augmented>)> {
        let batch = batch.to_device(&self.device)?;
        let target = self.models.extractor.embed_image(&batch.images)?;
        let pred = self.encode(&batch.voxels, true)?;

        let m = &self.models;
        let augmented = match (self.policy.decide(), self.policy.mode()) {
            (true, AugMode::X) => Some(augment_condition(
                &batch.images,
                &target,
                m.extractor.as_ref(),
                m.variation.as_ref(),
                self.variation_size,
            )?),
            (true, AugMode::Y) => Some(augment_target(
                &batch.images,
                &pred,
                &target,
                m.prior.as_ref(),
                m.extractor.as_ref(),
                m.variation.as_ref(),
                self.variation_size,
            )?),
            _ => None,
        };
        let (cond, target) = match &augmented {
            Some(a) => (a.cond.clone(), a.target.clone()),
            None => (pred.clone(), target),
        };

        let (loss, loss_prior, loss_nce, recon) = self.losses(&pred, &cond, &target, alpha, true)?;
        check_loss(&loss, "train/loss")?;

        let lr = self.scheduler.current_lr();
        self.optimizer.set_learning_rate(lr);
        let mut grads = loss.backward()?;
        all_reduce_grads(self.group.as_ref(), &self.vars, &mut grads)?;
        self.optimizer.step(&grads)?;
        self.scheduler.step();

        let mut metrics = self.step_metrics(&loss, &loss_prior, loss_nce.as_ref(), &recon, &pred, &target)?;
        metrics.augmented = augmented.is_some();
        metrics.lr = lr;
        Ok((metrics, augmented))
    }

    pub fn val_step(&self, batch: &Batch, alpha: f64) -> Result<StepMetrics> {
        let batch = batch.to_device(&self.device)?;
        let target = self.models.extractor.embed_image(&batch.images)?;
        let pred = self.encode(&batch.voxels, false)?.detach();
        let (loss, loss_prior, loss_nce, recon) = self.losses(&pred, &pred, &target, alpha, false)?;
        check_loss(&loss, "val/loss")?;
        self.step_metrics(&loss, &loss_prior, loss_nce.as_ref(), &recon, &pred, &target)
    }

    /// Train then validate once. Histories in `state` grow by one entry per batch.
    pub fn run_epoch(
        &mut self,
        epoch: usize,
        mut state: RunState,
        train: &dyn BatchSource,
        val: &dyn BatchSource,
    ) -> Result<(RunState, EpochStats)> {
        let alpha = self.alpha(epoch);
        let mut stats = EpochStats { alpha, last_lr: self.scheduler.current_lr(), ..EpochStats::default() };

        for batch in train.batches(epoch) {
            let (m, augmented) = self.train_step(&batch?, alpha)?;
            stats.train.push(&m);
            if m.augmented {
                stats.loss_on_aug.push(m.loss);
            } else {
                stats.loss_off_aug.push(m.loss);
            }
            if let Some(a) = augmented {
                if stats.aug_pair.is_none() && self.n_aug_save > 0 {
                    stats.aug_pair = Some(AugmentedPair {
                        original: a.images.0.narrow(0, 0, self.n_aug_save.min(a.images.0.dim(0)?))?,
                        augmented: a.images.1.narrow(0, 0, self.n_aug_save.min(a.images.1.dim(0)?))?,
                    });
                }
            }
            stats.last_lr = m.lr;
            state.train_losses.push(m.loss);
            state.lrs.push(m.lr);
            state.train_sims.push(m.sim);
        }

        for batch in val.batches(epoch) {
            let m = self.val_step(&batch?, alpha)?;
            stats.val.push(&m);
            state.val_losses.push(m.loss);
            state.val_sims.push(m.sim);
        }

        state.epoch = epoch;
        state.scheduler_step = self.scheduler.step_count();
        state.optimizer_step = self.optimizer.step_count();
        Ok((state, stats))
    }

    /// Checkpoint selection on the replica-mean of the validation losses the
    /// epoch just produced. Returns that mean with what was written.
    pub fn checkpoint_epoch(
        &self,
        writer: &CheckpointWriter,
        policy: &CheckpointPolicy,
        stats: &EpochStats,
        state: &mut RunState,
    ) -> Result<(f32, EpochCheckpoint)> {
        let val_loss = self.group.all_reduce_mean_scalar(stats.mean_val_loss())?;
        let out = writer.end_of_epoch(policy, val_loss, state, &self.models.varmap, &self.optimizer)?;
        Ok((val_loss, out))
    }

    /// One grid per record: original | decoded ground-truth embedding |
    /// decoded prior sample from the voxel embedding.
    pub fn sample_grids(&self, batch: &Batch, n: usize, seed: u64) -> Result<Vec<RgbImage>> {
        let batch = batch.head(n)?.to_device(&self.device)?;
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let size = self.variation_size;
        let m = &self.models;
        let target = m.extractor.embed_image(&batch.images)?;
        let truth = m.variation.generate(&guidance_batch(&target)?, size)?;
        let voxel_emb = self.encode(&batch.voxels, false)?.detach();
        let sampled = m.prior.sample(&voxel_emb, seed)?;
        let from_prior = m.variation.generate(&guidance_batch(&sampled)?, size)?;
        let originals = resize_area(&batch.images, size, size)?;

        let mut grids = Vec::with_capacity(batch.len());
        for i in 0..batch.len() {
            let row = Tensor::cat(
                &[originals.narrow(0, i, 1)?, truth.narrow(0, i, 1)?, from_prior.narrow(0, i, 1)?],
                0,
            )?;
            grids.push(make_grid(&row, 3, 2)?);
        }
        Ok(grids)
    }
}
