// Loss composition: NaN guard, InfoNCE contrastive term, alpha weighting.

use crate::config::AlphaSchedule;
use crate::error::TrainError;
use crate::eval::l2_normalize;
use anyhow::Result;
use candle_core::{DType, Tensor};

/// Default temperature of the InfoNCE term.
pub const NCE_TEMPERATURE: f64 = 0.1;

/// Fail with `InvalidLoss` when any element of `loss` is NaN.
pub fn check_loss(loss: &Tensor, stage: &'static str) -> Result<()> {
    let values: Vec<f32> = loss.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
    if values.iter().any(|v| v.is_nan()) {
        return Err(TrainError::InvalidLoss { stage }.into());
    }
    Ok(())
}

/// InfoNCE with in-batch negatives: row `i` of `query` should match row `i`
/// of `positive` against every other row. Inputs are normalised here.
pub fn info_nce(query: &Tensor, positive: &Tensor, temperature: f64) -> Result<Tensor> {
    let q = l2_normalize(query)?;
    let p = l2_normalize(positive)?;
    let logits = (q.matmul(&p.t()?)? / temperature)?;
    let n = logits.dim(0)?;
    let labels = Tensor::arange(0u32, n as u32, logits.device())?;
    candle_nn::loss::cross_entropy(&logits, &labels).map_err(Into::into)
}

/// Per-epoch weights of the prior loss. The contrastive term gets `1 - alpha`.
pub fn alpha_schedule(kind: AlphaSchedule, num_epochs: usize) -> Vec<f64> {
    match kind {
        AlphaSchedule::Constant => vec![0.01; num_epochs],
        AlphaSchedule::Linear => linspace(0.01, 0.05, num_epochs),
    }
}

/// Inclusive-endpoint linspace.
fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => (0..n)
            .map(|i| start + (end - start) * i as f64 / (n - 1) as f64)
            .collect(),
    }
}

/// `alpha * prior + (1 - alpha) * nce`
pub fn mix(prior: &Tensor, nce: &Tensor, alpha: f64) -> Result<Tensor> {
    let weighted = ((prior * alpha)? + (nce * (1.0 - alpha))?)?;
    Ok(weighted)
}
