// Embedding similarity and retrieval metrics.
//
// cosine_similarity     row-wise, mean over the batch
// batchwise_cosine      (B, B) similarity matrix between two embedding sets
// topk                  retrieval accuracy against the diagonal ground truth

use anyhow::Result;
use candle_core::{Tensor, D};

const COSINE_EPS: f64 = 1e-8;

/// L2-normalise along the last dimension.
pub fn l2_normalize(x: &Tensor) -> Result<Tensor> {
    let norm = x.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
    let norm = norm.maximum(COSINE_EPS)?;
    x.broadcast_div(&norm).map_err(Into::into)
}

/// Mean over the batch of the row-wise cosine similarity between `a` and `b`.
pub fn cosine_similarity(a: &Tensor, b: &Tensor) -> Result<f32> {
    let dot = (a * b)?.sum(D::Minus1)?;
    let na = a.sqr()?.sum(D::Minus1)?.sqrt()?;
    let nb = b.sqr()?.sum(D::Minus1)?.sqrt()?;
    let denom = (na * nb)?.maximum(COSINE_EPS)?;
    let sims = (dot / denom)?;
    Ok(sims.mean_all()?.to_scalar::<f32>()?)
}

/// Cosine similarity of every row of `a` against every row of `b`: `(Ba, Bb)`.
pub fn batchwise_cosine_similarity(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let a = l2_normalize(a)?;
    let b = l2_normalize(b)?;
    a.matmul(&b.t()?).map_err(Into::into)
}

/// Fraction of rows whose ground-truth column is among the `k` highest scores.
///
/// `labels[i]` is the correct column for row `i`; with `arange(B)` this is the
/// diagonal. `k` is capped at the number of rows. Result is in `[0, 1]`.
pub fn topk(similarities: &Tensor, labels: &[usize], k: usize) -> Result<f32> {
    let rows: Vec<Vec<f32>> = similarities.to_vec2()?;
    if rows.is_empty() {
        return Ok(0.0);
    }
    let k = k.min(rows.len()).max(1);
    let mut hits = 0usize;
    for (row, &label) in rows.iter().zip(labels) {
        let target = row[label];
        // Rank = number of strictly better candidates; ties resolve in favour of the label.
        let better = row.iter().filter(|&&s| s > target).count();
        if better < k {
            hits += 1;
        }
    }
    Ok(hits as f32 / labels.len() as f32)
}

/// Top-k accuracy with the diagonal as ground truth.
pub fn diagonal_topk(similarities: &Tensor, k: usize) -> Result<f32> {
    let n = similarities.dim(0)?;
    let labels: Vec<usize> = (0..n).collect();
    topk(similarities, &labels, k)
}

/// Mean of a slice; NaN when empty.
pub fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return f32::NAN;
    }
    values.iter().sum::<f32>() / values.len() as f32
}

/// Mean of the last `n` values.
pub fn tail_mean(values: &[f32], n: usize) -> f32 {
    let start = values.len().saturating_sub(n);
    mean(&values[start..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_self_similarity_is_one() -> Result<()> {
        let x = Tensor::randn(0f32, 1.0, (6, 32), &Device::Cpu)?;
        let sim = cosine_similarity(&x, &x)?;
        assert!((sim - 1.0).abs() < 1e-5, "self similarity {sim}");
        Ok(())
    }

    #[test]
    fn test_opposite_vectors() -> Result<()> {
        let x = Tensor::new(&[[1f32, 2.0, 3.0]], &Device::Cpu)?;
        let y = x.neg()?;
        assert!((cosine_similarity(&x, &y)? + 1.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_top1_exact_match_is_perfect() -> Result<()> {
        let x = Tensor::randn(0f32, 1.0, (8, 16), &Device::Cpu)?;
        let sims = batchwise_cosine_similarity(&x, &x)?;
        assert_eq!(diagonal_topk(&sims, 1)?, 1.0);
        Ok(())
    }

    #[test]
    fn test_topk_in_unit_interval() -> Result<()> {
        let a = Tensor::randn(0f32, 1.0, (10, 16), &Device::Cpu)?;
        let b = Tensor::randn(0f32, 1.0, (10, 16), &Device::Cpu)?;
        let sims = batchwise_cosine_similarity(&a, &b)?;
        for k in [1, 3, 10, 50] {
            let acc = diagonal_topk(&sims, k)?;
            assert!((0.0..=1.0).contains(&acc), "k={k} acc={acc}");
        }
        // k >= batch always hits
        assert_eq!(diagonal_topk(&sims, 10)?, 1.0);
        Ok(())
    }

    #[test]
    fn test_topk_counts_misses() -> Result<()> {
        // Row 0 ranks its label first, row 1 ranks it last.
        let sims = Tensor::new(&[[0.9f32, 0.1], [0.8, 0.2]], &Device::Cpu)?;
        assert_eq!(diagonal_topk(&sims, 1)?, 0.5);
        assert_eq!(diagonal_topk(&sims, 2)?, 1.0);
        Ok(())
    }

    #[test]
    fn test_batchwise_shape() -> Result<()> {
        let a = Tensor::randn(0f32, 1.0, (3, 8), &Device::Cpu)?;
        let b = Tensor::randn(0f32, 1.0, (5, 8), &Device::Cpu)?;
        assert_eq!(batchwise_cosine_similarity(&a, &b)?.dims(), &[3, 5]);
        Ok(())
    }

    #[test]
    fn test_means() {
        assert!(mean(&[]).is_nan());
        assert_eq!(mean(&[1.0, 3.0]), 2.0);
        assert_eq!(tail_mean(&[10.0, 1.0, 3.0], 2), 2.0);
        assert_eq!(tail_mean(&[4.0], 5), 4.0);
    }
}
