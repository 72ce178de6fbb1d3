// Frozen image-variation pipeline, used for sampling and augmentation only.
//
// `ProjectionVariation` decodes embeddings through the transpose of the
// extractor's projection onto the 16x16 grid, then upsamples. Classifier-free
// guidance combines the unconditional and conditional halves of a guidance
// batch as `uncond + g * (cond - uncond)`.

use crate::error::TrainError;
use crate::extractor::{pool_to_grid, PooledProjectionExtractor, GRID};
use anyhow::{anyhow, Result};
use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::sync::Mutex;

pub trait ImageVariation: Send + Sync {
    /// A variation of each image in `(B, 3, H, W)`, returned at `size x size`.
    fn vary(&self, images: &Tensor, size: usize) -> Result<Tensor>;

    /// Decode a guidance batch `(2B, 1, D)` laid out `[unconditional; conditional]`
    /// into `(B, 3, size, size)` images.
    fn generate(&self, guidance: &Tensor, size: usize) -> Result<Tensor>;
}

pub struct ProjectionVariation {
    weight: Tensor,
    bias: Tensor,
    guidance_scale: f64,
    noise_std: f64,
    rng: Mutex<StdRng>,
}

impl ProjectionVariation {
    pub fn from_extractor(extractor: &PooledProjectionExtractor, guidance_scale: f64, seed: u64) -> Self {
        let (w, b) = extractor.projection();
        Self {
            weight: w.clone(),
            bias: b.clone(),
            guidance_scale,
            noise_std: 0.05,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn decode(&self, embeds: &Tensor) -> Result<Tensor> {
        let b = embeds.dim(0)?;
        let flat = embeds.broadcast_sub(&self.bias)?.matmul(&self.weight)?;
        let grid = (flat + 0.5)?.reshape((b, 3, GRID, GRID))?;
        grid.clamp(0.0, 1.0).map_err(Into::into)
    }
}

fn upsample(grid: &Tensor, size: usize) -> Result<Tensor> {
    if size % GRID != 0 {
        return Err(TrainError::ShapeMismatch(format!("variation size {size} is not a multiple of {GRID}")).into());
    }
    grid.upsample_nearest2d(size, size).map_err(Into::into)
}

impl ImageVariation for ProjectionVariation {
    fn vary(&self, images: &Tensor, size: usize) -> Result<Tensor> {
        let grid = pool_to_grid(&images.detach())?;
        let noise: Vec<f32> = {
            let mut rng = self.rng.lock().map_err(|_| anyhow!("variation rng poisoned"))?;
            (0..grid.elem_count()).map(|_| rng.sample::<f32, _>(StandardNormal)).collect()
        };
        let noise = (Tensor::from_vec(noise, grid.dims(), grid.device())? * self.noise_std)?;
        let varied = (grid + noise)?.clamp(0.0, 1.0)?;
        upsample(&varied, size)
    }

    fn generate(&self, guidance: &Tensor, size: usize) -> Result<Tensor> {
        let embeds = match guidance.rank() {
            3 => guidance.squeeze(1)?,
            2 => guidance.clone(),
            _ => return Err(TrainError::ShapeMismatch(format!("guidance batch {:?}", guidance.dims())).into()),
        };
        let n = embeds.dim(0)?;
        if n % 2 != 0 {
            return Err(TrainError::ShapeMismatch(format!("guidance batch of {n} rows is not [uncond; cond]")).into());
        }
        let half = n / 2;
        let uncond = embeds.narrow(0, 0, half)?;
        let cond = embeds.narrow(0, half, half)?;
        let guided = (&uncond + ((cond - &uncond)? * self.guidance_scale)?)?;
        upsample(&self.decode(&guided.detach())?, size)
    }
}

/// `[zeros_like(pred); pred]` with a singleton token axis: `(2B, 1, D)`.
pub fn guidance_batch(pred: &Tensor) -> Result<Tensor> {
    Tensor::cat(&[&pred.zeros_like()?, pred], 0)?.unsqueeze(1).map_err(Into::into)
}
