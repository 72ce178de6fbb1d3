// Building blocks shared by the voxel encoder and the diffusion prior.

use anyhow::Result;
use candle_core::{Device, Module, Tensor, D};
use candle_nn::{linear, Linear, VarBuilder};

// ---------------------------------------------------------------------------
// Gradient-safe RmsNorm (candle_nn::RmsNorm has broken backward pass)
// ---------------------------------------------------------------------------

pub struct GradRmsNorm {
    weight: Tensor,
    eps: f64,
}

impl GradRmsNorm {
    pub fn new(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(dim, "weight", candle_nn::Init::Const(1.0))?;
        Ok(Self { weight, eps })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let variance = x.sqr()?.mean_keepdim(D::Minus1)?;
        let rms = (variance + self.eps)?.sqrt()?;
        let normed = x.broadcast_div(&rms)?;
        normed.broadcast_mul(&self.weight).map_err(Into::into)
    }
}

/// Inverted dropout, active only when `train` is set.
pub fn dropout(x: &Tensor, p: f32, train: bool) -> Result<Tensor> {
    if !train || p <= 0.0 {
        return Ok(x.clone());
    }
    candle_nn::ops::dropout(x, p).map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Residual MLP block: x + drop(gelu(lin(norm(x))))
// ---------------------------------------------------------------------------

pub struct ResidualBlock {
    norm: GradRmsNorm,
    lin: Linear,
    drop: f32,
}

impl ResidualBlock {
    pub fn new(dim: usize, drop: f32, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm: GradRmsNorm::new(dim, 1e-6, vb.pp("norm"))?,
            lin: linear(dim, dim, vb.pp("lin"))?,
            drop,
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.lin.forward(&self.norm.forward(x)?)?.gelu()?;
        let h = dropout(&h, self.drop, train)?;
        (x + h).map_err(Into::into)
    }
}

/// Sinusoidal embedding of integer timesteps: `(len(t), dim)`.
pub fn timestep_embedding(timesteps: &[usize], dim: usize, device: &Device) -> Result<Tensor> {
    let half = dim / 2;
    let freqs: Vec<f32> = (0..half)
        .map(|i| (-(10000f32.ln()) * i as f32 / half.max(1) as f32).exp())
        .collect();
    let mut data = Vec::with_capacity(timesteps.len() * dim);
    for &t in timesteps {
        let t = t as f32;
        data.extend(freqs.iter().map(|f| (t * f).sin()));
        data.extend(freqs.iter().map(|f| (t * f).cos()));
        // odd widths get one zero column
        if dim % 2 == 1 {
            data.push(0.0);
        }
    }
    Tensor::from_vec(data, (timesteps.len(), dim), device).map_err(Into::into)
}
