// Training-time embedding augmentation through the variation pipeline.

use crate::config::AugMode;
use crate::extractor::FeatureExtractor;
use crate::prior::DiffusionPrior;
use crate::variation::{guidance_batch, ImageVariation};
use anyhow::Result;
use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// One uniform draw per batch against `prob`; mode `n` never augments.
pub struct AugmentationPolicy {
    mode: AugMode,
    prob: f64,
    rng: StdRng,
}

impl AugmentationPolicy {
    pub fn new(mode: AugMode, prob: f64, seed: u64) -> Self {
        Self { mode, prob, rng: StdRng::seed_from_u64(seed) }
    }

    pub fn mode(&self) -> AugMode {
        self.mode
    }

    pub fn decide(&mut self) -> bool {
        match self.mode {
            AugMode::None => false,
            AugMode::X | AugMode::Y => self.rng.gen::<f64>() < self.prob,
        }
    }
}

/// An original image and the variation that replaced its embedding.
#[derive(Clone)]
pub struct AugmentedPair {
    pub original: Tensor,
    pub augmented: Tensor,
}

/// Result of applying augmentation to one batch.
pub struct Augmented {
    pub cond: Tensor,
    pub target: Tensor,
    /// `(originals, variation images)` for the pairs grid.
    pub images: (Tensor, Tensor),
}

/// Mode `x`: keep the target, condition on the embedding of a variation.
pub fn augment_condition(
    images: &Tensor,
    target: &Tensor,
    extractor: &dyn FeatureExtractor,
    variation: &dyn ImageVariation,
    size: usize,
) -> Result<Augmented> {
    let varied = variation.vary(images, size)?;
    let cond = extractor.embed_image(&varied)?;
    Ok(Augmented { cond, target: target.clone(), images: (images.clone(), varied) })
}

/// Mode `y`: keep the condition, run the prior once and regenerate the target
/// from the guidance batch `[zeros; pred]`.
pub fn augment_target(
    images: &Tensor,
    cond: &Tensor,
    target: &Tensor,
    prior: &dyn DiffusionPrior,
    extractor: &dyn FeatureExtractor,
    variation: &dyn ImageVariation,
    size: usize,
) -> Result<Augmented> {
    let pred = prior.forward(cond, target, false)?.pred.detach();
    let generated = variation.generate(&guidance_batch(&pred)?, size)?;
    let target = extractor.embed_image(&generated)?;
    Ok(Augmented { cond: cond.clone(), target, images: (images.clone(), generated) })
}
