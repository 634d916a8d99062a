//! SigLIP vision tower and the projector into the text embedding space.

use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::siglip;

use super::config::{Config, VisionConfig};
use super::text::RmsNorm;

/// SigLIP encoder without the pooling head; yields post-layernorm patch
/// states.
pub struct VisionTower {
    model: siglip::VisionModel,
}

impl VisionTower {
    pub fn new(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let model = siglip::VisionModel::new(&cfg.siglip(), false, vb)?;
        Ok(Self { model })
    }
}

impl Module for VisionTower {
    /// `(n_images, 3, size, size)` to `(n_images, num_patches, hidden)`.
    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        self.model.forward(pixel_values)
    }
}

/// Pools the patch grid down to the per-image token budget and projects it
/// into the text hidden size.
pub struct Projector {
    soft_emb_norm: RmsNorm,
    input_projection: Tensor,
    patches_per_side: usize,
    tokens_per_side: usize,
}

impl Projector {
    pub fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let vision = &cfg.vision_config;
        let tokens_per_side = (cfg.mm_tokens_per_image as f64).sqrt() as usize;
        if tokens_per_side * tokens_per_side != cfg.mm_tokens_per_image
            || vision.patches_per_side() % tokens_per_side != 0
        {
            candle_core::bail!(
                "cannot pool {} patches per side into {} image tokens",
                vision.patches_per_side(),
                cfg.mm_tokens_per_image
            );
        }
        Ok(Self {
            soft_emb_norm: RmsNorm::new(
                vision.hidden_size,
                vision.layer_norm_eps,
                vb.pp("mm_soft_emb_norm"),
            )?,
            input_projection: vb.get(
                (vision.hidden_size, cfg.text_config.hidden_size),
                "mm_input_projection_weight",
            )?,
            patches_per_side: vision.patches_per_side(),
            tokens_per_side,
        })
    }

    pub fn tokens_per_image(&self) -> usize {
        self.tokens_per_side * self.tokens_per_side
    }
}

impl Module for Projector {
    /// `(n_images, num_patches, vision_hidden)` to
    /// `(n_images, tokens_per_image, text_hidden)`.
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, _, d) = xs.dims3()?;
        let kernel = self.patches_per_side / self.tokens_per_side;
        let pooled = xs
            .transpose(1, 2)?
            .reshape((b, d, self.patches_per_side, self.patches_per_side))?
            .avg_pool2d(kernel)?
            .flatten_from(2)?
            .transpose(1, 2)?;
        let normed = self.soft_emb_norm.forward(&pooled)?;
        normed.broadcast_matmul(&self.input_projection)
    }
}
