use candle_core::{Device, Tensor};
use image::DynamicImage;

use crate::{Message, Result};

/// Tensors handed to [`crate::ModelLike::generate`].
#[derive(Debug, Clone)]
pub struct ModelInputs {
    /// Token ids, shape `(1, seq_len)`, dtype `u32`.
    pub input_ids: Tensor,
    /// Normalized images, shape `(n_images, 3, height, width)`.
    pub pixel_values: Option<Tensor>,
}

impl ModelInputs {
    pub fn text(input_ids: Tensor) -> Self {
        Self {
            input_ids,
            pixel_values: None,
        }
    }

    pub fn seq_len(&self) -> candle_core::Result<usize> {
        let (_, seq_len) = self.input_ids.dims2()?;
        Ok(seq_len)
    }

    /// Moves every tensor onto `device`.
    pub fn to_device(&self, device: &Device) -> candle_core::Result<Self> {
        Ok(Self {
            input_ids: self.input_ids.to_device(device)?,
            pixel_values: self
                .pixel_values
                .as_ref()
                .map(|t| t.to_device(device))
                .transpose()?,
        })
    }
}

/// Converts raw text and images into model inputs, and token ids back to text.
pub trait Processor: Send + Sync {
    /// Renders `messages` into a prompt string, or `None` if this processor has
    /// no chat template.
    fn apply_chat_template(&self, messages: &[Message]) -> Option<String>;

    /// Rejects user text that would be read as control tokens rather than as
    /// plain text.
    fn check_text(&self, _text: &str) -> Result<()> {
        Ok(())
    }

    /// Tokenizes `prompt` and preprocesses `images`. Tensors are created on the
    /// CPU.
    fn process(&self, prompt: &str, images: &[DynamicImage]) -> Result<ModelInputs>;

    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_len_and_device_move() {
        let ids = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu).unwrap();
        let inputs = ModelInputs::text(ids);
        assert_eq!(inputs.seq_len().unwrap(), 3);
        let moved = inputs.to_device(&Device::Cpu).unwrap();
        assert!(moved.pixel_values.is_none());
        assert_eq!(moved.input_ids.to_vec2::<u32>().unwrap(), vec![vec![1, 2, 3]]);
    }
}
