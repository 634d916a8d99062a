use std::collections::HashSet;

use candle_core::{DType, Device, Tensor};
use image::{imageops::FilterType, DynamicImage};
use tokenizers::Tokenizer;

use super::config::Config;
use crate::{ChatTemplate, Error, Message, ModelInputs, Processor, Result};

const IMAGE_SOFT_TOKEN: &str = "<image_soft_token>";
const END_OF_IMAGE: &str = "<end_of_image>";
const CONTROL_TOKENS: [&str; 8] = [
    "<pad>",
    "<bos>",
    "<eos>",
    "<start_of_turn>",
    "<end_of_turn>",
    "<start_of_image>",
    END_OF_IMAGE,
    IMAGE_SOFT_TOKEN,
];

/// Tokenizer plus image preprocessing for Gemma 3 checkpoints.
pub struct MedGemmaProcessor {
    tokenizer: Tokenizer,
    template: Option<ChatTemplate>,
    /// Ids of special tokens, which user text may not produce.
    reserved: HashSet<u32>,
    image_token_id: u32,
    image_size: usize,
    tokens_per_image: usize,
}

impl MedGemmaProcessor {
    pub fn new(tokenizer: Tokenizer, config: &Config) -> Self {
        let template = ChatTemplate::from_tokenizer(&tokenizer);
        if template.is_none() {
            tracing::warn!("tokenizer has no turn markers, prompts are sent as raw text");
        }
        // Text outside the vocabulary may still map to <unk>.
        let mut reserved: HashSet<u32> = tokenizer
            .get_added_tokens_decoder()
            .into_iter()
            .filter(|(_, token)| token.special && token.content != "<unk>")
            .map(|(id, _)| id)
            .collect();
        reserved.extend(CONTROL_TOKENS.iter().filter_map(|t| tokenizer.token_to_id(t)));
        Self {
            tokenizer,
            template,
            reserved,
            image_token_id: config.image_token_index,
            image_size: config.vision_config.image_size,
            tokens_per_image: config.mm_tokens_per_image,
        }
    }
}

impl Processor for MedGemmaProcessor {
    fn apply_chat_template(&self, messages: &[Message]) -> Option<String> {
        self.template.as_ref().map(|t| t.render(messages, true))
    }

    fn check_text(&self, text: &str) -> Result<()> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| Error::inference(anyhow::Error::msg(e)))?;
        let reserved = encoding
            .get_ids()
            .iter()
            .position(|id| self.reserved.contains(id));
        match reserved {
            Some(pos) => Err(Error::validation(format!(
                "prompt text contains the reserved token {}",
                encoding.get_tokens()[pos]
            ))),
            None => Ok(()),
        }
    }

    fn process(&self, prompt: &str, images: &[DynamicImage]) -> Result<ModelInputs> {
        let markers = self.template.clone().unwrap_or_else(ChatTemplate::gemma);
        let text = if images.is_empty() {
            prompt.to_string()
        } else {
            expand_image_tokens(prompt, images.len(), &markers.image_marker, self.tokens_per_image)?
        };

        // A rendered template already starts with <bos>.
        let add_special_tokens = !text.starts_with(&markers.bos);
        let encoding = self
            .tokenizer
            .encode(text.as_str(), add_special_tokens)
            .map_err(|e| Error::inference(anyhow::Error::msg(e)))?;
        let ids = encoding.get_ids();
        let slots = super::image_spans(ids, self.image_token_id);
        if slots.len() != images.len() {
            return Err(Error::validation(format!(
                "prompt has {} image slots but {} images were supplied",
                slots.len(),
                images.len()
            )));
        }
        if let Some(slot) = slots.iter().find(|s| s.len() != self.tokens_per_image) {
            return Err(Error::validation(format!(
                "image slot has {} tokens, expected {}",
                slot.len(),
                self.tokens_per_image
            )));
        }
        let input_ids = Tensor::new(ids, &Device::Cpu)?.unsqueeze(0)?;

        let pixel_values = if images.is_empty() {
            None
        } else {
            let images = images
                .iter()
                .map(|img| preprocess_image(img, self.image_size))
                .collect::<candle_core::Result<Vec<_>>>()?;
            Some(Tensor::stack(&images, 0)?)
        };

        Ok(ModelInputs {
            input_ids,
            pixel_values,
        })
    }

    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.tokenizer
            .decode(tokens, skip_special_tokens)
            .map_err(|e| Error::inference(anyhow::Error::msg(e)))
    }
}

/// Replaces every image marker with the marker, `tokens_per_image` soft
/// tokens and the closing marker. Without any marker in `prompt`, one per
/// image is prepended.
pub fn expand_image_tokens(
    prompt: &str,
    n_images: usize,
    image_marker: &str,
    tokens_per_image: usize,
) -> Result<String> {
    let found = prompt.matches(image_marker).count();
    let prompt = if found == 0 {
        format!("{}{prompt}", image_marker.repeat(n_images))
    } else if found == n_images {
        prompt.to_string()
    } else {
        return Err(Error::validation(format!(
            "prompt has {found} image placeholders but {n_images} images were supplied"
        )));
    };
    let expanded = format!(
        "\n\n{image_marker}{}{END_OF_IMAGE}\n\n",
        IMAGE_SOFT_TOKEN.repeat(tokens_per_image)
    );
    Ok(prompt.replace(image_marker, &expanded))
}

/// Resizes to `size`×`size` (bilinear) and scales pixels to `[-1, 1]`.
/// Returns a `(3, size, size)` f32 tensor.
pub fn preprocess_image(img: &DynamicImage, size: usize) -> candle_core::Result<Tensor> {
    let img = img
        .resize_exact(size as u32, size as u32, FilterType::Triangle)
        .to_rgb8();
    let data = img.into_raw();
    Tensor::from_vec(data, (size, size, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)
}
