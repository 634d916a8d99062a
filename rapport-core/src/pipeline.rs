use std::sync::Arc;

use candle_core::Device;
use image::DynamicImage;

use crate::{Error, GenerationConfig, Message, ModelLike, Processor, Prompt, Result};

/// A loaded model and processor bound to a device, serving both request
/// operations.
pub struct Pipeline {
    model: Arc<dyn ModelLike>,
    processor: Arc<dyn Processor>,
    device: Device,
    generation: GenerationConfig,
    model_id: String,
}

impl Pipeline {
    pub fn new(model: Arc<dyn ModelLike>, processor: Arc<dyn Processor>, device: Device) -> Self {
        Self {
            model,
            processor,
            device,
            generation: GenerationConfig::default(),
            model_id: String::new(),
        }
    }

    pub fn with_generation_config(mut self, generation: GenerationConfig) -> Self {
        self.generation = generation;
        self
    }

    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Answers a prompt together with any attached images.
    pub fn generate(&self, prompt: &Prompt) -> Result<String> {
        let images = prompt.decode_images()?;
        self.run(prompt.text(), images)
    }

    /// Answers a text-only prompt.
    pub fn generate_text(&self, prompt: &Prompt) -> Result<String> {
        if !prompt.images().is_empty() {
            return Err(Error::validation("text-only generation does not accept an image"));
        }
        self.run(prompt.text(), Vec::new())
    }

    fn run(&self, text: &str, images: Vec<DynamicImage>) -> Result<String> {
        self.processor.check_text(text)?;
        let message = Message::user(text, images)?;
        let images: Vec<DynamicImage> = message.images().cloned().collect();
        let messages = [message];

        let rendered = self
            .processor
            .apply_chat_template(&messages)
            .unwrap_or_else(|| messages[0].text());

        let inputs = self
            .processor
            .process(&rendered, &images)?
            .to_device(&self.device)?;

        let prompt_len = inputs.seq_len()?;
        if let Some(limit) = self.model.context_length() {
            if prompt_len >= limit {
                return Err(Error::validation(format!(
                    "prompt is {prompt_len} tokens, the model accepts fewer than {limit}"
                )));
            }
        }
        tracing::debug!(
            prompt_len,
            images = images.len(),
            max_new_tokens = self.generation.max_new_tokens,
            "running generation"
        );

        let tokens = self
            .model
            .generate(&inputs, self.generation.max_new_tokens)
            .map_err(Error::Inference)?;
        tracing::debug!(generated = tokens.len(), "generation finished");

        self.processor.decode(&tokens, true)
    }
}
