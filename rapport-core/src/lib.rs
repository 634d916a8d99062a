pub mod chat_template;
pub mod context;
pub mod device_map;
pub mod error;
pub mod loader;
mod loader_factory;
pub mod message;
pub mod pipeline;
pub mod processor;
mod util;

mod medgemma;

pub use chat_template::ChatTemplate;
pub use context::ModelContext;
pub use device_map::*;
pub use error::{Error, Result};
pub use loader::*;
pub use loader_factory::*;
pub use medgemma::{MedGemmaLoader, MedGemmaModel, MedGemmaProcessor};
pub use message::{ContentPart, Message, Prompt};
pub use pipeline::Pipeline;
pub use processor::{ModelInputs, Processor};
pub use util::*;

pub const DEFAULT_MODEL_ID: &str = "google/medgemma-4b-it";

/// Decoding limits applied to every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 256,
        }
    }
}

/// A loaded model that can continue a tokenized prompt.
pub trait ModelLike: Send + Sync {
    /// Generates at most `max_new_tokens` tokens after the prompt and returns
    /// only the new ones.
    fn generate(&self, inputs: &ModelInputs, max_new_tokens: usize) -> anyhow::Result<Vec<u32>>;

    /// Maximum prompt plus generated length, if bounded.
    fn context_length(&self) -> Option<usize> {
        None
    }
}
