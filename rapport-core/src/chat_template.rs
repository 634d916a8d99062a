//! Turn-based prompt formatting.

use tokenizers::Tokenizer;

use crate::{ContentPart, Message};

/// Renders conversational turns into the single prompt string the model was
/// instruction-tuned on:
///
/// ```text
/// <bos><start_of_turn>user
/// {content}<end_of_turn>
/// <start_of_turn>model
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTemplate {
    pub bos: String,
    pub start_of_turn: String,
    pub end_of_turn: String,
    pub image_marker: String,
}

impl ChatTemplate {
    pub fn gemma() -> Self {
        Self {
            bos: "<bos>".to_string(),
            start_of_turn: "<start_of_turn>".to_string(),
            end_of_turn: "<end_of_turn>".to_string(),
            image_marker: "<start_of_image>".to_string(),
        }
    }

    /// Returns the Gemma template only when the tokenizer knows its turn
    /// markers as single tokens.
    pub fn from_tokenizer(tokenizer: &Tokenizer) -> Option<Self> {
        let template = Self::gemma();
        let markers = [
            &template.bos,
            &template.start_of_turn,
            &template.end_of_turn,
            &template.image_marker,
        ];
        markers
            .iter()
            .all(|m| tokenizer.token_to_id(m).is_some())
            .then_some(template)
    }

    pub fn render(&self, messages: &[Message], add_generation_prompt: bool) -> String {
        let mut out = self.bos.clone();
        for message in messages {
            out.push_str(&self.start_of_turn);
            out.push_str("user\n");
            for part in &message.content {
                match part {
                    ContentPart::Text(text) => out.push_str(text.trim()),
                    ContentPart::Image(_) => out.push_str(&self.image_marker),
                }
            }
            out.push_str(&self.end_of_turn);
            out.push('\n');
        }
        if add_generation_prompt {
            out.push_str(&self.start_of_turn);
            out.push_str("model\n");
        }
        out
    }
}
