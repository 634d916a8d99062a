use image::DynamicImage;

use crate::{to_rgb8, Error, Result};

/// A validated request: non-empty text plus raw bytes of any attached images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    text: String,
    images: Vec<Vec<u8>>,
}

impl Prompt {
    pub fn new(text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(Error::validation("Prompt text required"));
        }
        Ok(Self {
            text,
            images: Vec::new(),
        })
    }

    /// Attaches one more image; images keep the order they were added in.
    pub fn with_image(mut self, bytes: Vec<u8>) -> Self {
        self.images.push(bytes);
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn images(&self) -> &[Vec<u8>] {
        &self.images
    }

    /// Decodes every attached image and normalizes it to RGB.
    pub fn decode_images(&self) -> Result<Vec<DynamicImage>> {
        self.images
            .iter()
            .enumerate()
            .map(|(idx, bytes)| {
                if bytes.is_empty() {
                    return Err(Error::validation(format!("image {idx} is empty")));
                }
                let img = image::load_from_memory(bytes)
                    .map_err(|e| Error::validation(format!("invalid image {idx}: {e}")))?;
                Ok(to_rgb8(img))
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text(String),
    Image(DynamicImage),
}

/// A user turn made of ordered content parts.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub content: Vec<ContentPart>,
}

impl Message {
    /// The text part always comes first; images follow in order.
    pub fn user(text: &str, images: Vec<DynamicImage>) -> Result<Self> {
        if text.trim().is_empty() {
            return Err(Error::validation("Prompt text required"));
        }
        let mut content = vec![ContentPart::Text(text.to_string())];
        content.extend(images.into_iter().map(ContentPart::Image));
        Ok(Self { content })
    }

    pub fn images(&self) -> impl Iterator<Item = &DynamicImage> {
        self.content.iter().filter_map(|part| match part {
            ContentPart::Image(img) => Some(img),
            ContentPart::Text(_) => None,
        })
    }

    /// Concatenated text parts, used when no chat template is available.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text(text) => Some(text.as_str()),
                ContentPart::Image(_) => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
