//! Request bodies for the generation endpoints.

use axum::{
    extract::{FromRequest, Multipart, Request},
    http::header::CONTENT_TYPE,
    Json,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use rapport_core::Prompt;
use serde::{de::DeserializeOwned, Deserialize};

use crate::error::ApiError;

/// `Json<T>` whose rejections are reported as 400 with a `detail` body.
pub struct ValidJson<T>(pub T);

impl<T, S> FromRequest<S> for ValidJson<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e| ApiError::bad_request(e.body_text()))?;
        Ok(Self(value))
    }
}

/// The JSON document carried by the multipart `prompt` field.
#[derive(Debug, Deserialize)]
pub struct TextPrompt {
    pub text: String,
}

/// Body of `POST /generate-text`. Anything besides `text` is rejected.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TextRequest {
    pub text: String,
}

impl TextRequest {
    pub fn into_prompt(self) -> Result<Prompt, ApiError> {
        Ok(Prompt::new(self.text)?)
    }
}

/// Images are base64, optionally as `data:` URLs. `image` comes first, then
/// `images` in order.
#[derive(Debug, Deserialize)]
struct JsonGenerateBody {
    text: String,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    images: Vec<String>,
}

/// Body of `POST /generate`, either JSON or `multipart/form-data`.
#[derive(Debug)]
pub struct GenerateForm {
    pub text: String,
    pub images: Vec<Vec<u8>>,
}

impl GenerateForm {
    pub fn into_prompt(self) -> Result<Prompt, ApiError> {
        let prompt = Prompt::new(self.text)?;
        Ok(self.images.into_iter().fold(prompt, Prompt::with_image))
    }

    async fn from_multipart(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut text = None;
        let mut images = Vec::new();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::bad_request(e.body_text()))?
        {
            let name = field.name().map(str::to_string);
            match name.as_deref() {
                Some("prompt") => {
                    let raw = field
                        .text()
                        .await
                        .map_err(|e| ApiError::bad_request(e.body_text()))?;
                    let prompt: TextPrompt = serde_json::from_str(&raw).map_err(|e| {
                        ApiError::bad_request(format!("invalid prompt field: {e}"))
                    })?;
                    text = Some(prompt.text);
                }
                Some("text") => {
                    text = Some(
                        field
                            .text()
                            .await
                            .map_err(|e| ApiError::bad_request(e.body_text()))?,
                    );
                }
                Some("image" | "images") => {
                    let bytes = field
                        .bytes()
                        .await
                        .map_err(|e| ApiError::bad_request(e.body_text()))?;
                    // Browsers send an empty part when no file was picked.
                    if !bytes.is_empty() {
                        images.push(bytes.to_vec());
                    }
                }
                other => tracing::debug!(field = ?other, "ignoring form field"),
            }
        }
        let text = text.ok_or_else(|| ApiError::bad_request("Prompt required"))?;
        Ok(Self { text, images })
    }
}

impl<S> FromRequest<S> for GenerateForm
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_multipart = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("multipart/form-data"));

        if is_multipart {
            let multipart = Multipart::from_request(req, state)
                .await
                .map_err(|e| ApiError::bad_request(e.body_text()))?;
            return Self::from_multipart(multipart).await;
        }

        let ValidJson(body) = ValidJson::<JsonGenerateBody>::from_request(req, state).await?;
        let images = body
            .image
            .iter()
            .chain(body.images.iter())
            .map(|encoded| decode_base64_image(encoded))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            text: body.text,
            images,
        })
    }
}

fn decode_base64_image(encoded: &str) -> Result<Vec<u8>, ApiError> {
    let payload = match encoded.strip_prefix("data:") {
        Some(url) => url
            .split_once(',')
            .map(|(_, data)| data)
            .ok_or_else(|| ApiError::bad_request("malformed data URL"))?,
        None => encoded,
    };
    BASE64_STANDARD
        .decode(payload.trim())
        .map_err(|e| ApiError::bad_request(format!("invalid base64 image: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_plain_and_data_url_base64() {
        assert_eq!(decode_base64_image("aGk=").unwrap(), b"hi");
        assert_eq!(
            decode_base64_image("data:image/png;base64,aGk=").unwrap(),
            b"hi"
        );
        assert!(decode_base64_image("data:image/png;base64").is_err());
        assert!(decode_base64_image("***").is_err());
    }

    #[test]
    fn form_images_keep_their_order() {
        let form = GenerateForm {
            text: "compare".into(),
            images: vec![b"a".to_vec(), b"b".to_vec()],
        };
        let prompt = form.into_prompt().unwrap();
        assert_eq!(prompt.images(), &[b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn text_request_rejects_extra_fields() {
        assert!(serde_json::from_str::<TextRequest>(r#"{"text": "a"}"#).is_ok());
        assert!(serde_json::from_str::<TextRequest>(r#"{"text": "a", "image": "x"}"#).is_err());
    }

    #[test]
    fn blank_text_fails_prompt_validation() {
        let form = GenerateForm {
            text: " ".into(),
            images: Vec::new(),
        };
        assert_eq!(
            form.into_prompt().unwrap_err().status(),
            axum::http::StatusCode::BAD_REQUEST
        );
    }
}
