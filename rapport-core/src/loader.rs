use std::fmt;
use std::future::Future;

use anyhow::Result;
use candle_core::{DType, Device};
use hf_hub::api::tokio::{Api, ApiBuilder};

use crate::{DeviceMap, Error, GenerationConfig, ModelLike, Precision, Processor, DEFAULT_MODEL_ID};

/// Registry access token. The value never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub const ENV_VAR: &'static str = "HF_TOKEN";

    /// Fails with [`Error::Configuration`] when the token is absent or blank.
    pub fn new(token: Option<String>) -> crate::Result<Self> {
        match token {
            Some(token) if !token.trim().is_empty() => Ok(Self(token.trim().to_string())),
            _ => Err(Error::Configuration(format!(
                "{} environment variable not set. Please set it with your Hugging Face token.",
                Self::ENV_VAR
            ))),
        }
    }

    /// Builds an authenticated registry client.
    pub fn api(&self) -> Result<Api> {
        Ok(ApiBuilder::new()
            .with_token(Some(self.0.clone()))
            .with_progress(false)
            .build()?)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Everything needed to fetch a model and bind it to a device.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub model_id: String,
    pub revision: String,
    pub credential: Credential,
    pub device_map: DeviceMap,
    pub precision: Precision,
    /// Context window allocated per request (prompt plus generated tokens).
    pub max_seq_len: usize,
    pub seed: u64,
    pub generation: GenerationConfig,
}

impl LoaderConfig {
    pub fn new(credential: Credential) -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            revision: "main".to_string(),
            credential,
            device_map: DeviceMap::default(),
            precision: Precision::default(),
            max_seq_len: 8192,
            seed: 299792458,
            generation: GenerationConfig::default(),
        }
    }
}

/// Per-load settings handed to a [`Loader`] once the device is chosen.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub model_id: String,
    pub revision: String,
    pub device: Device,
    pub dtype: DType,
    pub max_seq_len: usize,
    pub seed: u64,
}

pub trait Loader {
    type Model: ModelLike + 'static;
    type Processor: Processor + 'static;

    fn load(
        api: Api,
        options: LoadOptions,
    ) -> impl Future<Output = Result<(Self::Model, Self::Processor)>> + Send
    where
        Self: Sized;
}
