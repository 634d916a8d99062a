use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures surfaced by the loader and the request pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// Required process configuration is missing or invalid. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Artifacts could not be fetched or bound to the device. Fatal at startup.
    #[error("failed to load model: {0:#}")]
    ModelLoad(#[source] anyhow::Error),

    /// The request itself is unusable.
    #[error("{0}")]
    Validation(String),

    /// No model is installed yet, or loading failed.
    #[error("model not loaded")]
    NotReady,

    /// The backend failed while preprocessing, generating or decoding.
    #[error("error generating response: {0:#}")]
    Inference(#[source] anyhow::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn inference(err: impl Into<anyhow::Error>) -> Self {
        Self::Inference(err.into())
    }

    pub fn model_load(err: impl Into<anyhow::Error>) -> Self {
        Self::ModelLoad(err.into())
    }
}

impl From<candle_core::Error> for Error {
    fn from(err: candle_core::Error) -> Self {
        Self::Inference(err.into())
    }
}
