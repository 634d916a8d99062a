use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rapport_core::Error;
use serde_json::json;

/// HTTP rendering of [`rapport_core::Error`]: `{"detail": "..."}`.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(Error::validation(msg))
    }

    pub fn status(&self) -> StatusCode {
        match self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            Error::Configuration(_) | Error::ModelLoad(_) | Error::Inference(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = match &self.0 {
            Error::NotReady => {
                "Model not loaded. Please check HF_TOKEN environment variable.".to_string()
            }
            err => err.to_string(),
        };
        if status.is_server_error() {
            tracing::error!(%status, "{detail}");
        } else {
            tracing::debug!(%status, "{detail}");
        }
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}
