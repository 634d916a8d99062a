use std::sync::{Arc, OnceLock};

use crate::{Error, Pipeline, Result};

/// Write-once slot for the loaded [`Pipeline`].
///
/// Shared by the request handlers and the startup task. Handlers observe
/// [`Error::NotReady`] until [`ModelContext::install`] succeeds.
#[derive(Default)]
pub struct ModelContext {
    pipeline: OnceLock<Arc<Pipeline>>,
}

impl ModelContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ready(pipeline: Pipeline) -> Self {
        let ctx = Self::new();
        let _ = ctx.pipeline.set(Arc::new(pipeline));
        ctx
    }

    /// Installs the pipeline. A second install is rejected and the first one
    /// stays in place.
    pub fn install(&self, pipeline: Pipeline) -> Result<()> {
        self.pipeline
            .set(Arc::new(pipeline))
            .map_err(|_| Error::Configuration("model is already installed".to_string()))
    }

    pub fn pipeline(&self) -> Result<Arc<Pipeline>> {
        self.pipeline.get().cloned().ok_or(Error::NotReady)
    }

    pub fn is_ready(&self) -> bool {
        self.pipeline.get().is_some()
    }
}
