use anyhow::Context;
use std::sync::Arc;

use crate::{
    select_best_device, Error, LoadOptions, Loader, LoaderConfig, MedGemmaLoader, Pipeline,
};

/// Model architectures this crate can serve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelFamily {
    /// Gemma 3 image-text-to-text checkpoints, MedGemma included.
    Gemma3,
}

impl ModelFamily {
    /// Detect the family from a registry model id.
    pub fn from_name(model_id: &str) -> Option<Self> {
        let name = model_id.to_lowercase();

        if name.contains("medgemma") || name.contains("gemma-3") || name.contains("gemma3") {
            Some(ModelFamily::Gemma3)
        } else {
            None
        }
    }
}

/// Resolve the device, fetch the artifacts and assemble a ready [`Pipeline`].
///
/// Every failure is reported as [`Error::ModelLoad`]; nothing is returned
/// partially initialized.
pub async fn load_pipeline(config: &LoaderConfig) -> crate::Result<Pipeline> {
    let family = ModelFamily::from_name(&config.model_id).ok_or_else(|| {
        Error::model_load(anyhow::anyhow!("Unsupported model: {}", config.model_id))
    })?;

    let device = select_best_device(config.device_map)
        .context("failed to set up device")
        .map_err(Error::ModelLoad)?;
    let dtype = config.precision.dtype(&device);
    let api = config.credential.api().map_err(Error::ModelLoad)?;

    tracing::info!(
        model = %config.model_id,
        revision = %config.revision,
        ?family,
        ?device,
        ?dtype,
        "loading model"
    );

    let options = LoadOptions {
        model_id: config.model_id.clone(),
        revision: config.revision.clone(),
        device: device.clone(),
        dtype,
        max_seq_len: config.max_seq_len,
        seed: config.seed,
    };

    let pipeline = match family {
        ModelFamily::Gemma3 => {
            let (model, processor) = MedGemmaLoader::load(api, options)
                .await
                .map_err(Error::ModelLoad)?;
            Pipeline::new(Arc::new(model), Arc::new(processor), device)
        }
    };

    tracing::info!(model = %config.model_id, "model loaded");
    Ok(pipeline
        .with_model_id(&config.model_id)
        .with_generation_config(config.generation))
}
