use anyhow::Result;
use clap::Parser;
use rapport_core::{
    load_pipeline, Credential, DeviceMap, GenerationConfig, LoaderConfig, ModelContext, Precision,
    DEFAULT_MODEL_ID,
};
use std::sync::{Arc, Mutex};
use tokio::{net::TcpListener, sync::oneshot};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod error;
mod extract;
mod handlers;

use handlers::{router, AppState};

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Rapport radiology report server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Accelerator ordinal to bind the model to
    #[arg(long, default_value_t = 0)]
    ordinal: usize,

    /// Model repository to serve
    #[arg(long, default_value = DEFAULT_MODEL_ID)]
    model: String,

    /// Repository revision
    #[arg(long, default_value = "main")]
    revision: String,

    /// Hugging Face access token
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    hf_token: Option<String>,

    /// Weight precision: f32, f16 or bf16
    #[arg(long, default_value_t = Precision::F32)]
    precision: Precision,

    /// Maximum number of generated tokens per request
    #[arg(long, default_value_t = GenerationConfig::default().max_new_tokens)]
    max_new_tokens: usize,

    /// Context window (prompt plus generated tokens)
    #[arg(long, default_value_t = 8192)]
    max_seq_len: usize,

    /// Sampler seed
    #[arg(long, default_value_t = 299792458)]
    seed: u64,

    /// Maximum request body size in MiB
    #[arg(long, default_value_t = 50)]
    body_limit_mb: usize,

    /// Host address to bind the server to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

impl Args {
    fn loader_config(&self, credential: Credential) -> LoaderConfig {
        LoaderConfig {
            model_id: self.model.clone(),
            revision: self.revision.clone(),
            credential,
            device_map: if self.cpu {
                DeviceMap::ForceCpu
            } else {
                DeviceMap::Ordinal(self.ordinal)
            },
            precision: self.precision,
            max_seq_len: self.max_seq_len,
            seed: self.seed,
            generation: GenerationConfig {
                max_new_tokens: self.max_new_tokens,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rapport_server=info,rapport_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    // A missing credential aborts before anything is bound.
    let credential = Credential::new(args.hf_token.clone())?;
    let config = args.loader_config(credential);

    // --- Load the model in the background; requests get 503 until it lands ---
    let context = Arc::new(ModelContext::new());
    let (failed_tx, failed_rx) = oneshot::channel::<rapport_core::Error>();
    tokio::spawn({
        let context = context.clone();
        async move {
            match load_pipeline(&config).await {
                Ok(pipeline) => match context.install(pipeline) {
                    Ok(()) => tracing::info!(model = %config.model_id, "model ready"),
                    Err(e) => {
                        let _ = failed_tx.send(e);
                    }
                },
                Err(e) => {
                    let _ = failed_tx.send(e);
                }
            }
        }
    });

    let app = router(
        Arc::new(AppState::new(context)),
        args.body_limit_mb * 1024 * 1024,
    );

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    tracing::info!("Started server on {}", listener.local_addr()?);

    let startup_failure = Arc::new(Mutex::new(None));
    let shutdown = {
        let startup_failure = startup_failure.clone();
        async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
                Ok(err) = failed_rx => {
                    tracing::error!("{err}");
                    if let Ok(mut slot) = startup_failure.lock() {
                        *slot = Some(err);
                    }
                }
            }
        }
    };
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;

    let failure = startup_failure.lock().ok().and_then(|mut slot| slot.take());
    match failure {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_map_onto_loader_config() {
        let args = Args::try_parse_from([
            "rapport-server",
            "--cpu",
            "--precision",
            "bf16",
            "--max-new-tokens",
            "512",
            "--hf-token",
            "hf_test",
        ])
        .unwrap();
        let credential = Credential::new(args.hf_token.clone()).unwrap();
        let config = args.loader_config(credential);
        assert_eq!(config.device_map, DeviceMap::ForceCpu);
        assert_eq!(config.precision, Precision::Bf16);
        assert_eq!(config.generation.max_new_tokens, 512);
        assert_eq!(config.model_id, DEFAULT_MODEL_ID);
    }

    #[test]
    fn defaults_match_documented_values() {
        let args = Args::try_parse_from(["rapport-server"]).unwrap();
        assert_eq!(args.port, 8000);
        assert_eq!(args.precision, Precision::F32);
        assert_eq!(args.max_new_tokens, 256);
        assert_eq!(args.body_limit_mb, 50);
    }

    #[test]
    fn unknown_precision_is_rejected() {
        assert!(Args::try_parse_from(["rapport-server", "--precision", "fp4"]).is_err());
    }
}
