//! `invoke` -- run one ComfyUI workflow end to end.
//!
//! Loads a workflow in ComfyUI API format, randomizes its seeds, fills
//! the titled parameter nodes, submits it and waits for the output
//! images. Images are optionally downloaded and uploaded to S3.
//!
//! ```text
//! invoke [--server <URL>] [--legacy-titles] <request_api_json>
//! ```
//!
//! Configuration comes from environment variables (see
//! [`InvokeConfig::from_env`]); a `.env` file is honoured. AWS region and
//! credentials come from the standard AWS provider chain.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use comfyrun_cloud::s3::S3Store;
use comfyrun_comfyui::api::ComfyUIApi;
use comfyrun_core::workflow::TitleSource;
use comfyrun_invoke::config::InvokeConfig;
use comfyrun_invoke::invoker::Invoker;

/// Submit a ComfyUI workflow and wait for its images.
#[derive(Debug, Parser)]
#[command(name = "invoke", version)]
struct Cli {
    /// Workflow JSON in ComfyUI API format.
    request_api_json: PathBuf,

    /// ComfyUI base URL; overrides `COMFYUI_SERVER_ADDRESS`.
    #[arg(long)]
    server: Option<String>,

    /// Match parameter nodes on their top-level `title` instead of
    /// `_meta.title`.
    #[arg(long)]
    legacy_titles: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "comfyrun_invoke=info,comfyrun_comfyui=info,comfyrun_cloud=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = match InvokeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    if let Some(server) = cli.server {
        config.server_address = server;
    }
    if cli.legacy_titles {
        config.title_source = TitleSource::Legacy;
    }

    tracing::info!(
        server = %config.server_address,
        workflow = %cli.request_api_json.display(),
        s3_bucket = config.s3_bucket.as_deref().unwrap_or("-"),
        "Starting invocation",
    );

    let api = ComfyUIApi::new(config.server_address.clone());
    let upload_enabled = config.s3_bucket.is_some();
    let mut invoker = Invoker::new(api, config);
    if upload_enabled {
        invoker = invoker.with_store(Arc::new(S3Store::from_env().await));
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling");
            interrupt.cancel();
        }
    });

    let mut rng = rand::rng();
    match invoker.run(&cli.request_api_json, &mut rng, &cancel).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Invocation failed");
            ExitCode::FAILURE
        }
    }
}
