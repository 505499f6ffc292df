use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tessera_core::{DeviceMap, GenerationEngine, ModelHandle, SamplingConfig};
use tessera_server::{router, runner, AppState, ImageStore};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Tessera image generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Accelerator to use: `cuda:N`, `metal:N` or a bare ordinal
    #[arg(long, default_value = "0")]
    device: DeviceMap,

    /// Hub repository of the model to serve
    #[arg(long, default_value = "deepseek-ai/Janus-1.3B")]
    model: String,

    /// Host address to bind the server to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 9999)]
    port: u16,

    /// Directory generated images are written to
    #[arg(long, default_value = "generated_samples")]
    output_dir: PathBuf,

    /// Tasks kept in memory before finished ones are evicted
    #[arg(long, default_value_t = 1024)]
    max_tasks: usize,

    /// Default sampling temperature; 0 selects the most likely token
    #[arg(long, default_value_t = 1.0)]
    temperature: f64,

    /// Default classifier-free guidance weight
    #[arg(long, default_value_t = 5.0)]
    cfg_weight: f64,

    /// Load the model on the first request instead of at startup
    #[arg(long)]
    no_preload: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let device_map = if args.cpu {
        DeviceMap::ForceCpu
    } else {
        args.device
    };

    let engine = GenerationEngine::new(SamplingConfig {
        temperature: args.temperature,
        cfg_weight: args.cfg_weight,
        ..SamplingConfig::default()
    })?;
    let images = ImageStore::new(&args.output_dir)?;
    let model = Arc::new(ModelHandle::new(&args.model, device_map));
    let state = Arc::new(AppState::new(model.clone(), engine, images, args.max_tasks));

    if !args.no_preload {
        runner::spawn_preload(model);
    }

    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!(
        address = %listener.local_addr()?,
        model = %args.model,
        device = %device_map,
        output_dir = %args.output_dir.display(),
        "server started"
    );
    axum::serve(listener, router(state)).await?;

    Ok(())
}
