use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use kiln_core::{DeviceMap, PipelineConfig};
use kiln_server::reaper::{Reaper, IDLE_THRESHOLD, SWEEP_INTERVAL};
use kiln_server::routes::{self, AppState};
use kiln_server::store::SessionStore;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Kiln image generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Model to serve, as a directory name under --models-dir
    #[arg(long, default_value = "stable-diffusion-v1-5")]
    model: String,

    /// Directory holding model weight directories
    #[arg(long, default_value = "models")]
    models_dir: PathBuf,

    /// Maximum number of concurrently cached client pipelines
    #[arg(long, default_value_t = 8)]
    max_sessions: usize,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let device = if args.cpu {
        DeviceMap::ForceCpu
    } else {
        DeviceMap::default()
    };
    let pipeline_config = PipelineConfig::new(args.models_dir, args.model, device);

    // --- Build the session store and start the idle sweeper ---
    let sessions = Arc::new(SessionStore::new(args.max_sessions));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper =
        Reaper::new(Arc::clone(&sessions), SWEEP_INTERVAL, IDLE_THRESHOLD).spawn(shutdown_rx);

    // --- Build axum router with shared state ---
    let app = routes::router(AppState {
        sessions,
        pipeline_config,
    });

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Stop the sweep loop; an in-flight eviction finishes first.
    let _ = shutdown_tx.send(true);
    reaper.await?;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
