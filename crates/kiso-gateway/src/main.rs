use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

mod app;
mod auth;
mod http;

#[derive(Parser)]
#[command(name = "kiso-gateway", about = "Kiso agent runtime gateway")]
struct Args {
    /// Path to config.toml (default: $KISO_CONFIG or ~/.kiso/config.toml).
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiso=info,kiso_gateway=info,tower_http=warn".into()),
        )
        .init();

    let args = Args::parse();

    // Config errors fail fast — never start partial.
    let config = kiso_core::KisoConfig::load(args.config.as_deref())
        .map_err(|e| anyhow::anyhow!("configuration error: {e}"))?;
    let bind = config.server.bind.clone();
    let port = config.server.port;

    let state = Arc::new(app::AppState::new(config)?);

    // Crash recovery before the listener opens: leftover running work is
    // failed and unprocessed messages are re-enqueued.
    let recovered = state.supervisor.on_startup()?;
    if recovered > 0 {
        info!(recovered, "startup recovery complete");
    }

    let router = app::build_router(Arc::clone(&state));
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!(%addr, "kiso gateway listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Workers finish their current task within the grace period; the store
    // closes last when the process exits.
    state.supervisor.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
