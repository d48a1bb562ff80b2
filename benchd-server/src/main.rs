//! # benchd-server
//!
//! Transport front-end for the benchd device orchestrator: an axum HTTP
//! server exposing the WebSocket state/command wire and the named layout
//! profile store. All device logic lives in `benchd-core`.

pub mod config;
pub mod errors;
pub mod layouts;
pub mod routes;
pub mod state;
pub mod websocket;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use benchd_core::{Bench, BenchConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ServerConfig;
use crate::layouts::LayoutStore;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,benchd_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let server_config = ServerConfig::from_env();
    let bench_config = BenchConfig::from_env()?;

    let bench = Bench::start(bench_config)
        .await
        .context("bench startup failed")?;
    let layouts = LayoutStore::open(&server_config.layouts_path)
        .await
        .context("layout store unavailable")?;

    let addr: SocketAddr = format!("{}:{}", server_config.host, server_config.port)
        .parse()
        .context("invalid SERVER_HOST/SERVER_PORT")?;

    let app_state = AppState {
        bench: Arc::clone(&bench),
        layouts: Arc::new(layouts),
        config: Arc::new(server_config),
    };
    let app = routes::router(app_state);

    info!(%addr, "benchd listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    bench.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
