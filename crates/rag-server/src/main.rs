use std::future::IntoFuture;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use rag_core::config::RagConfig;
use rag_orchestrator::Orchestrator;
use tracing::{error, info};

mod dispatch;
mod http;
mod stdio;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rag_server=info,tower_http=debug".into()),
        )
        .init();

    let config_path = std::env::var("RAGFORGE_CONFIG").ok();
    let config = RagConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("config load failed ({e}), using defaults");
        RagConfig::default()
    });

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;

    let orchestrator = match Orchestrator::new(config) {
        Ok(o) => Arc::new(o),
        Err(e) => {
            error!("failed to start orchestrator: {e}");
            return ExitCode::FAILURE;
        }
    };

    let addr: SocketAddr = match format!("{bind}:{port}").parse() {
        Ok(a) => a,
        Err(e) => {
            error!("invalid bind address {bind}:{port}: {e}");
            return ExitCode::FAILURE;
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("failed to bind {addr}: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!("rag-server HTTP companion listening on {addr}");

    let router = http::build_router(orchestrator.clone());

    tokio::select! {
        result = stdio::run(orchestrator.clone()) => {
            if let Err(e) = result {
                error!("stdio loop failed: {e}");
                return ExitCode::FAILURE;
            }
            info!("stdin closed, shutting down");
        }
        result = axum::serve(listener, router).into_future() => {
            if let Err(e) = result {
                error!("http server failed: {e}");
                return ExitCode::FAILURE;
            }
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
