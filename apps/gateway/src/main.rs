use std::process::ExitCode;

use axum::http::StatusCode;
use axum::routing::get;
use gateway_router::LiveLogLayer;
use tracing_subscriber::prelude::*;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let (live_log_layer, log_feed) = LiveLogLayer::new(1024);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(live_log_layer)
        .init();

    match run(log_feed).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "gateway exited with error");
            ExitCode::FAILURE
        }
    }
}

async fn run(log_feed: tokio::sync::broadcast::Sender<String>) -> anyhow::Result<()> {
    let boot = gateway_core::bootstrap_from_env().await?;
    let global = boot.state.global.load();
    let bind = format!("{}:{}", global.host, global.port);
    drop(global);

    let app = axum::Router::new()
        .merge(gateway_router::proxy_router(boot.state.clone()))
        .nest("/api", gateway_router::admin_router(boot.state.clone(), log_feed))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }));

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(%bind, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).expect("install sigterm handler");
        sigterm.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
