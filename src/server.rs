//! Join server

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, extract::DefaultBodyLimit};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::Config;
use crate::join::{JoinServer, handler::join_routes};
use crate::{Error, Result};

/// Build the full router with the ambient layers.
pub fn create_router(server: Arc<JoinServer>, config: &Config) -> Router {
    join_routes(server)
        .layer(DefaultBodyLimit::max(config.server.max_body_size))
        .layer(TimeoutLayer::new(config.server.request_timeout))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}

/// Run the join server until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error if the address is invalid, the port cannot be bound, or
/// serving fails.
pub async fn run(config: Config) -> Result<()> {
    let addr = SocketAddr::new(
        config
            .server
            .host
            .parse()
            .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
        config.server.port,
    );

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let server = Arc::new(JoinServer::from_config(&config).await);
    server.spawn_reapers(config.join.reaper_interval, &shutdown_tx);

    let app = create_router(Arc::clone(&server), &config);
    let listener = TcpListener::bind(addr).await?;

    info!(version = env!("CARGO_PKG_VERSION"), %addr, "CI join server listening");
    info!(policies = config.policies.len(), "Join policies loaded");
    if server.admin_token.is_none() {
        warn!("No admin token configured; credential revocation is disabled");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

    info!("Server stopped");
    Ok(())
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
