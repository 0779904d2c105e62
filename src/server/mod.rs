//! Ops HTTP surface
//!
//! A small operator-facing API over the pool: health probe, pool status,
//! trigger a rolling restart, inject a mesh broadcast. This is not the wire
//! protocol workers serve; it exists so operators and dashboards can watch and
//! poke the supervisor without attaching a debugger.

mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::pool::PoolManager;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<PoolManager>,
}

/// A running ops server.
pub struct OpsHandle {
    local_addr: std::net::SocketAddr,
    shutdown_tx: watch::Sender<bool>,
}

impl OpsHandle {
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

/// Build the ops router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/status", get(handlers::status))
        .route("/restart", post(handlers::restart))
        .route("/broadcast", post(handlers::broadcast))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(Duration::from_secs(10))),
        )
        .with_state(state)
}

/// Bind and serve the ops API in the background.
pub async fn start_ops_server(
    pool: Arc<PoolManager>,
    bind_addr: &str,
    port: u16,
) -> std::io::Result<OpsHandle> {
    let listener = TcpListener::bind((bind_addr, port)).await?;
    let local_addr = listener.local_addr()?;
    info!("ops server listening on {}", local_addr);

    let app = create_router(AppState { pool });
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        let shutdown = async move {
            // Either an explicit stop or the handle being dropped ends serving.
            let _ = shutdown_rx.wait_for(|stopped| *stopped).await;
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!("ops server error: {}", e);
        }
    });

    Ok(OpsHandle {
        local_addr,
        shutdown_tx,
    })
}
