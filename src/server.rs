//! Peer Host
//!
//! HTTP surface every engine instance exposes:
//! - `POST /run`: run a step and return the result
//! - `POST /api/distributor/log`: append one line to the log file
//! - `GET /health`: liveness and version

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::execution::Engine;
use crate::monitoring::LOG_ROUTE;
use crate::workflow::Step;
use crate::VERSION;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Shared state of the peer host.
#[derive(Clone)]
pub struct AppState {
    engine: Engine,
    log_file: Arc<PathBuf>,
    log_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(engine: Engine, log_file: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            log_file: Arc::new(log_file.into()),
            log_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Builds the router with all routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/run", post(run_step))
        .route(&format!("/{}", LOG_ROUTE), post(append_log))
        .route("/health", get(health))
        .with_state(state)
}

async fn run_step(
    State(state): State<AppState>,
    Json(step): Json<Step>,
) -> Result<Json<Step>, (StatusCode, String)> {
    info!(
        "Received step '{}' of run '{}'",
        step.step_name, step.run_name
    );

    match state.engine.run(step).await {
        Ok(result) => Ok(Json(result)),
        Err(e) => {
            warn!("Rejected step: {}", e);
            Err((StatusCode::BAD_REQUEST, e.to_string()))
        }
    }
}

async fn append_log(State(state): State<AppState>, Json(line): Json<String>) -> StatusCode {
    info!("{}", line);

    let _guard = state.log_lock.lock().await;
    let written = async {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(state.log_file.as_path())
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await
    }
    .await;

    match written {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            error!("Failed to write {}: {}", state.log_file.display(), e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: VERSION.to_string(),
    })
}

/// Serves on an already bound listener until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    if let Ok(addr) = listener.local_addr() {
        info!("Listening on {}", addr);
    }

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Server stopped");
    Ok(())
}

/// Binds `addr` and serves until `shutdown` resolves.
pub async fn serve_on(
    addr: &str,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;

    serve(listener, state, shutdown).await
}

/// Binds an ephemeral local port and serves in the background.
///
/// Returns the bound address. Used by tests and embedded peers.
pub async fn spawn_local(state: AppState) -> Result<SocketAddr, ServerError> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|source| ServerError::Bind {
            addr: "127.0.0.1:0".to_string(),
            source,
        })?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        if let Err(e) = serve(listener, state, std::future::pending()).await {
            error!("{}", e);
        }
    });

    Ok(addr)
}
