// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP API
//!
//! # Endpoints
//!
//! - `GET /files` - Reconcile and list every record, keyed by name
//! - `POST /file` - Submit a source (`url` form field) for download
//! - `GET /file?filename=NAME` - Redirect to the stored file
//! - `DELETE /file?filename=NAME` - Delete a finished or failed download
//! - `GET /download/NAME` - Stored files, served verbatim
//!
//! # Example
//!
//! ```no_run
//! use dlproxy::config::ProxyConfig;
//! use dlproxy::fetch::{FetchContext, FetchEngine};
//! use dlproxy::server::Server;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let engine = FetchEngine::new(FetchContext::new(ProxyConfig::default()));
//! Server::new(engine).start().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{rejection::FormRejection, DefaultBodyLimit, Query, State},
    http::StatusCode,
    response::{Json, Redirect},
    routing::get,
    Form, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::errors::ApiError;
use crate::fetch::FetchEngine;
use crate::registry::FileRecord;

/// Form bodies carry a single URL.
const MAX_BODY_SIZE: usize = 64 * 1024;

/// Mount point of the download directory.
pub const DOWNLOAD_MOUNT: &str = "/download";

/// State shared across handlers.
pub struct AppState {
    pub engine: FetchEngine,
}

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    pub filename: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateForm {
    pub url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct MessageBody {
    #[serde(rename = "Message")]
    pub message: String,
}

impl MessageBody {
    fn new(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            message: message.into(),
        })
    }
}

/// API server.
#[derive(Clone)]
pub struct Server {
    engine: FetchEngine,
    /// `addr:port` to bind.
    bind_address: String,
}

impl Server {
    /// Create a server for `engine`, bound to the configured address.
    pub fn new(engine: FetchEngine) -> Self {
        let bind_address = engine.config().bind_address.clone();
        Self {
            engine,
            bind_address,
        }
    }

    /// Set the bind address (`addr:port`).
    pub fn with_bind_address(mut self, addr: impl Into<String>) -> Self {
        self.bind_address = addr.into();
        self
    }

    pub fn bind_address(&self) -> &str {
        &self.bind_address
    }

    /// Build the router with all routes.
    pub fn build_router(&self) -> Router {
        build_router(self.engine.clone())
    }

    /// Serve until SIGINT/SIGTERM, then stop the fetch engine.
    pub async fn start(&self) -> Result<()> {
        let router = self.build_router();
        let addr = self.bind_address.as_str();

        tracing::info!("Starting server on {}", addr);
        if addr.starts_with("0.0.0.0") {
            tracing::warn!(
                "Server is binding to 0.0.0.0 which exposes the proxy to the network. \
                There is no authentication; use 127.0.0.1 (default) for local-only access."
            );
        }

        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                anyhow::anyhow!(
                    "{} is already in use. Another dlproxy may be running; \
                    pick a different address on the command line.",
                    addr
                )
            } else {
                anyhow::anyhow!("Failed to bind to {}: {}", addr, e)
            }
        })?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        self.engine.shutdown().await;
        tracing::info!("Cleanup complete, shutting down server");
        Ok(())
    }
}

/// Router over `engine`. Exposed separately so tests can drive it without
/// binding a socket.
pub fn build_router(engine: FetchEngine) -> Router {
    let files = ServeDir::new(&engine.config().download_dir);
    let state = Arc::new(AppState { engine });

    Router::new()
        .route("/files", get(list_files_handler))
        .route(
            "/file",
            get(get_file_handler)
                .post(create_file_handler)
                .delete(delete_file_handler),
        )
        .nest_service(DOWNLOAD_MOUNT, files)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Path under the download mount for `name`, percent-encoded.
pub fn download_path(name: &str) -> Result<String, ApiError> {
    let mut url = reqwest::Url::parse("http://localhost")
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| ApiError::Internal("base URL cannot have a path".to_string()))?
        .push(DOWNLOAD_MOUNT.trim_start_matches('/'))
        .push(name);
    Ok(url.path().to_string())
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ApiError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or(ApiError::MissingParameter(field))
}

/// `GET /files`
async fn list_files_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<BTreeMap<String, FileRecord>>, ApiError> {
    state.engine.usage().await?;
    Ok(Json(state.engine.registry().snapshot()))
}

/// `GET /file?filename=NAME`
async fn get_file_handler(Query(query): Query<FileQuery>) -> Result<Redirect, ApiError> {
    let name = required(query.filename, "filename")?;
    Ok(Redirect::temporary(&download_path(&name)?))
}

/// `POST /file` with form field `url`
async fn create_file_handler(
    State(state): State<Arc<AppState>>,
    form: Result<Form<CreateForm>, FormRejection>,
) -> Result<(StatusCode, Json<MessageBody>), ApiError> {
    let url = form.ok().and_then(|Form(form)| form.url);
    let url = required(url, "url")?;

    state.engine.submit(url.trim()).await?;
    Ok((StatusCode::CREATED, MessageBody::new("CREATE OK")))
}

/// `DELETE /file?filename=NAME`
async fn delete_file_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FileQuery>,
) -> Result<Json<MessageBody>, ApiError> {
    let name = required(query.filename, "filename")?;

    state.engine.delete(&name).await?;
    tracing::info!(name = %name, "Deleted file");
    Ok(MessageBody::new("DELETE OK"))
}

/// Graceful shutdown signal handler.
///
/// Waits for SIGINT/SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt())
            .expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
    }
}
