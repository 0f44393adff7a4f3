//! Routes served by a storage node.
//!
//! - `GET  /healthz`     -> liveness
//! - `GET  /readyz`      -> readiness (SQLite + storage directory)
//! - `POST /mesh/sync`   -> peer request expecting a response message
//! - `POST /mesh/async`  -> fire-and-forget peer message
//!
//! Client-facing object and container APIs are not exposed over HTTP; they
//! are reached through `ObjectHandler`.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        mesh_handlers::{mesh_async, mesh_sync},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Mesh bodies carry base64 object data, so allow well above the default.
const MESH_BODY_LIMIT: usize = 64 * 1024 * 1024;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/mesh/sync", post(mesh_sync))
        .route("/mesh/async", post(mesh_async))
        .layer(DefaultBodyLimit::max(MESH_BODY_LIMIT))
}
