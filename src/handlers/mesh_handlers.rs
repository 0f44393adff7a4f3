//! Inbound mesh endpoints.
//!
//! - POST /mesh/sync   -> run the message and reply with the response message
//! - POST /mesh/async  -> accept the message (202) and run it in the background

use crate::{errors::AppError, state::AppState};
use axum::{
    body::Bytes,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
};
use tracing::debug;

/// `POST /mesh/sync`
pub async fn mesh_sync(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    match state.dispatcher.handle_sync(&body).await {
        Some(reply) => Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            reply,
        )),
        None => Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "body is not a mesh message",
        )),
    }
}

/// `POST /mesh/async`
///
/// The sender only learns that the bytes arrived; the outcome is logged.
pub async fn mesh_async(State(state): State<AppState>, body: Bytes) -> StatusCode {
    let dispatcher = state.dispatcher.clone();
    tokio::spawn(async move {
        if !dispatcher.handle_async(&body).await {
            debug!("async mesh message was not applied");
        }
    });
    StatusCode::ACCEPTED
}
