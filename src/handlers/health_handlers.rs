//! Health & readiness handlers.
//!
//! - GET /healthz  -> liveness ("ok")
//! - GET /readyz   -> readiness: metadata database and storage directory

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::BTreeMap, path::Path};
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Never touches the database or the disk.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Runs `SELECT 1` against SQLite and a write/read/delete round trip under
/// the storage root. 200 when both pass, 503 otherwise.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let sqlite = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*state.db)
        .await
    {
        Ok(1) => CheckStatus::ok(),
        Ok(v) => CheckStatus::failed(format!("unexpected result: {}", v)),
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    };
    let disk = disk_check(&state.storage_root).await;

    let overall_ok = sqlite.ok && disk.ok;
    let mut checks = BTreeMap::new();
    checks.insert("sqlite", sqlite);
    checks.insert("disk", disk);

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = ReadyResponse {
        status: if overall_ok { "ok" } else { "error" }.into(),
        checks,
    };
    (status, Json(body))
}

async fn disk_check(root: &Path) -> CheckStatus {
    let probe = root.join(format!(".readyz-{}", Uuid::new_v4()));
    if let Err(e) = fs::write(&probe, b"readyz").await {
        return CheckStatus::failed(format!("could not write probe file: {}", e));
    }
    let read = fs::read(&probe).await;
    let removed = fs::remove_file(&probe).await;
    match (read, removed) {
        (Ok(bytes), _) if bytes != b"readyz" => CheckStatus::failed("probe file content mismatch".into()),
        (Ok(_), Ok(())) => CheckStatus::ok(),
        (Ok(_), Err(e)) => CheckStatus {
            ok: true,
            error: Some(format!("could not remove probe file: {}", e)),
        },
        (Err(e), _) => CheckStatus::failed(format!("could not read probe file: {}", e)),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: BTreeMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self { ok: true, error: None }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
