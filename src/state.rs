//! Shared state handed to every axum handler.

use crate::services::dispatcher::Dispatcher;
use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    /// Root directory under which container directories live.
    pub storage_root: PathBuf,
    pub dispatcher: Arc<Dispatcher>,
}
