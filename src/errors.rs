//! Error types shared by the storage, replication and HTTP layers.
//!
//! `StorageError` is what every container/object operation returns. Its
//! `kind()` collapses it into the flat `ErrorKind` taxonomy that travels on
//! the wire inside response messages and shows up in logs.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

/// Flat classification of a storage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Locked,
    OutOfRange,
    IoError,
    DiskFull,
    StreamError,
    PermissionsError,
    ServerError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotFound => "not found",
            Self::AlreadyExists => "already exists",
            Self::Locked => "locked",
            Self::OutOfRange => "out of range",
            Self::IoError => "i/o error",
            Self::DiskFull => "disk full",
            Self::StreamError => "stream error",
            Self::PermissionsError => "permission denied",
            Self::ServerError => "server error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("`{0}` not found")]
    NotFound(String),
    #[error("`{0}` already exists")]
    AlreadyExists(String),
    #[error("key `{0}` is locked by another operation")]
    Locked(String),
    #[error("range starting at {position} (count {count}) exceeds length {length}")]
    OutOfRange {
        position: u64,
        count: u64,
        length: u64,
    },
    #[error("i/o error: {0}")]
    Io(#[source] io::Error),
    #[error("disk full")]
    DiskFull,
    #[error("stream error: {0}")]
    Stream(String),
    #[error("permission denied: {0}")]
    Permissions(String),
    #[error("server error: {0}")]
    Server(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::Locked(_) => ErrorKind::Locked,
            Self::OutOfRange { .. } => ErrorKind::OutOfRange,
            Self::Io(_) => ErrorKind::IoError,
            Self::DiskFull => ErrorKind::DiskFull,
            Self::Stream(_) => ErrorKind::StreamError,
            Self::Permissions(_) => ErrorKind::PermissionsError,
            Self::Server(_) | Self::Sqlx(_) => ErrorKind::ServerError,
        }
    }

    /// Classify an OS-level failure while touching `path`.
    ///
    /// Unrecognised kinds become `Server` rather than `Io`.
    pub fn from_io(path: impl fmt::Display, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path.to_string()),
            io::ErrorKind::AlreadyExists => Self::AlreadyExists(path.to_string()),
            io::ErrorKind::StorageFull => Self::DiskFull,
            io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => {
                Self::Permissions(path.to_string())
            }
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => Self::Stream(err.to_string()),
            io::ErrorKind::Interrupted
            | io::ErrorKind::WriteZero
            | io::ErrorKind::InvalidData
            | io::ErrorKind::InvalidInput
            | io::ErrorKind::TimedOut
            | io::ErrorKind::IsADirectory
            | io::ErrorKind::NotADirectory
            | io::ErrorKind::DirectoryNotEmpty => Self::Io(err),
            _ => Self::Server(format!("{}: {}", path, err)),
        }
    }
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        let status = match err.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::AlreadyExists | ErrorKind::Locked => StatusCode::CONFLICT,
            ErrorKind::OutOfRange => StatusCode::RANGE_NOT_SATISFIABLE,
            ErrorKind::PermissionsError => StatusCode::FORBIDDEN,
            ErrorKind::DiskFull => StatusCode::INSUFFICIENT_STORAGE,
            ErrorKind::StreamError => StatusCode::BAD_REQUEST,
            ErrorKind::IoError | ErrorKind::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}
