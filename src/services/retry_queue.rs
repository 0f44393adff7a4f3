//! src/services/retry_queue.rs
//!
//! RetryQueue: durable per-destination queue of messages that could not be
//! delivered. Each pending task is one JSON file under
//! `{tasks_dir}/{node id | local}/{created nanos}.json`; a background loop
//! re-sends them and removes a file once its message has been accepted.

use crate::{
    errors::{StorageError, StorageResult},
    models::task::{TaskObject, TaskType},
    services::{dispatcher::Dispatcher, topology::Topology},
};
use chrono::Utc;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{fs, io::AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shortest interval the retry loop will run at.
pub const MIN_INTERVAL: Duration = Duration::from_secs(10);

const LOCAL_DIR: &str = "local";

/// Outcome of one pass over the queue.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetrySummary {
    pub delivered: usize,
    pub expired: usize,
    pub pending: usize,
    pub corrupt: usize,
}

pub struct RetryQueue {
    dir: PathBuf,
    topology: Arc<Topology>,
    dispatcher: Arc<Dispatcher>,
}

impl RetryQueue {
    pub fn new(dir: impl Into<PathBuf>, topology: Arc<Topology>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dir: dir.into(),
            topology,
            dispatcher,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn destination_dir(&self, recipient: i64) -> PathBuf {
        if recipient == self.topology.local_id() {
            self.dir.join(LOCAL_DIR)
        } else {
            self.dir.join(recipient.to_string())
        }
    }

    /// Persist `task`. Returns the file it was written to.
    pub async fn add(&self, task: &TaskObject) -> StorageResult<PathBuf> {
        let dir = self.destination_dir(task.recipient_node_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::from_io(dir.display(), e))?;
        let body = serde_json::to_vec_pretty(task).map_err(|e| StorageError::Server(e.to_string()))?;

        let mut stamp = task
            .created_utc
            .timestamp_nanos_opt()
            .unwrap_or_else(|| task.created_utc.timestamp_micros().saturating_mul(1000));
        loop {
            let path = dir.join(format!("{:020}.json", stamp));
            let opened = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await;
            match opened {
                Ok(mut file) => {
                    file.write_all(&body)
                        .await
                        .map_err(|e| StorageError::from_io(path.display(), e))?;
                    file.sync_all()
                        .await
                        .map_err(|e| StorageError::from_io(path.display(), e))?;
                    debug!(
                        "queued {:?} for node {} at {}",
                        task.data.msg_type,
                        task.recipient_node_id,
                        path.display()
                    );
                    return Ok(path);
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => stamp += 1,
                Err(err) => return Err(StorageError::from_io(path.display(), err)),
            }
        }
    }

    /// Every pending task file, oldest first within each destination.
    pub async fn pending(&self) -> StorageResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        for dir in list_entries(&self.dir, true).await? {
            files.extend(list_entries(&dir, false).await?);
        }
        Ok(files)
    }

    /// One delivery attempt for every pending task.
    pub async fn process_once(&self) -> StorageResult<RetrySummary> {
        let mut summary = RetrySummary::default();
        let now = Utc::now();

        for path in self.pending().await? {
            let raw = match fs::read(&path).await {
                Ok(raw) => raw,
                Err(err) => {
                    warn!("reading task {} failed: {}", path.display(), err);
                    continue;
                }
            };
            let task: TaskObject = match serde_json::from_slice(&raw) {
                Ok(task) => task,
                Err(err) => {
                    error!("task {} is unreadable, leaving it in place: {}", path.display(), err);
                    summary.corrupt += 1;
                    continue;
                }
            };

            if task.is_expired(now) {
                info!(
                    "discarding expired {:?} task for node {} created {}",
                    task.data.msg_type, task.recipient_node_id, task.created_utc
                );
                remove_task(&path).await;
                summary.expired += 1;
                continue;
            }

            if self.deliver(&task).await {
                debug!(
                    "delivered queued {:?} to node {}",
                    task.data.msg_type, task.recipient_node_id
                );
                remove_task(&path).await;
                summary.delivered += 1;
            } else {
                summary.pending += 1;
            }
        }

        if summary != RetrySummary::default() {
            info!(
                "retry pass: {} delivered, {} expired, {} still pending, {} unreadable",
                summary.delivered, summary.expired, summary.pending, summary.corrupt
            );
        }
        Ok(summary)
    }

    async fn deliver(&self, task: &TaskObject) -> bool {
        match task.task_type {
            TaskType::Message if task.recipient_node_id == self.topology.local_id() => {
                match task.data.to_bytes() {
                    Ok(bytes) => self.dispatcher.handle_async(&bytes).await,
                    Err(err) => {
                        warn!("encoding queued message failed: {}", err);
                        false
                    }
                }
            }
            TaskType::Message => self.topology.send_async(&task.data).await,
        }
    }

    /// Run `process_once` every `interval` (never less than `MIN_INTERVAL`)
    /// until `token` is cancelled.
    pub async fn run(self: Arc<Self>, interval: Duration, token: CancellationToken) {
        let interval = interval.max(MIN_INTERVAL);
        info!(
            "retry queue started at {} with interval {:?}",
            self.dir.display(),
            interval
        );
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = timer.tick() => {
                    if let Err(err) = self.process_once().await {
                        error!("retry pass failed: {}", err);
                    }
                }
            }
        }
        info!("retry queue stopped");
    }
}

/// Sorted directory entries; `dirs` selects subdirectories or `.json` files.
async fn list_entries(dir: &Path, dirs: bool) -> StorageResult<Vec<PathBuf>> {
    let mut reader = match fs::read_dir(dir).await {
        Ok(reader) => reader,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StorageError::from_io(dir.display(), err)),
    };
    let mut entries = Vec::new();
    while let Some(entry) = reader
        .next_entry()
        .await
        .map_err(|e| StorageError::from_io(dir.display(), e))?
    {
        let is_dir = entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false);
        let path = entry.path();
        if dirs && is_dir {
            entries.push(path);
        } else if !dirs && !is_dir && path.extension().is_some_and(|ext| ext == "json") {
            entries.push(path);
        }
    }
    entries.sort();
    Ok(entries)
}

async fn remove_task(path: &Path) {
    if let Err(err) = fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("removing task {} failed: {}", path.display(), err);
        }
    }
}
