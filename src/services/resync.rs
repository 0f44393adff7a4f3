//! src/services/resync.rs
//!
//! Pull-based repair. A `ResyncWorker` copies a peer's containers and objects
//! onto this node, skipping objects whose hash already matches and replacing
//! the ones that differ. `ResyncManager` keeps at most one job per
//! `ResyncKey` and owns the cancellation token of each running job.

use crate::{
    models::{
        container::{Container, ContainerSettings},
        enumeration::{EnumerationQuery, MAX_PAGE_SIZE, OrderBy},
        node::Node,
        object::ObjectMetadata,
    },
    services::{container_manager::ContainerManager, container_store::ContainerStore, outbound::Outbound},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Identity of a resync job.
#[derive(Serialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResyncKey {
    pub source_node_id: i64,
    pub user_guid: Option<String>,
    pub container_name: Option<String>,
    pub start_utc: DateTime<Utc>,
}

impl ResyncKey {
    pub fn new(
        source_node_id: i64,
        user_guid: Option<String>,
        container_name: Option<String>,
        start_utc: DateTime<Utc>,
    ) -> Self {
        Self {
            source_node_id,
            user_guid,
            container_name,
            start_utc,
        }
    }
}

#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct ResyncSummary {
    pub containers: usize,
    pub objects_checked: usize,
    pub objects_skipped: usize,
    pub objects_copied: usize,
    pub objects_replaced: usize,
    pub objects_failed: usize,
    pub cancelled: bool,
    pub started_utc: Option<DateTime<Utc>>,
    pub finished_utc: Option<DateTime<Utc>>,
    pub elapsed: Duration,
}

enum ObjectOutcome {
    Skipped,
    Copied,
    Replaced,
    Failed,
}

pub struct ResyncWorker {
    manager: Arc<ContainerManager>,
    outbound: Arc<Outbound>,
    max_transfer: u64,
    page_size: i64,
}

impl ResyncWorker {
    pub fn new(manager: Arc<ContainerManager>, outbound: Arc<Outbound>, max_transfer: u64) -> Self {
        Self {
            manager,
            outbound,
            max_transfer: max_transfer.max(1),
            page_size: MAX_PAGE_SIZE,
        }
    }

    /// Use a smaller enumeration page than the peer's cap.
    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    /// Run one job to completion or cancellation. `on_complete` runs exactly
    /// once with the final summary either way.
    pub async fn run<F>(
        &self,
        key: &ResyncKey,
        source: &Node,
        token: &CancellationToken,
        on_complete: F,
    ) -> ResyncSummary
    where
        F: FnOnce(&ResyncSummary),
    {
        let started = Utc::now();
        let clock = std::time::Instant::now();
        let mut summary = ResyncSummary {
            started_utc: Some(started),
            ..Default::default()
        };
        info!(
            "resync from node {} started (user {:?}, container {:?})",
            source.node_id, key.user_guid, key.container_name
        );

        self.sync_containers(key, source, token, &mut summary).await;

        summary.cancelled = token.is_cancelled();
        summary.finished_utc = Some(Utc::now());
        summary.elapsed = clock.elapsed();
        info!(
            "resync from node {} {}: {} containers, {} objects checked, {} skipped, {} copied, {} replaced, {} failed in {:?}",
            source.node_id,
            if summary.cancelled { "cancelled" } else { "finished" },
            summary.containers,
            summary.objects_checked,
            summary.objects_skipped,
            summary.objects_copied,
            summary.objects_replaced,
            summary.objects_failed,
            summary.elapsed
        );
        on_complete(&summary);
        summary
    }

    async fn sync_containers(
        &self,
        key: &ResyncKey,
        source: &Node,
        token: &CancellationToken,
        summary: &mut ResyncSummary,
    ) {
        let Some(containers) = self
            .outbound
            .container_list(source, key.user_guid.as_deref())
            .await
        else {
            warn!("node {} did not return its container list", source.node_id);
            return;
        };
        let containers: Vec<Container> = containers
            .into_iter()
            .filter(|c| key.container_name.as_deref().is_none_or(|name| c.name == name))
            .collect();
        if containers.is_empty() {
            info!("node {} has no matching containers", source.node_id);
            return;
        }

        for remote in containers {
            if token.is_cancelled() {
                return;
            }
            let store = match self.manager.ensure(&remote).await {
                Ok(store) => store,
                Err(err) => {
                    warn!(
                        "cannot host container {}/{} locally: {}",
                        remote.user_guid, remote.name, err
                    );
                    continue;
                }
            };
            let wanted = ContainerSettings::from(&remote);
            if ContainerSettings::from(&store.container()) != wanted {
                match self
                    .manager
                    .update(&remote.user_guid, &remote.name, &wanted)
                    .await
                {
                    Ok(_) => info!(
                        "container {}/{} settings aligned with node {}",
                        remote.user_guid, remote.name, source.node_id
                    ),
                    Err(err) => warn!(
                        "aligning settings of {}/{} failed: {}",
                        remote.user_guid, remote.name, err
                    ),
                }
            }
            summary.containers += 1;
            info!(
                "resyncing container {}/{} from node {}",
                remote.user_guid, remote.name, source.node_id
            );
            self.sync_container(&remote, &store, source, token, summary)
                .await;
        }
    }

    async fn sync_container(
        &self,
        remote: &Container,
        store: &ContainerStore,
        source: &Node,
        token: &CancellationToken,
        summary: &mut ResyncSummary,
    ) {
        let mut index = 0i64;
        loop {
            if token.is_cancelled() {
                return;
            }
            let query = EnumerationQuery {
                order_by: OrderBy::KeyAscending,
                ..EnumerationQuery::page(index, self.page_size)
            };
            let Some(page) = self
                .outbound
                .container_enumerate(source, &remote.user_guid, &remote.name, query)
                .await
            else {
                warn!(
                    "enumerating {}/{} on node {} failed at index {}",
                    remote.user_guid, remote.name, source.node_id, index
                );
                return;
            };
            if page.objects.is_empty() {
                return;
            }
            index += page.objects.len() as i64;

            for object in &page.objects {
                if token.is_cancelled() {
                    return;
                }
                summary.objects_checked += 1;
                match self.sync_object(remote, store, source, object).await {
                    ObjectOutcome::Skipped => summary.objects_skipped += 1,
                    ObjectOutcome::Copied => summary.objects_copied += 1,
                    ObjectOutcome::Replaced => summary.objects_replaced += 1,
                    ObjectOutcome::Failed => summary.objects_failed += 1,
                }
            }
        }
    }

    async fn sync_object(
        &self,
        remote: &Container,
        store: &ContainerStore,
        source: &Node,
        object: &ObjectMetadata,
    ) -> ObjectOutcome {
        let mut replaced = false;
        if store.exists(&object.key).await {
            match store.read_object_metadata(&object.key).await {
                Ok(local) if local.md5 == object.md5 => {
                    debug!("{} already in sync", object.key);
                    return ObjectOutcome::Skipped;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("reading local metadata for {} failed: {}", object.key, err);
                    return ObjectOutcome::Failed;
                }
            }
            if let Err(err) = store.remove_object(&object.key).await {
                warn!("removing stale {} failed: {}", object.key, err);
                return ObjectOutcome::Failed;
            }
            replaced = true;
        }

        match self.copy_object(remote, store, source, object).await {
            true if replaced => ObjectOutcome::Replaced,
            true => ObjectOutcome::Copied,
            false => ObjectOutcome::Failed,
        }
    }

    /// Fetch an object from `source` and write it locally, in chunks of at
    /// most `max_transfer` bytes. A partially written copy is removed.
    async fn copy_object(
        &self,
        remote: &Container,
        store: &ContainerStore,
        source: &Node,
        object: &ObjectMetadata,
    ) -> bool {
        let length = object.content_length.max(0) as u64;
        let range = (length > self.max_transfer).then_some((0, self.max_transfer));

        let Some(first) = self
            .outbound
            .object_read(source, &remote.user_guid, &remote.name, &object.key, range)
            .await
        else {
            warn!("fetching {} from node {} failed", object.key, source.node_id);
            return false;
        };
        if let Err(err) = store
            .write_object(
                &object.key,
                &object.content_type,
                first.len() as u64,
                &first[..],
                &object.tags,
            )
            .await
        {
            warn!("writing {} failed: {}", object.key, err);
            return false;
        }

        if self
            .copy_remaining(remote, store, source, object, first.len() as u64)
            .await
        {
            debug!("copied {} ({} bytes) from node {}", object.key, length, source.node_id);
            return true;
        }
        if let Err(err) = store.remove_object(&object.key).await {
            warn!("removing partial {} failed: {}", object.key, err);
        }
        false
    }

    async fn copy_remaining(
        &self,
        remote: &Container,
        store: &ContainerStore,
        source: &Node,
        object: &ObjectMetadata,
        mut offset: u64,
    ) -> bool {
        let length = object.content_length.max(0) as u64;
        while offset < length {
            let count = self.max_transfer.min(length - offset);
            let Some(chunk) = self
                .outbound
                .object_read(
                    source,
                    &remote.user_guid,
                    &remote.name,
                    &object.key,
                    Some((offset, count)),
                )
                .await
            else {
                warn!(
                    "fetching {} bytes {}..{} from node {} failed",
                    object.key,
                    offset,
                    offset + count,
                    source.node_id
                );
                return false;
            };
            if chunk.is_empty() {
                warn!("node {} returned an empty chunk for {}", source.node_id, object.key);
                return false;
            }
            if let Err(err) = store
                .write_range_object(&object.key, offset, chunk.len() as u64, &chunk[..])
                .await
            {
                warn!("writing {} at offset {} failed: {}", object.key, offset, err);
                return false;
            }
            offset += chunk.len() as u64;
        }
        true
    }
}

struct Job {
    source: Node,
    token: CancellationToken,
    running: bool,
}

/// Registry of resync jobs, one per key.
pub struct ResyncManager {
    worker: Arc<ResyncWorker>,
    jobs: Arc<Mutex<HashMap<ResyncKey, Job>>>,
}

impl ResyncManager {
    pub fn new(worker: Arc<ResyncWorker>) -> Self {
        Self {
            worker,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a job. `false` if one with the same key already exists.
    pub fn add(&self, key: ResyncKey, source: Node) -> bool {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if jobs.contains_key(&key) {
            debug!("resync job {:?} already registered", key);
            return false;
        }
        jobs.insert(
            key,
            Job {
                source,
                token: CancellationToken::new(),
                running: false,
            },
        );
        true
    }

    /// Launch a registered job in the background. `None` if it is unknown or
    /// already running.
    pub fn start(&self, key: &ResyncKey) -> Option<JoinHandle<ResyncSummary>> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let job = jobs.get_mut(key)?;
        if job.running {
            return None;
        }
        job.running = true;

        let worker = self.worker.clone();
        let registry = self.jobs.clone();
        let source = job.source.clone();
        let token = job.token.clone();
        let key = key.clone();
        Some(tokio::spawn(async move {
            worker
                .run(&key, &source, &token, |_| {
                    let mut jobs = registry.lock().unwrap_or_else(|e| e.into_inner());
                    jobs.remove(&key);
                })
                .await
        }))
    }

    /// Cancel and forget a job.
    pub fn stop(&self, key: &ResyncKey) -> bool {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        match jobs.remove(key) {
            Some(job) => {
                job.token.cancel();
                info!("resync job from node {} stopped", key.source_node_id);
                true
            }
            None => false,
        }
    }

    /// Run a job on the calling task. `None` if the key is already taken.
    pub async fn run_foreground(&self, key: ResyncKey, source: Node) -> Option<ResyncSummary> {
        if !self.add(key.clone(), source.clone()) {
            return None;
        }
        let token = {
            let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            let job = jobs.get_mut(&key)?;
            job.running = true;
            job.token.clone()
        };
        let registry = self.jobs.clone();
        let summary = self
            .worker
            .run(&key, &source, &token, |_| {
                let mut jobs = registry.lock().unwrap_or_else(|e| e.into_inner());
                jobs.remove(&key);
            })
            .await;
        Some(summary)
    }

    /// Keys of every registered job.
    pub fn list(&self) -> Vec<ResyncKey> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.keys().cloned().collect()
    }
}
