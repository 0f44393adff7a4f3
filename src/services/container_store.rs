//! src/services/container_store.rs
//!
//! ContainerStore: one instance per container. Owns the in-memory key-lock
//! table, drives metadata rows through `MetadataStore` and object bytes through
//! `ByteStore`, and keeps the two consistent: a metadata row exists for a key
//! exactly when the file named by its GUID does.

use crate::{
    errors::{StorageError, StorageResult},
    models::{
        audit::{AuditAction, AuditLogEntry, AuditLogQuery},
        container::Container,
        enumeration::{ContainerMetadata, EnumerationFilter, EnumerationQuery, MAX_PAGE_SIZE, OrderBy},
        object::{ObjectMetadata, normalize_key},
    },
    services::{
        byte_store::ByteStore,
        metadata_store::{ContainerTables, MetadataStore},
    },
};
use bytes::Bytes;
use chrono::Utc;
use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
    sync::{Mutex, RwLock},
};
use tokio::{fs, fs::File, io::AsyncRead};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// An open object ready to be streamed to a caller.
#[derive(Debug)]
pub struct ObjectStream {
    pub content_type: String,
    pub length: u64,
    pub file: File,
}

/// Holds a key in the lock table until dropped.
struct KeyLock<'a> {
    table: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for KeyLock<'_> {
    fn drop(&mut self) {
        let mut locked = self.table.lock().unwrap_or_else(|e| e.into_inner());
        locked.remove(&self.key);
    }
}

pub struct ContainerStore {
    container: RwLock<Container>,
    tables: ContainerTables,
    meta: MetadataStore,
    bytes: ByteStore,
    locked_keys: Mutex<HashSet<String>>,
}

impl ContainerStore {
    pub fn new(container: Container, meta: MetadataStore, bytes: ByteStore) -> Self {
        let tables = ContainerTables::for_container(&container);
        Self {
            container: RwLock::new(container),
            tables,
            meta,
            bytes,
            locked_keys: Mutex::new(HashSet::new()),
        }
    }

    pub fn container(&self) -> Container {
        self.container
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Swap in updated container settings; identity fields stay as they were.
    pub fn set_container(&self, updated: Container) {
        let mut current = self.container.write().unwrap_or_else(|e| e.into_inner());
        *current = Container {
            guid: current.guid,
            objects_directory: current.objects_directory.clone(),
            ..updated
        };
    }

    pub fn tables(&self) -> &ContainerTables {
        &self.tables
    }

    fn object_path(&self, guid: Uuid) -> PathBuf {
        let dir = PathBuf::from(&self.container().objects_directory);
        dir.join(guid.to_string())
    }

    fn lock_key(&self, key: &str) -> StorageResult<KeyLock<'_>> {
        let mut locked = self.locked_keys.lock().unwrap_or_else(|e| e.into_inner());
        if !locked.insert(key.to_string()) {
            return Err(StorageError::Locked(key.to_string()));
        }
        Ok(KeyLock {
            table: &self.locked_keys,
            key: key.to_string(),
        })
    }

    /// Keys currently held by in-flight operations.
    pub fn locked_keys(&self) -> Vec<String> {
        let locked = self.locked_keys.lock().unwrap_or_else(|e| e.into_inner());
        locked.iter().cloned().collect()
    }

    fn checked_key(key: &str) -> StorageResult<String> {
        let key = normalize_key(key);
        if key.is_empty() || key.len() > 1024 || key.bytes().any(|b| b.is_ascii_control()) {
            return Err(StorageError::Server(format!("invalid object key `{}`", key)));
        }
        Ok(key)
    }

    async fn require_object(&self, key: &str) -> StorageResult<ObjectMetadata> {
        self.meta
            .select_object(&self.tables, key)
            .await?
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    /// Write a new object. Fails with `AlreadyExists` if the key is live.
    ///
    /// The metadata row is inserted first; if the bytes cannot be written the
    /// row is removed again before the error is returned.
    pub async fn write_object<R>(
        &self,
        key: &str,
        content_type: &str,
        length: u64,
        source: R,
        tags: &[String],
    ) -> StorageResult<ObjectMetadata>
    where
        R: AsyncRead + Unpin,
    {
        let key = Self::checked_key(key)?;
        let _lock = self.lock_key(&key)?;

        if let Some(existing) = self.meta.select_object(&self.tables, &key).await? {
            if self.bytes.exists(&self.object_path(existing.guid)).await {
                return Err(StorageError::AlreadyExists(key));
            }
            warn!(
                "removing metadata for {} with no backing file in container {}",
                key,
                self.container().name
            );
            self.meta.delete_object(&self.tables, existing.guid).await?;
        }

        let guid = Uuid::new_v4();
        let length_i64 = i64::try_from(length)
            .map_err(|_| StorageError::Server(format!("length {} too large", length)))?;
        let now = Utc::now();
        self.meta
            .insert_object(&self.tables, guid, &key, content_type, length_i64, tags, now)
            .await?;

        let path = self.object_path(guid);
        let md5 = match self.bytes.write(&path, length, source).await {
            Ok(md5) => md5,
            Err(err) => {
                error!("write of {} failed, rolling back metadata: {}", key, err);
                if let Err(rollback) = self.meta.delete_object(&self.tables, guid).await {
                    error!("rollback of {} failed: {}", key, rollback);
                }
                return Err(err);
            }
        };

        if let Err(err) = self
            .meta
            .update_object_content(&self.tables, guid, &md5, length_i64, now)
            .await
        {
            error!("recording hash for {} failed, removing object: {}", key, err);
            let _ = self.meta.delete_object(&self.tables, guid).await;
            let _ = self.bytes.delete(&path).await;
            return Err(err);
        }

        self.audit(Some(&key), AuditAction::Create, Some(format!("{} bytes", length)))
            .await;
        debug!("created object {} ({} bytes, md5 {})", key, length, md5);

        Ok(ObjectMetadata {
            guid,
            key,
            content_type: content_type.to_string(),
            content_length: length_i64,
            md5,
            tags: tags.to_vec(),
            created_utc: now,
            last_update_utc: now,
            last_access_utc: now,
        })
    }

    /// Overwrite `length` bytes at `position` of an existing object.
    pub async fn write_range_object<R>(
        &self,
        key: &str,
        position: u64,
        length: u64,
        source: R,
    ) -> StorageResult<ObjectMetadata>
    where
        R: AsyncRead + Unpin,
    {
        let key = Self::checked_key(key)?;
        let _lock = self.lock_key(&key)?;
        let mut object = self.require_object(&key).await?;

        let path = self.object_path(object.guid);
        let md5 = match self.bytes.write_range(&path, position, length, source).await {
            Ok(md5) => md5,
            Err(err) => {
                // Part of the range may already be on disk.
                self.record_disk_content(&key, object.guid, &path).await;
                return Err(err);
            }
        };
        let size = self.bytes.size(&path).await?;
        let now = Utc::now();
        let size_i64 = i64::try_from(size)
            .map_err(|_| StorageError::Server(format!("size {} too large", size)))?;
        self.meta
            .update_object_content(&self.tables, object.guid, &md5, size_i64, now)
            .await?;

        self.audit(
            Some(&key),
            AuditAction::Update,
            Some(format!("{} bytes at {}", length, position)),
        )
        .await;

        object.md5 = md5;
        object.content_length = size_i64;
        object.last_update_utc = now;
        Ok(object)
    }

    /// Store whatever hash and size the object file has right now.
    async fn record_disk_content(&self, key: &str, guid: Uuid, path: &Path) {
        let content = async {
            let md5 = self.bytes.hash(path).await?;
            let size = self.bytes.size(path).await?;
            let size = i64::try_from(size)
                .map_err(|_| StorageError::Server(format!("size {} too large", size)))?;
            self.meta
                .update_object_content(&self.tables, guid, &md5, size, Utc::now())
                .await?;
            Ok::<_, StorageError>(md5)
        };
        match content.await {
            Ok(md5) => warn!("range write to {} failed, recorded on-disk md5 {}", key, md5),
            Err(err) => error!("range write to {} failed and its metadata is stale: {}", key, err),
        }
    }

    pub async fn write_object_tags(&self, key: &str, tags: &[String]) -> StorageResult<()> {
        let key = Self::checked_key(key)?;
        let _lock = self.lock_key(&key)?;
        let object = self.require_object(&key).await?;
        self.meta
            .update_object_tags(&self.tables, object.guid, tags, Utc::now())
            .await?;
        self.audit(Some(&key), AuditAction::Update, Some("tags".into()))
            .await;
        Ok(())
    }

    pub async fn write_object_key_value_pairs(
        &self,
        key: &str,
        pairs: &BTreeMap<String, String>,
    ) -> StorageResult<()> {
        let key = Self::checked_key(key)?;
        let _lock = self.lock_key(&key)?;
        let object = self.require_object(&key).await?;
        self.meta
            .replace_object_kvps(&self.tables, object.guid, pairs)
            .await?;
        self.meta
            .touch_object_updated(&self.tables, object.guid, Utc::now())
            .await?;
        self.audit(Some(&key), AuditAction::Update, Some("key/value pairs".into()))
            .await;
        Ok(())
    }

    pub async fn read_object_key_value_pairs(
        &self,
        key: &str,
    ) -> StorageResult<BTreeMap<String, String>> {
        let key = Self::checked_key(key)?;
        let object = self.require_object(&key).await?;
        self.meta.select_object_kvps(&self.tables, object.guid).await
    }

    pub async fn write_container_key_value_pairs(
        &self,
        pairs: &BTreeMap<String, String>,
    ) -> StorageResult<()> {
        self.meta.replace_container_kvps(&self.tables, pairs).await?;
        self.audit(None, AuditAction::Update, Some("container key/value pairs".into()))
            .await;
        Ok(())
    }

    pub async fn read_container_key_value_pairs(&self) -> StorageResult<BTreeMap<String, String>> {
        self.meta.select_container_kvps(&self.tables).await
    }

    /// Delete the metadata row, then the file.
    pub async fn remove_object(&self, key: &str) -> StorageResult<()> {
        let key = Self::checked_key(key)?;
        let _lock = self.lock_key(&key)?;
        let object = self.require_object(&key).await?;

        self.meta.delete_object(&self.tables, object.guid).await?;
        match self.bytes.delete(&self.object_path(object.guid)).await {
            Ok(()) => {}
            Err(StorageError::NotFound(path)) => debug!("file {} already missing", path),
            Err(err) => return Err(err),
        }

        self.audit(Some(&key), AuditAction::Delete, None).await;
        Ok(())
    }

    pub async fn read_object(&self, key: &str) -> StorageResult<ObjectStream> {
        let key = Self::checked_key(key)?;
        let object = self.require_object(&key).await?;
        let (length, file) = self.bytes.read(&self.object_path(object.guid)).await?;
        self.touch_accessed(&object).await;
        self.audit(Some(&key), AuditAction::Read, None).await;
        Ok(ObjectStream {
            content_type: object.content_type,
            length,
            file,
        })
    }

    /// Read a byte range. `count` is clamped to what is left after `start`.
    pub async fn read_range_object(
        &self,
        key: &str,
        start: u64,
        count: u64,
    ) -> StorageResult<(String, Bytes)> {
        let key = Self::checked_key(key)?;
        let object = self.require_object(&key).await?;
        let length = object.content_length.max(0) as u64;
        if start >= length {
            return Err(StorageError::OutOfRange {
                position: start,
                count,
                length,
            });
        }
        let count = count.min(length - start);
        let bytes = self
            .bytes
            .read_range(&self.object_path(object.guid), start, count)
            .await?;
        self.touch_accessed(&object).await;
        self.audit(
            Some(&key),
            AuditAction::Read,
            Some(format!("{} bytes at {}", count, start)),
        )
        .await;
        Ok((object.content_type, bytes))
    }

    /// Whole object content buffered in memory.
    pub async fn read_object_bytes(&self, key: &str) -> StorageResult<(ObjectMetadata, Bytes)> {
        let key = Self::checked_key(key)?;
        let object = self.require_object(&key).await?;
        let path = self.object_path(object.guid);
        let data = fs::read(&path)
            .await
            .map_err(|e| StorageError::from_io(path.display(), e))?;
        self.touch_accessed(&object).await;
        self.audit(Some(&key), AuditAction::Read, None).await;
        Ok((object, Bytes::from(data)))
    }

    pub async fn read_object_metadata(&self, key: &str) -> StorageResult<ObjectMetadata> {
        let key = Self::checked_key(key)?;
        self.require_object(&key).await
    }

    /// Change an object's key. The file keeps its GUID name.
    pub async fn rename_object(&self, old_key: &str, new_key: &str) -> StorageResult<()> {
        let old_key = Self::checked_key(old_key)?;
        let new_key = Self::checked_key(new_key)?;
        if old_key == new_key {
            return Err(StorageError::AlreadyExists(new_key));
        }

        let (first, second) = if old_key < new_key {
            (&old_key, &new_key)
        } else {
            (&new_key, &old_key)
        };
        let _first = self.lock_key(first)?;
        let _second = self.lock_key(second)?;

        let object = self.require_object(&old_key).await?;
        if self.meta.select_object(&self.tables, &new_key).await?.is_some() {
            return Err(StorageError::AlreadyExists(new_key));
        }
        self.meta
            .rename_object(&self.tables, object.guid, &new_key, Utc::now())
            .await?;

        self.audit(
            Some(&new_key),
            AuditAction::Rename,
            Some(format!("renamed from {}", old_key)),
        )
        .await;
        Ok(())
    }

    /// True only when both the metadata row and the file are present.
    pub async fn exists(&self, key: &str) -> bool {
        let Ok(key) = Self::checked_key(key) else {
            return false;
        };
        match self.meta.select_object(&self.tables, &key).await {
            Ok(Some(object)) => self.bytes.exists(&self.object_path(object.guid)).await,
            Ok(None) => false,
            Err(err) => {
                warn!("exists check for {} failed: {}", key, err);
                false
            }
        }
    }

    pub async fn enumerate(&self, query: &EnumerationQuery) -> StorageResult<ContainerMetadata> {
        let (offset, limit) = query.resolved_page();
        let objects = self
            .meta
            .select_objects(&self.tables, &query.filter, query.order_by, offset, limit)
            .await?;
        let (object_count, bytes_total) = self.meta.object_statistics(&self.tables).await?;

        Ok(ContainerMetadata {
            container: self.container(),
            index_start: offset,
            max_results: limit,
            object_count,
            bytes_total,
            filter: query.filter.clone(),
            objects,
        })
    }

    /// Record an audit entry if the container logs, or unconditionally with `force`.
    pub async fn add_audit_log_entry(
        &self,
        key: Option<&str>,
        action: AuditAction,
        metadata: Option<String>,
        force: bool,
    ) -> StorageResult<()> {
        if !force && !self.container().enable_audit_logging {
            return Ok(());
        }
        let entry = AuditLogEntry {
            guid: Uuid::new_v4(),
            object_key: key.map(normalize_key),
            action,
            metadata,
            created_utc: Utc::now(),
        };
        self.meta.insert_audit(&self.tables, &entry).await
    }

    pub async fn get_audit_log_entries(
        &self,
        query: &AuditLogQuery,
    ) -> StorageResult<Vec<AuditLogEntry>> {
        self.meta.select_audit(&self.tables, query).await
    }

    pub async fn clear_audit_log(&self) -> StorageResult<u64> {
        let removed = self.meta.clear_audit(&self.tables).await?;
        info!(
            "cleared {} audit entries from container {}",
            removed,
            self.container().name
        );
        Ok(removed)
    }

    async fn audit(&self, key: Option<&str>, action: AuditAction, metadata: Option<String>) {
        if let Err(err) = self.add_audit_log_entry(key, action, metadata, false).await {
            warn!("failed to record audit entry: {}", err);
        }
    }

    async fn touch_accessed(&self, object: &ObjectMetadata) {
        if let Err(err) = self
            .meta
            .touch_object_accessed(&self.tables, object.guid, Utc::now())
            .await
        {
            warn!("failed to update last access for {}: {}", object.key, err);
        }
    }

    /// Remove every object, the metadata tables and the objects directory.
    pub async fn destroy(&self) -> StorageResult<()> {
        let container = self.container();
        info!(
            "destroying container {}/{} ({})",
            container.user_guid, container.name, container.guid
        );

        let mut removed = 0usize;
        loop {
            let page = self
                .meta
                .select_objects(
                    &self.tables,
                    &EnumerationFilter::default(),
                    OrderBy::KeyAscending,
                    0,
                    MAX_PAGE_SIZE,
                )
                .await?;
            if page.is_empty() {
                break;
            }
            let before = removed;
            for object in page {
                match self.remove_object(&object.key).await {
                    Ok(()) => removed += 1,
                    Err(err) => warn!("failed to remove {} during destroy: {}", object.key, err),
                }
            }
            if removed == before {
                return Err(StorageError::Server(format!(
                    "container {} could not be drained",
                    container.name
                )));
            }
        }
        info!("drained {} objects from container {}", removed, container.name);

        self.meta.drop_tables(&self.tables).await?;
        info!("dropped metadata tables for container {}", container.name);

        match fs::remove_dir_all(&container.objects_directory).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(StorageError::from_io(&container.objects_directory, err)),
        }
        info!(
            "removed objects directory {} for container {}",
            container.objects_directory, container.name
        );
        Ok(())
    }
}
