//! src/services/container_manager.rs
//!
//! Registry of the containers hosted on this node. Creates and destroys the
//! per-container tables and directories and hands out one cached
//! `ContainerStore` per container GUID.

use crate::{
    errors::{StorageError, StorageResult},
    models::container::{Container, ContainerSettings},
    services::{
        byte_store::ByteStore,
        container_store::ContainerStore,
        metadata_store::{ContainerTables, MetadataStore},
    },
};
use sqlx::SqlitePool;
use std::{
    collections::HashMap,
    path::{Component, Path, PathBuf},
    sync::{Arc, Mutex},
};
use tokio::{fs, sync::Mutex as AsyncMutex};
use tracing::{info, warn};
use uuid::Uuid;

pub struct ContainerManager {
    meta: MetadataStore,
    bytes: ByteStore,
    storage_root: PathBuf,
    stores: Mutex<HashMap<Uuid, Arc<ContainerStore>>>,
    /// Held from the existence checks through the row insert.
    create_lock: AsyncMutex<()>,
}

impl ContainerManager {
    pub fn new(db: Arc<SqlitePool>, storage_root: impl Into<PathBuf>) -> Self {
        Self {
            meta: MetadataStore::new(db),
            bytes: ByteStore::new(),
            storage_root: storage_root.into(),
            stores: Mutex::new(HashMap::new()),
            create_lock: AsyncMutex::new(()),
        }
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.meta
    }

    pub async fn init_schema(&self) -> StorageResult<()> {
        self.meta.init_schema().await
    }

    fn cached_store(&self, container: Container) -> Arc<ContainerStore> {
        let mut stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        stores
            .entry(container.guid)
            .or_insert_with(|| {
                Arc::new(ContainerStore::new(
                    container,
                    self.meta.clone(),
                    self.bytes.clone(),
                ))
            })
            .clone()
    }

    fn evict(&self, guid: Uuid) {
        let mut stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        stores.remove(&guid);
    }

    /// Register a container on this node.
    ///
    /// The GUID and settings are kept as given, so a container created on a
    /// peer keeps its identity here; the objects directory is always placed
    /// under the local storage root.
    pub async fn create(&self, container: Container) -> StorageResult<Container> {
        if container.user_guid.is_empty() || container.name.is_empty() {
            return Err(StorageError::Server(
                "container requires a user and a name".into(),
            ));
        }
        for part in [&container.user_guid, &container.name] {
            if !is_path_segment(part) {
                return Err(StorageError::Permissions(format!(
                    "`{}` is not a valid container path segment",
                    part
                )));
            }
        }

        let _creating = self.create_lock.lock().await;
        if self
            .meta
            .select_container(&container.user_guid, &container.name)
            .await?
            .is_some()
        {
            return Err(StorageError::AlreadyExists(format!(
                "{}/{}",
                container.user_guid, container.name
            )));
        }
        if self.meta.select_container_by_guid(container.guid).await?.is_some() {
            return Err(StorageError::AlreadyExists(container.guid.to_string()));
        }

        let objects_directory = self
            .storage_root
            .join(&container.user_guid)
            .join(&container.name);
        let container = Container {
            objects_directory: objects_directory.to_string_lossy().into_owned(),
            ..container
        };

        fs::create_dir_all(&objects_directory)
            .await
            .map_err(|e| StorageError::from_io(objects_directory.display(), e))?;

        let tables = ContainerTables::for_container(&container);
        self.meta.create_tables(&tables).await?;
        if let Err(err) = self.meta.insert_container(&container).await {
            let registered = self
                .meta
                .select_container_by_guid(container.guid)
                .await
                .ok()
                .flatten()
                .is_some();
            if registered {
                return Err(err);
            }
            warn!(
                "registering container {}/{} failed, removing its tables: {}",
                container.user_guid, container.name, err
            );
            if let Err(cleanup) = self.meta.drop_tables(&tables).await {
                warn!("dropping tables for {} failed: {}", container.guid, cleanup);
            }
            return Err(err);
        }

        info!(
            "created container {}/{} ({}, replication {})",
            container.user_guid, container.name, container.guid, container.replication
        );
        self.cached_store(container.clone());
        Ok(container)
    }

    /// Return the local store for `container`, creating the container if it
    /// is not hosted here yet.
    pub async fn ensure(&self, container: &Container) -> StorageResult<Arc<ContainerStore>> {
        match self.get(&container.user_guid, &container.name).await {
            Ok(store) => Ok(store),
            Err(StorageError::NotFound(_)) => match self.create(container.clone()).await {
                Ok(created) => Ok(self.cached_store(created)),
                // Created by someone else since the lookup.
                Err(StorageError::AlreadyExists(_)) => {
                    self.get(&container.user_guid, &container.name).await
                }
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    pub async fn get(&self, user_guid: &str, name: &str) -> StorageResult<Arc<ContainerStore>> {
        let container = self.get_container(user_guid, name).await?;
        Ok(self.cached_store(container))
    }

    pub async fn get_container(&self, user_guid: &str, name: &str) -> StorageResult<Container> {
        self.meta
            .select_container(user_guid, name)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("{}/{}", user_guid, name)))
    }

    pub async fn get_by_guid(&self, guid: Uuid) -> StorageResult<Arc<ContainerStore>> {
        let container = self
            .meta
            .select_container_by_guid(guid)
            .await?
            .ok_or_else(|| StorageError::NotFound(guid.to_string()))?;
        Ok(self.cached_store(container))
    }

    pub async fn list(&self, user_guid: Option<&str>) -> StorageResult<Vec<Container>> {
        self.meta.select_containers(user_guid).await
    }

    pub async fn exists(&self, user_guid: &str, name: &str) -> bool {
        match self.meta.select_container(user_guid, name).await {
            Ok(found) => found.is_some(),
            Err(err) => {
                warn!("container lookup {}/{} failed: {}", user_guid, name, err);
                false
            }
        }
    }

    /// Apply new settings. Identity, directory and creation time never change.
    pub async fn update(
        &self,
        user_guid: &str,
        name: &str,
        settings: &ContainerSettings,
    ) -> StorageResult<Container> {
        let store = self.get(user_guid, name).await?;
        let mut container = store.container();
        settings.apply(&mut container);
        self.meta.update_container(&container).await?;
        store.set_container(container.clone());
        info!(
            "updated container {}/{} (replication {}, audit {})",
            user_guid, name, container.replication, container.enable_audit_logging
        );
        Ok(container)
    }

    /// Destroy the container's contents and forget it.
    pub async fn delete(&self, user_guid: &str, name: &str) -> StorageResult<()> {
        let store = self.get(user_guid, name).await?;
        let guid = store.container().guid;
        store.destroy().await?;
        self.meta.delete_container(guid).await?;
        self.evict(guid);
        info!("deleted container {}/{} ({})", user_guid, name, guid);
        Ok(())
    }
}

/// True when `value` names exactly one normal directory entry.
fn is_path_segment(value: &str) -> bool {
    let mut parts = Path::new(value).components();
    match (parts.next(), parts.next()) {
        (Some(Component::Normal(part)), None) => part == value,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{errors::ErrorKind, models::container::ReplicationMode};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn manager(root: &Path) -> ContainerManager {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let manager = ContainerManager::new(Arc::new(pool), root);
        manager.init_schema().await.unwrap();
        manager
    }

    #[tokio::test]
    async fn create_get_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;

        let created = manager
            .create(Container::new("alice", "docs", dir.path()))
            .await
            .unwrap();
        assert!(Path::new(&created.objects_directory).is_dir());
        assert!(manager.exists("alice", "docs").await);
        assert!(!manager.exists("alice", "photos").await);

        let store = manager.get("alice", "docs").await.unwrap();
        assert_eq!(store.container().guid, created.guid);
        let again = manager.get_by_guid(created.guid).await.unwrap();
        assert!(Arc::ptr_eq(&store, &again));

        manager
            .create(Container::new("bob", "music", dir.path()))
            .await
            .unwrap();
        assert_eq!(manager.list(None).await.unwrap().len(), 2);
        assert_eq!(manager.list(Some("bob")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        manager
            .create(Container::new("alice", "docs", dir.path()))
            .await
            .unwrap();
        let err = manager
            .create(Container::new("alice", "docs", dir.path()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn concurrent_creates_leave_one_working_container() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        let container = Container::new("alice", "docs", dir.path());

        let (a, b) = tokio::join!(
            manager.create(container.clone()),
            manager.create(container.clone())
        );
        assert!(a.is_ok() != b.is_ok());
        let loser = a.err().or(b.err()).unwrap();
        assert_eq!(loser.kind(), ErrorKind::AlreadyExists);

        let store = manager.get("alice", "docs").await.unwrap();
        store
            .write_object("readme", "text/plain", 5, &b"hello"[..], &[])
            .await
            .unwrap();
        assert!(store.exists("readme").await);
    }

    #[tokio::test]
    async fn overlapping_ensures_share_one_store() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        let remote = Container::new("alice", "docs", Path::new("/elsewhere"));

        let (a, b) = tokio::join!(manager.ensure(&remote), manager.ensure(&remote));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        a.write_object("readme", "text/plain", 5, &b"hello"[..], &[])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn names_must_stay_under_the_storage_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("containers");
        let manager = manager(&root).await;

        for (user, name) in [
            ("..", "docs"),
            ("alice", ".."),
            ("alice", "a/b"),
            ("alice/../..", "docs"),
            ("/etc", "docs"),
            ("alice", "."),
        ] {
            let err = manager
                .create(Container::new(user, name, &root))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::PermissionsError, "{}/{}", user, name);
        }
        assert!(manager.list(None).await.unwrap().is_empty());
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn foreign_container_is_rerooted_locally() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;

        let remote = Container::new("alice", "docs", Path::new("/elsewhere"))
            .with_replication(ReplicationMode::Async);
        let store = manager.ensure(&remote).await.unwrap();
        let local = store.container();
        assert_eq!(local.guid, remote.guid);
        assert_eq!(local.replication, ReplicationMode::Async);
        assert!(local.objects_directory.starts_with(&*dir.path().to_string_lossy()));

        // A second ensure returns the existing store.
        let again = manager.ensure(&remote).await.unwrap();
        assert!(Arc::ptr_eq(&store, &again));
    }

    #[tokio::test]
    async fn update_changes_settings_only() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        let created = manager
            .create(Container::new("alice", "docs", dir.path()))
            .await
            .unwrap();

        let settings = ContainerSettings {
            replication: Some(ReplicationMode::Sync),
            enable_audit_logging: Some(true),
            ..Default::default()
        };
        let updated = manager.update("alice", "docs", &settings).await.unwrap();
        assert_eq!(updated.guid, created.guid);
        assert_eq!(updated.replication, ReplicationMode::Sync);

        let stored = manager.get_container("alice", "docs").await.unwrap();
        assert!(stored.enable_audit_logging);
        let store = manager.get("alice", "docs").await.unwrap();
        assert_eq!(store.container().replication, ReplicationMode::Sync);
    }

    #[tokio::test]
    async fn delete_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        let created = manager
            .create(Container::new("alice", "docs", dir.path()))
            .await
            .unwrap();
        let store = manager.get("alice", "docs").await.unwrap();
        store
            .write_object("readme", "text/plain", 5, &b"hello"[..], &[])
            .await
            .unwrap();

        manager.delete("alice", "docs").await.unwrap();
        assert!(!manager.exists("alice", "docs").await);
        assert!(!Path::new(&created.objects_directory).exists());
        let tables = manager.metadata().list_tables().await.unwrap();
        assert_eq!(tables, vec!["containers".to_string()]);

        let err = manager.delete("alice", "docs").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
