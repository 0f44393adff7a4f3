//! src/services/object_handler.rs
//!
//! Client-facing entry point. Every call runs the local operation first and
//! returns its result; on success the mutation is handed to the replica set
//! according to the container's replication mode. A replication failure is
//! logged and never fails the caller.

use crate::{
    errors::StorageResult,
    models::{
        audit::{AuditLogEntry, AuditLogQuery},
        container::{Container, ContainerSettings, ReplicationMode},
        enumeration::{ContainerMetadata, EnumerationQuery},
        message::{MessageType, ObjectRequest, RequestMetadata},
        object::ObjectMetadata,
    },
    services::{
        container_manager::ContainerManager,
        container_store::{ContainerStore, ObjectStream},
        outbound::Outbound,
    },
};
use bytes::Bytes;
use std::{collections::BTreeMap, sync::Arc};
use tracing::warn;

pub struct ObjectHandler {
    manager: Arc<ContainerManager>,
    outbound: Arc<Outbound>,
}

impl ObjectHandler {
    pub fn new(manager: Arc<ContainerManager>, outbound: Arc<Outbound>) -> Self {
        Self { manager, outbound }
    }

    async fn replicate(&self, mode: ReplicationMode, msg_type: MessageType, request: RequestMetadata) {
        if !self.outbound.replicate(mode, msg_type, &request).await {
            warn!(
                "{:?} on {}/{} did not reach every replica",
                msg_type,
                request.user_guid.as_deref().unwrap_or("-"),
                request.container_name.as_deref().unwrap_or("-")
            );
        }
    }

    async fn store(&self, user_guid: &str, container_name: &str) -> StorageResult<Arc<ContainerStore>> {
        self.manager.get(user_guid, container_name).await
    }

    // --- containers ---

    pub async fn create_container(&self, container: Container) -> StorageResult<Container> {
        let created = self.manager.create(container).await?;
        let request = RequestMetadata {
            container: Some(created.clone()),
            ..RequestMetadata::for_container(&created.user_guid, &created.name)
        };
        self.replicate(created.replication, MessageType::ContainerCreate, request)
            .await;
        Ok(created)
    }

    pub async fn update_container(
        &self,
        user_guid: &str,
        container_name: &str,
        settings: ContainerSettings,
    ) -> StorageResult<Container> {
        let before = self.manager.get_container(user_guid, container_name).await?;
        let updated = self
            .manager
            .update(user_guid, container_name, &settings)
            .await?;
        // Switching replication off still has to reach the replicas once.
        let mode = match updated.replication {
            ReplicationMode::None => before.replication,
            mode => mode,
        };
        let request = RequestMetadata {
            settings: Some(settings),
            ..RequestMetadata::for_container(user_guid, container_name)
        };
        self.replicate(mode, MessageType::ContainerUpdate, request)
            .await;
        Ok(updated)
    }

    pub async fn delete_container(&self, user_guid: &str, container_name: &str) -> StorageResult<()> {
        let mode = self
            .manager
            .get_container(user_guid, container_name)
            .await?
            .replication;
        self.manager.delete(user_guid, container_name).await?;
        self.replicate(
            mode,
            MessageType::ContainerDelete,
            RequestMetadata::for_container(user_guid, container_name),
        )
        .await;
        Ok(())
    }

    pub async fn list_containers(&self, user_guid: Option<&str>) -> StorageResult<Vec<Container>> {
        self.manager.list(user_guid).await
    }

    pub async fn enumerate(
        &self,
        user_guid: &str,
        container_name: &str,
        query: &EnumerationQuery,
    ) -> StorageResult<ContainerMetadata> {
        self.store(user_guid, container_name).await?.enumerate(query).await
    }

    pub async fn write_container_key_value_pairs(
        &self,
        user_guid: &str,
        container_name: &str,
        pairs: BTreeMap<String, String>,
    ) -> StorageResult<()> {
        let store = self.store(user_guid, container_name).await?;
        store.write_container_key_value_pairs(&pairs).await?;
        let request = RequestMetadata {
            key_values: Some(pairs),
            ..RequestMetadata::for_container(user_guid, container_name)
        };
        self.replicate(
            store.container().replication,
            MessageType::ContainerWriteKeyValuePairs,
            request,
        )
        .await;
        Ok(())
    }

    pub async fn get_audit_log_entries(
        &self,
        user_guid: &str,
        container_name: &str,
        query: &AuditLogQuery,
    ) -> StorageResult<Vec<AuditLogEntry>> {
        self.store(user_guid, container_name)
            .await?
            .get_audit_log_entries(query)
            .await
    }

    pub async fn clear_audit_log(&self, user_guid: &str, container_name: &str) -> StorageResult<u64> {
        let store = self.store(user_guid, container_name).await?;
        let removed = store.clear_audit_log().await?;
        self.replicate(
            store.container().replication,
            MessageType::ContainerClearAuditLog,
            RequestMetadata::for_container(user_guid, container_name),
        )
        .await;
        Ok(removed)
    }

    // --- objects ---

    pub async fn write_object(
        &self,
        user_guid: &str,
        container_name: &str,
        key: &str,
        content_type: &str,
        data: Bytes,
        tags: Vec<String>,
    ) -> StorageResult<ObjectMetadata> {
        let store = self.store(user_guid, container_name).await?;
        let meta = store
            .write_object(key, content_type, data.len() as u64, &data[..], &tags)
            .await?;
        let object = ObjectRequest {
            content_type: Some(content_type.to_string()),
            tags,
            data: data.to_vec(),
            ..ObjectRequest::key(&meta.key)
        };
        self.replicate(
            store.container().replication,
            MessageType::ObjectCreate,
            RequestMetadata::for_object(user_guid, container_name, object),
        )
        .await;
        Ok(meta)
    }

    pub async fn write_range_object(
        &self,
        user_guid: &str,
        container_name: &str,
        key: &str,
        position: u64,
        data: Bytes,
    ) -> StorageResult<ObjectMetadata> {
        let store = self.store(user_guid, container_name).await?;
        let meta = store
            .write_range_object(key, position, data.len() as u64, &data[..])
            .await?;
        let object = ObjectRequest {
            position: Some(position),
            data: data.to_vec(),
            ..ObjectRequest::key(&meta.key)
        };
        self.replicate(
            store.container().replication,
            MessageType::ObjectWriteRange,
            RequestMetadata::for_object(user_guid, container_name, object),
        )
        .await;
        Ok(meta)
    }

    pub async fn write_object_tags(
        &self,
        user_guid: &str,
        container_name: &str,
        key: &str,
        tags: Vec<String>,
    ) -> StorageResult<()> {
        let store = self.store(user_guid, container_name).await?;
        store.write_object_tags(key, &tags).await?;
        let object = ObjectRequest {
            tags,
            ..ObjectRequest::key(key)
        };
        self.replicate(
            store.container().replication,
            MessageType::ObjectWriteTags,
            RequestMetadata::for_object(user_guid, container_name, object),
        )
        .await;
        Ok(())
    }

    pub async fn write_object_key_value_pairs(
        &self,
        user_guid: &str,
        container_name: &str,
        key: &str,
        pairs: BTreeMap<String, String>,
    ) -> StorageResult<()> {
        let store = self.store(user_guid, container_name).await?;
        store.write_object_key_value_pairs(key, &pairs).await?;
        let request = RequestMetadata {
            key_values: Some(pairs),
            ..RequestMetadata::for_object(user_guid, container_name, ObjectRequest::key(key))
        };
        self.replicate(
            store.container().replication,
            MessageType::ObjectWriteKeyValuePairs,
            request,
        )
        .await;
        Ok(())
    }

    pub async fn delete_object(&self, user_guid: &str, container_name: &str, key: &str) -> StorageResult<()> {
        let store = self.store(user_guid, container_name).await?;
        store.remove_object(key).await?;
        self.replicate(
            store.container().replication,
            MessageType::ObjectDelete,
            RequestMetadata::for_object(user_guid, container_name, ObjectRequest::key(key)),
        )
        .await;
        Ok(())
    }

    pub async fn rename_object(
        &self,
        user_guid: &str,
        container_name: &str,
        old_key: &str,
        new_key: &str,
    ) -> StorageResult<()> {
        let store = self.store(user_guid, container_name).await?;
        store.rename_object(old_key, new_key).await?;
        let object = ObjectRequest {
            new_key: Some(new_key.to_string()),
            ..ObjectRequest::key(old_key)
        };
        self.replicate(
            store.container().replication,
            MessageType::ObjectRename,
            RequestMetadata::for_object(user_guid, container_name, object),
        )
        .await;
        Ok(())
    }

    pub async fn read_object(&self, user_guid: &str, container_name: &str, key: &str) -> StorageResult<ObjectStream> {
        self.store(user_guid, container_name).await?.read_object(key).await
    }

    pub async fn read_range_object(
        &self,
        user_guid: &str,
        container_name: &str,
        key: &str,
        start: u64,
        count: u64,
    ) -> StorageResult<(String, Bytes)> {
        self.store(user_guid, container_name)
            .await?
            .read_range_object(key, start, count)
            .await
    }

    pub async fn read_object_metadata(
        &self,
        user_guid: &str,
        container_name: &str,
        key: &str,
    ) -> StorageResult<ObjectMetadata> {
        self.store(user_guid, container_name)
            .await?
            .read_object_metadata(key)
            .await
    }

    pub async fn exists(&self, user_guid: &str, container_name: &str, key: &str) -> bool {
        match self.store(user_guid, container_name).await {
            Ok(store) => store.exists(key).await,
            Err(_) => false,
        }
    }
}
