//! src/services/dispatcher.rs
//!
//! Inbound side of the replication protocol. Decodes a message, runs the
//! matching local container or object operation and wraps the outcome in a
//! response message. Work done here is never replicated further.

use crate::{
    errors::{ErrorKind, StorageError, StorageResult},
    models::message::{Message, MessageType, ObjectRequest, RequestMetadata},
    services::{container_manager::ContainerManager, container_store::ContainerStore},
};
use std::sync::Arc;
use tracing::{debug, warn};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

pub struct Dispatcher {
    manager: Arc<ContainerManager>,
}

impl Dispatcher {
    pub fn new(manager: Arc<ContainerManager>) -> Self {
        Self { manager }
    }

    /// Handle a request that expects a reply. `None` if the bytes are not a
    /// message at all.
    pub async fn handle_sync(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        let msg = match Message::from_bytes(bytes) {
            Ok(msg) => msg,
            Err(err) => {
                warn!("discarding undecodable sync message: {}", err);
                return None;
            }
        };
        let response = self.dispatch(&msg).await;
        match response.to_bytes() {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!("encoding {:?} response failed: {}", msg.msg_type, err);
                None
            }
        }
    }

    /// Handle a fire-and-forget message. Returns whether it was applied.
    pub async fn handle_async(&self, bytes: &[u8]) -> bool {
        match Message::from_bytes(bytes) {
            Ok(msg) => self.dispatch(&msg).await.is_success(),
            Err(err) => {
                warn!("discarding undecodable async message: {}", err);
                false
            }
        }
    }

    /// Run `msg` locally and build its response.
    pub async fn dispatch(&self, msg: &Message) -> Message {
        match msg.msg_type {
            MessageType::Echo => return msg.respond(true, msg.data.clone()),
            MessageType::HealthCheck => return msg.respond(true, Vec::new()),
            MessageType::Console => {
                debug!("console message from node {} ignored", msg.from.node_id);
                return msg.fail(ErrorKind::ServerError);
            }
            _ => {}
        }

        let request: RequestMetadata = match msg.payload() {
            Ok(request) => request,
            Err(err) => {
                warn!(
                    "bad {:?} payload from node {}: {}",
                    msg.msg_type, msg.from.node_id, err
                );
                return msg.fail(ErrorKind::ServerError);
            }
        };

        match self.apply(msg.msg_type, request).await {
            Ok(data) => msg.respond(true, data),
            Err(err) => {
                debug!(
                    "{:?} from node {} failed locally: {}",
                    msg.msg_type, msg.from.node_id, err
                );
                msg.fail(err.kind())
            }
        }
    }

    async fn apply(&self, msg_type: MessageType, request: RequestMetadata) -> StorageResult<Vec<u8>> {
        match msg_type {
            MessageType::ContainerList => {
                let containers = self.manager.list(request.user_guid.as_deref()).await?;
                encode(&containers)
            }
            MessageType::ContainerEnumerate => {
                let store = self.store(&request).await?;
                let listing = store.enumerate(&request.query.unwrap_or_default()).await?;
                encode(&listing)
            }
            MessageType::ContainerExists => {
                let (user, name) = container_ref(&request)?;
                self.manager.get_container(user, name).await?;
                Ok(Vec::new())
            }
            MessageType::ObjectExists => {
                let store = self.store(&request).await?;
                let object = object_ref(request.object)?;
                if store.exists(&object.key).await {
                    Ok(Vec::new())
                } else {
                    Err(StorageError::NotFound(object.key))
                }
            }
            MessageType::ObjectRead => {
                let store = self.store(&request).await?;
                let object = object_ref(request.object)?;
                if object.position.is_some() || object.count.is_some() {
                    let (_, bytes) = store
                        .read_range_object(
                            &object.key,
                            object.position.unwrap_or(0),
                            object.count.unwrap_or(u64::MAX),
                        )
                        .await?;
                    Ok(bytes.to_vec())
                } else {
                    let (_, bytes) = store.read_object_bytes(&object.key).await?;
                    Ok(bytes.to_vec())
                }
            }
            MessageType::ObjectMetadata => {
                let store = self.store(&request).await?;
                let object = object_ref(request.object)?;
                encode(&store.read_object_metadata(&object.key).await?)
            }

            MessageType::ContainerCreate => {
                let container = request
                    .container
                    .ok_or_else(|| missing("container"))?;
                self.manager.create(container).await?;
                Ok(Vec::new())
            }
            MessageType::ContainerUpdate => {
                let (user, name) = container_ref(&request)?;
                let settings = request.settings.as_ref().ok_or_else(|| missing("settings"))?;
                self.manager.update(user, name, settings).await?;
                Ok(Vec::new())
            }
            MessageType::ContainerDelete => {
                let (user, name) = container_ref(&request)?;
                self.manager.delete(user, name).await?;
                Ok(Vec::new())
            }
            MessageType::ContainerClearAuditLog => {
                self.store(&request).await?.clear_audit_log().await?;
                Ok(Vec::new())
            }
            MessageType::ContainerWriteKeyValuePairs => {
                let store = self.store(&request).await?;
                store
                    .write_container_key_value_pairs(&request.key_values.unwrap_or_default())
                    .await?;
                Ok(Vec::new())
            }
            MessageType::ObjectCreate => {
                let store = self.store(&request).await?;
                let object = object_ref(request.object)?;
                let content_type = object.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE);
                store
                    .write_object(
                        &object.key,
                        content_type,
                        object.data.len() as u64,
                        &object.data[..],
                        &object.tags,
                    )
                    .await?;
                Ok(Vec::new())
            }
            MessageType::ObjectWriteRange => {
                let store = self.store(&request).await?;
                let object = object_ref(request.object)?;
                store
                    .write_range_object(
                        &object.key,
                        object.position.unwrap_or(0),
                        object.data.len() as u64,
                        &object.data[..],
                    )
                    .await?;
                Ok(Vec::new())
            }
            MessageType::ObjectWriteTags => {
                let store = self.store(&request).await?;
                let object = object_ref(request.object)?;
                store.write_object_tags(&object.key, &object.tags).await?;
                Ok(Vec::new())
            }
            MessageType::ObjectWriteKeyValuePairs => {
                let store = self.store(&request).await?;
                let object = object_ref(request.object)?;
                store
                    .write_object_key_value_pairs(&object.key, &request.key_values.unwrap_or_default())
                    .await?;
                Ok(Vec::new())
            }
            MessageType::ObjectDelete => {
                let store = self.store(&request).await?;
                let object = object_ref(request.object)?;
                store.remove_object(&object.key).await?;
                Ok(Vec::new())
            }
            MessageType::ObjectRename => {
                let store = self.store(&request).await?;
                let object = object_ref(request.object)?;
                let new_key = object.new_key.as_deref().ok_or_else(|| missing("new key"))?;
                store.rename_object(&object.key, new_key).await?;
                Ok(Vec::new())
            }

            MessageType::Echo | MessageType::HealthCheck | MessageType::Console => Err(
                StorageError::Server(format!("{:?} is not a storage operation", msg_type)),
            ),
        }
    }

    async fn store(&self, request: &RequestMetadata) -> StorageResult<Arc<ContainerStore>> {
        let (user, name) = container_ref(request)?;
        self.manager.get(user, name).await
    }
}

fn container_ref(request: &RequestMetadata) -> StorageResult<(&str, &str)> {
    match (request.user_guid.as_deref(), request.container_name.as_deref()) {
        (Some(user), Some(name)) => Ok((user, name)),
        _ => Err(missing("container reference")),
    }
}

fn object_ref(object: Option<ObjectRequest>) -> StorageResult<ObjectRequest> {
    object.ok_or_else(|| missing("object"))
}

fn missing(what: &str) -> StorageError {
    StorageError::Server(format!("request is missing {}", what))
}

fn encode<T: serde::Serialize>(value: &T) -> StorageResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StorageError::Server(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{container::Container, enumeration::ContainerMetadata, node::Node};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn dispatcher(root: &std::path::Path) -> (Dispatcher, Arc<ContainerManager>) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let manager = Arc::new(ContainerManager::new(Arc::new(pool), root));
        manager.init_schema().await.unwrap();
        (Dispatcher::new(manager.clone()), manager)
    }

    fn request<T: serde::Serialize>(msg_type: MessageType, payload: &T) -> Message {
        Message::with_payload(
            Node::new(2, "beta", "127.0.0.1", 8002),
            Node::new(1, "alpha", "127.0.0.1", 8001),
            msg_type,
            payload,
        )
        .unwrap()
    }

    fn object(key: &str, data: &[u8]) -> ObjectRequest {
        ObjectRequest {
            content_type: Some("text/plain".into()),
            data: data.to_vec(),
            ..ObjectRequest::key(key)
        }
    }

    #[tokio::test]
    async fn replicated_mutations_apply_locally() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, manager) = dispatcher(dir.path()).await;

        let container = Container::new("alice", "docs", std::path::Path::new("/remote"));
        let create = RequestMetadata {
            container: Some(container.clone()),
            ..RequestMetadata::for_container("alice", "docs")
        };
        let resp = dispatcher
            .dispatch(&request(MessageType::ContainerCreate, &create))
            .await;
        assert!(resp.is_success());
        assert_eq!(resp.to.node_id, 2);
        assert_eq!(
            manager.get_container("alice", "docs").await.unwrap().guid,
            container.guid
        );

        let write = RequestMetadata::for_object("alice", "docs", object("readme", b"hello world"));
        let resp = dispatcher
            .dispatch(&request(MessageType::ObjectCreate, &write))
            .await;
        assert!(resp.is_success());

        let range = RequestMetadata::for_object(
            "alice",
            "docs",
            ObjectRequest {
                position: Some(6),
                ..object("readme", b"WORLD!")
            },
        );
        assert!(
            dispatcher
                .dispatch(&request(MessageType::ObjectWriteRange, &range))
                .await
                .is_success()
        );

        let read = RequestMetadata::for_object("alice", "docs", ObjectRequest::key("readme"));
        let resp = dispatcher.dispatch(&request(MessageType::ObjectRead, &read)).await;
        assert!(resp.is_success());
        assert_eq!(resp.data, b"hello WORLD!");
    }

    #[tokio::test]
    async fn queries_report_through_success_flag() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, manager) = dispatcher(dir.path()).await;
        manager
            .create(Container::new("alice", "docs", dir.path()))
            .await
            .unwrap();

        let exists = RequestMetadata::for_object("alice", "docs", ObjectRequest::key("nope"));
        let resp = dispatcher
            .dispatch(&request(MessageType::ObjectExists, &exists))
            .await;
        assert!(!resp.is_success());
        assert_eq!(resp.error, Some(ErrorKind::NotFound));

        let missing_container = RequestMetadata::for_container("alice", "photos");
        let resp = dispatcher
            .dispatch(&request(MessageType::ContainerExists, &missing_container))
            .await;
        assert_eq!(resp.error, Some(ErrorKind::NotFound));

        let enumerate = RequestMetadata::for_container("alice", "docs");
        let list = dispatcher
            .dispatch(&request(MessageType::ContainerEnumerate, &enumerate))
            .await;
        let listing: ContainerMetadata = list.payload().unwrap();
        assert_eq!(listing.object_count, 0);
    }

    #[tokio::test]
    async fn ranged_read_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, manager) = dispatcher(dir.path()).await;
        manager
            .create(Container::new("alice", "docs", dir.path()))
            .await
            .unwrap();
        let store = manager.get("alice", "docs").await.unwrap();
        store
            .write_object("readme", "text/plain", 11, &b"hello world"[..], &[])
            .await
            .unwrap();

        let read = RequestMetadata::for_object(
            "alice",
            "docs",
            ObjectRequest {
                position: Some(6),
                count: Some(100),
                ..ObjectRequest::key("readme")
            },
        );
        let resp = dispatcher.dispatch(&request(MessageType::ObjectRead, &read)).await;
        assert_eq!(resp.data, b"world");
    }

    #[tokio::test]
    async fn malformed_input_is_rejected_without_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _) = dispatcher(dir.path()).await;

        assert!(dispatcher.handle_sync(b"not json").await.is_none());
        assert!(!dispatcher.handle_async(b"not json").await);

        let mut bad = request(MessageType::ObjectCreate, &RequestMetadata::default());
        bad.data = b"garbage".to_vec();
        let resp = dispatcher.dispatch(&bad).await;
        assert_eq!(resp.error, Some(ErrorKind::ServerError));

        let echo = Message::new(
            Node::new(2, "beta", "127.0.0.1", 8002),
            Node::new(1, "alpha", "127.0.0.1", 8001),
            MessageType::Echo,
            b"ping".to_vec(),
        );
        let reply = dispatcher.handle_sync(&echo.to_bytes().unwrap()).await.unwrap();
        let reply = Message::from_bytes(&reply).unwrap();
        assert!(reply.is_success());
        assert_eq!(reply.data, b"ping");
    }
}
