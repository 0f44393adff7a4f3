//! Wire envelope exchanged between nodes over the mesh.
//!
//! A `Message` is serialized as JSON; its `data` field is base64 so that raw
//! object bytes survive the text encoding. Query and mutation requests carry a
//! JSON `RequestMetadata` in `data`, read responses carry the object bytes.

use super::{
    container::{Container, ContainerSettings},
    enumeration::EnumerationQuery,
    node::Node,
};
use crate::errors::ErrorKind;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    // Direct queries, always synchronous.
    ContainerList,
    ContainerEnumerate,
    ContainerExists,
    ObjectExists,
    ObjectRead,
    ObjectMetadata,

    // Replicated mutations.
    ContainerCreate,
    ContainerUpdate,
    ContainerDelete,
    ContainerClearAuditLog,
    ContainerWriteKeyValuePairs,
    ObjectCreate,
    ObjectWriteRange,
    ObjectWriteTags,
    ObjectWriteKeyValuePairs,
    ObjectDelete,
    ObjectRename,

    // Liveness.
    Echo,
    HealthCheck,

    Console,
}

impl MessageType {
    pub fn is_query(&self) -> bool {
        matches!(
            self,
            Self::ContainerList
                | Self::ContainerEnumerate
                | Self::ContainerExists
                | Self::ObjectExists
                | Self::ObjectRead
                | Self::ObjectMetadata
        )
    }

    pub fn is_replication(&self) -> bool {
        matches!(
            self,
            Self::ContainerCreate
                | Self::ContainerUpdate
                | Self::ContainerDelete
                | Self::ContainerClearAuditLog
                | Self::ContainerWriteKeyValuePairs
                | Self::ObjectCreate
                | Self::ObjectWriteRange
                | Self::ObjectWriteTags
                | Self::ObjectWriteKeyValuePairs
                | Self::ObjectDelete
                | Self::ObjectRename
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub from: Node,
    pub to: Node,
    pub msg_type: MessageType,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub error: Option<ErrorKind>,
    #[serde(with = "base64_bytes", default)]
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(from: Node, to: Node, msg_type: MessageType, data: Vec<u8>) -> Self {
        Self {
            from,
            to,
            msg_type,
            success: None,
            error: None,
            data,
        }
    }

    /// Build a request whose data is the JSON encoding of `payload`.
    pub fn with_payload<T: Serialize>(
        from: Node,
        to: Node,
        msg_type: MessageType,
        payload: &T,
    ) -> serde_json::Result<Self> {
        Ok(Self::new(from, to, msg_type, serde_json::to_vec(payload)?))
    }

    /// Response to this message: endpoints swapped, same type.
    pub fn respond(&self, success: bool, data: Vec<u8>) -> Self {
        Self {
            from: self.to.clone(),
            to: self.from.clone(),
            msg_type: self.msg_type,
            success: Some(success),
            error: None,
            data,
        }
    }

    pub fn fail(&self, kind: ErrorKind) -> Self {
        let mut resp = self.respond(false, Vec::new());
        resp.error = Some(kind);
        resp
    }

    pub fn is_success(&self) -> bool {
        self.success == Some(true)
    }

    pub fn payload<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.data)
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Request body carried by queries and replicated mutations.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct RequestMetadata {
    #[serde(default)]
    pub user_guid: Option<String>,
    #[serde(default)]
    pub container_name: Option<String>,
    /// Full container record, for create/update so replicas keep the same GUID.
    #[serde(default)]
    pub container: Option<Container>,
    #[serde(default)]
    pub settings: Option<ContainerSettings>,
    #[serde(default)]
    pub object: Option<ObjectRequest>,
    #[serde(default)]
    pub query: Option<EnumerationQuery>,
    #[serde(default)]
    pub key_values: Option<BTreeMap<String, String>>,
}

impl RequestMetadata {
    pub fn for_container(user_guid: impl Into<String>, container_name: impl Into<String>) -> Self {
        Self {
            user_guid: Some(user_guid.into()),
            container_name: Some(container_name.into()),
            ..Default::default()
        }
    }

    pub fn for_object(
        user_guid: impl Into<String>,
        container_name: impl Into<String>,
        object: ObjectRequest,
    ) -> Self {
        Self {
            object: Some(object),
            ..Self::for_container(user_guid, container_name)
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ObjectRequest {
    pub key: String,
    #[serde(default)]
    pub new_key: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub position: Option<u64>,
    #[serde(default)]
    pub count: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(with = "base64_bytes", default)]
    pub data: Vec<u8>,
}

impl ObjectRequest {
    pub fn key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes() -> (Node, Node) {
        (
            Node::new(1, "alpha", "127.0.0.1", 8001),
            Node::new(2, "beta", "127.0.0.1", 8002),
        )
    }

    #[test]
    fn response_swaps_endpoints() {
        let (a, b) = nodes();
        let req = Message::new(a.clone(), b.clone(), MessageType::Echo, b"ping".to_vec());
        let resp = req.respond(true, req.data.clone());
        assert_eq!(resp.from, b);
        assert_eq!(resp.to, a);
        assert!(resp.is_success());
        assert_eq!(resp.data, b"ping");
    }

    #[test]
    fn data_is_base64_on_the_wire() {
        let (a, b) = nodes();
        let msg = Message::new(a, b, MessageType::ObjectRead, vec![0, 255, 10]);
        let json: serde_json::Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(json["data"], "AP8K");
        let decoded = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.data, vec![0, 255, 10]);
    }

    #[test]
    fn failure_carries_kind() {
        let (a, b) = nodes();
        let req = Message::new(a, b, MessageType::ObjectExists, Vec::new());
        let resp = req.fail(ErrorKind::NotFound);
        assert_eq!(resp.success, Some(false));
        assert_eq!(resp.error, Some(ErrorKind::NotFound));
    }

    #[test]
    fn type_families_are_disjoint() {
        assert!(MessageType::ObjectRead.is_query());
        assert!(!MessageType::ObjectRead.is_replication());
        assert!(MessageType::ObjectRename.is_replication());
        assert!(!MessageType::Echo.is_query() && !MessageType::Echo.is_replication());
    }
}
