use crate::error::StoreError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;

/// Identifier of a store session. Ephemeral nodes created under a session
/// are deleted automatically when the session ends.
pub type SessionId = u64;

/// Kind of change observed under a watched prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    DataChanged,
    Deleted,
}

/// A single change notification from the store
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub path: String,
    pub kind: EventKind,
}

/// Contract of the strongly-consistent hierarchical key-value store backing
/// the broker fleet.
///
/// `create_ephemeral` is the primitive everything else leans on: it is
/// atomic, so exactly one of any number of concurrent callers for the same
/// path succeeds and the rest observe `NodeExists`.
#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    /// Read the data of a node; `None` when the node does not exist.
    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a persistent node, creating it if absent.
    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<(), StoreError>;

    /// Atomically create an ephemeral node tied to `session`.
    async fn create_ephemeral(
        &self,
        path: &str,
        data: Vec<u8>,
        session: SessionId,
    ) -> Result<(), StoreError>;

    /// Overwrite the data of an ephemeral node owned by `session`.
    /// Fails with `BadVersion` when the node belongs to another session.
    async fn set_ephemeral_data(
        &self,
        path: &str,
        data: Vec<u8>,
        session: SessionId,
    ) -> Result<(), StoreError>;

    /// Delete a node. Returns `NoNode` when absent; callers that only need
    /// idempotent cleanup ignore that case.
    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    /// Whether a node exists.
    async fn exists(&self, path: &str) -> Result<bool, StoreError>;

    /// Names of the direct children of `path`.
    async fn get_children(&self, path: &str) -> Result<Vec<String>, StoreError>;

    /// Subscribe to every change under `prefix`. Events are delivered in
    /// mutation order; a dropped receiver is pruned on the next notify.
    fn watch(&self, prefix: &str) -> mpsc::UnboundedReceiver<StoreEvent>;
}

/// Read a node and deserialize its JSON payload.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn MetadataStore,
    path: &str,
) -> Result<Option<T>, StoreError> {
    match store.get_data(path).await? {
        Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
        None => Ok(None),
    }
}

/// Serialize a value to JSON and write it as a persistent node.
pub async fn set_json<T: Serialize>(
    store: &dyn MetadataStore,
    path: &str,
    value: &T,
) -> Result<(), StoreError> {
    let data = serde_json::to_vec(value)?;
    store.set_data(path, data).await
}
