use crate::error::StoreError;
use crate::store::{EventKind, MetadataStore, SessionId, StoreEvent};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    /// `Some(session)` marks an ephemeral node; `None` a persistent one.
    owner: Option<SessionId>,
}

/// Strongly-consistent in-memory implementation of [`MetadataStore`].
///
/// Backs every test in the workspace and single-process embedding. Sessions
/// model coordination-store client sessions: expiring one deletes all
/// ephemeral nodes it owns and fires the matching `Deleted` events, which is
/// how broker churn reaches the controller.
pub struct MemoryStore {
    nodes: DashMap<String, Node>,
    watchers: Mutex<Vec<(String, mpsc::UnboundedSender<StoreEvent>)>>,
    next_session: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            watchers: Mutex::new(Vec::new()),
            next_session: AtomicU64::new(1),
        }
    }

    /// Open a new session for ephemeral-node ownership.
    pub fn create_session(&self) -> SessionId {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    /// End a session: every ephemeral node it owns disappears.
    pub fn expire_session(&self, session: SessionId) {
        let expired: Vec<String> = self
            .nodes
            .iter()
            .filter(|e| e.value().owner == Some(session))
            .map(|e| e.key().clone())
            .collect();

        for path in expired {
            self.nodes.remove(&path);
            debug!(path = %path, session, "ephemeral node expired with session");
            self.notify(&path, EventKind::Deleted);
        }
    }

    fn notify(&self, path: &str, kind: EventKind) {
        let mut watchers = self.watchers.lock();
        watchers.retain(|(prefix, tx)| {
            if path.starts_with(prefix.as_str()) {
                tx.send(StoreEvent {
                    path: path.to_string(),
                    kind,
                })
                .is_ok()
            } else {
                // Keep watchers for other prefixes unless their receiver is gone
                !tx.is_closed()
            }
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.nodes.get(path).map(|n| n.data.clone()))
    }

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<(), StoreError> {
        let kind = match self.nodes.entry(path.to_string()) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().data = data;
                EventKind::DataChanged
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Node { data, owner: None });
                EventKind::Created
            }
        };
        self.notify(path, kind);
        Ok(())
    }

    async fn create_ephemeral(
        &self,
        path: &str,
        data: Vec<u8>,
        session: SessionId,
    ) -> Result<(), StoreError> {
        // The entry API makes the occupancy check and the insert one atomic step
        match self.nodes.entry(path.to_string()) {
            Entry::Occupied(_) => Err(StoreError::NodeExists(path.to_string())),
            Entry::Vacant(vacant) => {
                vacant.insert(Node {
                    data,
                    owner: Some(session),
                });
                self.notify(path, EventKind::Created);
                Ok(())
            }
        }
    }

    async fn set_ephemeral_data(
        &self,
        path: &str,
        data: Vec<u8>,
        session: SessionId,
    ) -> Result<(), StoreError> {
        match self.nodes.get_mut(path) {
            Some(mut node) => {
                if node.owner != Some(session) {
                    return Err(StoreError::BadVersion(path.to_string()));
                }
                node.data = data;
                drop(node);
                self.notify(path, EventKind::DataChanged);
                Ok(())
            }
            None => Err(StoreError::NoNode(path.to_string())),
        }
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        match self.nodes.remove(path) {
            Some(_) => {
                self.notify(path, EventKind::Deleted);
                Ok(())
            }
            None => Err(StoreError::NoNode(path.to_string())),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        Ok(self.nodes.contains_key(path))
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut children: Vec<String> = self
            .nodes
            .iter()
            .filter_map(|e| {
                let rest = e.key().strip_prefix(&prefix)?;
                if rest.is_empty() || rest.contains('/') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect();
        children.sort();
        Ok(children)
    }

    fn watch(&self, prefix: &str) -> mpsc::UnboundedReceiver<StoreEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.lock().push((prefix.to_string(), tx));
        rx
    }
}
