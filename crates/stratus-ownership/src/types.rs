use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use stratus_coordination::StoreError;

/// Payload of a bundle-ownership ephemeral node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralOwnerData {
    pub native_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_url_tls: Option<String>,
    pub http_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_url_tls: Option<String>,
    #[serde(default)]
    pub disabled: bool,
}

/// A bundle owned by the local broker. `active = false` means traffic is
/// disabled while the store lock is still held (graceful handover).
#[derive(Debug)]
pub struct OwnedBundle {
    pub id: String,
    active: AtomicBool,
}

impl OwnedBundle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            active: AtomicBool::new(true),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

/// Resolved owner of a bundle, from the local broker's perspective.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerInfo {
    pub data: EphemeralOwnerData,
    pub owned_by_self: bool,
}

/// Error types for ownership operations.
///
/// Cloneable (string payloads) so a failed acquisition can be fanned out to
/// every caller sharing the in-flight future.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OwnershipError {
    #[error("Bundle '{0}' is already owned by another broker")]
    AlreadyOwned(String),

    #[error("Bundle '{0}' is not owned by this broker")]
    NotOwned(String),

    #[error("Coordination store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serde(String),
}

impl From<StoreError> for OwnershipError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NodeExists(path) => OwnershipError::AlreadyOwned(path),
            StoreError::Serde(e) => OwnershipError::Serde(e.to_string()),
            other => OwnershipError::Store(other.to_string()),
        }
    }
}
