pub mod cache;
pub mod types;

// Re-export the main public API
pub use cache::OwnershipCache;
pub use types::{EphemeralOwnerData, OwnedBundle, OwnerInfo, OwnershipError};
