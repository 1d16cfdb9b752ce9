pub mod error;
pub mod memory;
pub mod paths;
pub mod store;

// Re-export the main public API
pub use error::StoreError;
pub use memory::MemoryStore;
pub use store::{get_json, set_json, EventKind, MetadataStore, SessionId, StoreEvent};
