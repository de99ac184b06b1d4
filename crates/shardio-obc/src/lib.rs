//! ShardIO object contexts
//!
//! This crate implements the per-object concurrency control and metadata
//! cache of a placement group's execution path:
//! - Object contexts: cached object metadata plus a reader/writer lock
//! - Registry: bounded LRU of object contexts with live resizing
//! - Loader: the entry point operations use to get a locked, populated
//!   object context, including the head-before-clone discipline
//! - Backend: the metadata source contract and an in-memory backend

pub mod accessing;
pub mod backend;
pub mod interrupt;
pub mod loader;
pub mod lock;
pub mod memstore;
pub mod object_context;
pub mod registry;

// Re-exports
pub use accessing::{AccessingGuard, AccessingSet};
pub use backend::{LoadedMetadata, PgBackend};
pub use interrupt::{InterruptCondition, Interrupter};
pub use loader::{ObjectContextLoader, OpInfo};
pub use lock::{LockMode, LockState, ObcLock};
pub use memstore::MemBackend;
pub use object_context::{ObcLockGuard, ObjectContext, ObjectContextRef, PromotedGuard};
pub use registry::{ObjectContextRegistry, RegistryStats};
