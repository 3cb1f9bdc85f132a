//! Session lifecycle: the durable local snapshot buffer, cross-process
//! session locks, the external snapshot store seam, and the session
//! manager that caches active bots and restores them across processes.

pub mod buffer;
pub mod lock;
pub mod manager;
pub mod store;

pub use buffer::SnapshotBuffer;
pub use lock::SessionLockManager;
pub use manager::{SessionManager, SessionManagerConfig};
pub use store::{InMemorySnapshotStore, SnapshotStore};
