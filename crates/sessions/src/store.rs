//! External snapshot store seam.
//!
//! The core only requires a key-value interface indexed by the storage
//! key (tenant-aware or legacy). The gateway provides the SQL-backed
//! implementation; tests use the in-memory one.

use std::collections::HashMap;

use parking_lot::RwLock;

use sf_domain::snapshot::Snapshot;
use sf_domain::Result;

#[async_trait::async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Load a snapshot by storage key.
    async fn load(&self, storage_key: &str) -> Result<Option<Snapshot>>;

    /// Save a snapshot under a storage key (upsert).
    async fn save(&self, storage_key: &str, snapshot: &Snapshot) -> Result<()>;
}

/// In-memory store for tests.
#[derive(Default)]
pub struct InMemorySnapshotStore {
    entries: RwLock<HashMap<String, Snapshot>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

#[async_trait::async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn load(&self, storage_key: &str) -> Result<Option<Snapshot>> {
        Ok(self.entries.read().get(storage_key).cloned())
    }

    async fn save(&self, storage_key: &str, snapshot: &Snapshot) -> Result<()> {
        self.entries
            .write()
            .insert(storage_key.to_owned(), snapshot.clone());
        Ok(())
    }
}
