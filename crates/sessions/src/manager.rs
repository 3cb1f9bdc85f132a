//! Session manager: per-tenant cache of live bots, restore from the
//! local buffer or the external store, and the daily batch flush.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Local, Timelike};
use parking_lot::Mutex;

use sf_domain::snapshot::{HistoryTurn, Snapshot};
use sf_domain::{Error, Result};
use sf_engine::bot::{BotDeps, SalesBot, TurnOutcome};

use crate::buffer::{storage_key, SnapshotBuffer};
use crate::lock::SessionLockManager;
use crate::store::SnapshotStore;

/// Loads the history tail for a session from external storage.
pub type TailLoader = Arc<dyn Fn(&str) -> Vec<HistoryTurn> + Send + Sync>;

type Clock = Box<dyn Fn() -> DateTime<Local> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// First request at or past this local hour triggers the batch flush.
    pub flush_hour: u32,
    /// Reject requests without a tenant.
    pub require_client_id: bool,
    /// History tail kept verbatim when snapshotting on close.
    pub history_tail_size: usize,
    /// TTL on the advisory flush lock, seconds.
    pub flush_lock_ttl_secs: f64,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            flush_hour: 23,
            require_client_id: true,
            history_tail_size: 4,
            flush_lock_ttl_secs: 600.0,
        }
    }
}

struct SessionEntry {
    bot: SalesBot,
    last_activity: DateTime<Local>,
}

pub struct SessionManager {
    cache: Mutex<HashMap<(String, String), SessionEntry>>,
    buffer: SnapshotBuffer,
    locks: SessionLockManager,
    store: Option<Arc<dyn SnapshotStore>>,
    tail_loader: Option<TailLoader>,
    deps: BotDeps,
    config: SessionManagerConfig,
    clock: Clock,
}

impl SessionManager {
    pub fn new(
        buffer_path: &Path,
        lock_dir: &Path,
        deps: BotDeps,
        config: SessionManagerConfig,
    ) -> Result<Self> {
        Ok(Self {
            cache: Mutex::new(HashMap::new()),
            buffer: SnapshotBuffer::open(buffer_path)?,
            locks: SessionLockManager::new(lock_dir)?,
            store: None,
            tail_loader: None,
            deps,
            config,
            clock: Box::new(Local::now),
        })
    }

    pub fn with_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_tail_loader(mut self, loader: TailLoader) -> Self {
        self.tail_loader = Some(loader);
        self
    }

    /// Override the clock (tests drive the flush schedule with this).
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn buffer(&self) -> &SnapshotBuffer {
        &self.buffer
    }

    fn normalize_client(client_id: Option<&str>) -> Option<String> {
        client_id
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_owned)
    }

    fn ensure_client(&self, client_id: &Option<String>, session_id: &str) -> Result<()> {
        if self.config.require_client_id && client_id.is_none() {
            return Err(Error::MissingClientId(session_id.to_owned()));
        }
        Ok(())
    }

    fn cache_key(session_id: &str, client_id: &Option<String>) -> (String, String) {
        (
            client_id.clone().unwrap_or_default(),
            session_id.to_owned(),
        )
    }

    /// Serve one turn for `(client, session)`.
    ///
    /// Resolution order under the per-session lock: cache → local
    /// buffer (consuming the entry) → external store (tenant-aware key,
    /// then legacy) → a brand-new bot.
    pub async fn process_message(
        &self,
        session_id: &str,
        client_id: Option<&str>,
        flow_name: Option<&str>,
        config_name: Option<&str>,
        message: &str,
    ) -> Result<TurnOutcome> {
        let client = Self::normalize_client(client_id);
        self.ensure_client(&client, session_id)?;
        let lock_key = storage_key(session_id, client.as_deref());
        let _guard = self.locks.lock(&lock_key).await?;

        self.maybe_flush_batch().await;

        let mut bot = self
            .take_or_create(session_id, &client, flow_name, config_name)
            .await;
        let outcome = bot.process(message).await;

        let mut cache = self.cache.lock();
        cache.insert(
            Self::cache_key(session_id, &client),
            SessionEntry {
                bot,
                last_activity: (self.clock)(),
            },
        );
        Ok(outcome)
    }

    /// Read-only access to a cached session.
    pub fn inspect<R>(
        &self,
        session_id: &str,
        client_id: Option<&str>,
        f: impl FnOnce(&SalesBot) -> R,
    ) -> Option<R> {
        let client = Self::normalize_client(client_id);
        let cache = self.cache.lock();
        cache
            .get(&Self::cache_key(session_id, &client))
            .map(|entry| f(&entry.bot))
    }

    /// Snapshot (with compaction), enqueue locally, evict. Idempotent;
    /// returns false when the session is not cached.
    pub async fn close_session(&self, session_id: &str, client_id: Option<&str>) -> Result<bool> {
        let client = Self::normalize_client(client_id);
        self.ensure_client(&client, session_id)?;
        let lock_key = storage_key(session_id, client.as_deref());
        let _guard = self.locks.lock(&lock_key).await?;

        let entry = {
            let mut cache = self.cache.lock();
            cache.remove(&Self::cache_key(session_id, &client))
        };
        let Some(mut entry) = entry else {
            return Ok(false);
        };

        let snapshot = entry
            .bot
            .to_snapshot(true, self.config.history_tail_size)
            .await;
        self.buffer
            .enqueue(session_id, client.as_deref(), &snapshot)?;
        tracing::info!(
            session_id,
            client_id = client.as_deref(),
            "session closed and snapshot enqueued"
        );
        Ok(true)
    }

    /// Number of cached sessions (monitoring).
    pub fn cached_sessions(&self) -> usize {
        self.cache.lock().len()
    }

    /// Last activity timestamp for a cached session.
    pub fn last_activity(
        &self,
        session_id: &str,
        client_id: Option<&str>,
    ) -> Option<DateTime<Local>> {
        let client = Self::normalize_client(client_id);
        self.cache
            .lock()
            .get(&Self::cache_key(session_id, &client))
            .map(|entry| entry.last_activity)
    }

    async fn take_or_create(
        &self,
        session_id: &str,
        client: &Option<String>,
        flow_name: Option<&str>,
        config_name: Option<&str>,
    ) -> SalesBot {
        // 1. Cache.
        let cached = {
            let mut cache = self.cache.lock();
            cache.remove(&Self::cache_key(session_id, client))
        };
        if let Some(entry) = cached {
            let mut bot = entry.bot;
            let flow_differs = flow_name.map(|f| f != bot.flow_name()).unwrap_or(false);
            let config_differs = config_name.map(|c| c != bot.config_name()).unwrap_or(false);
            if flow_differs || config_differs {
                tracing::info!(
                    session_id,
                    from_flow = bot.flow_name(),
                    to_flow = flow_name,
                    "flow/config switch requested for active session"
                );
                let tail: Vec<HistoryTurn> = bot
                    .history()
                    .iter()
                    .rev()
                    .take(self.config.history_tail_size)
                    .rev()
                    .cloned()
                    .collect();
                let mut snapshot = bot.to_snapshot(false, self.config.history_tail_size).await;
                if let Some(flow) = flow_name {
                    snapshot.flow_name = flow.to_owned();
                }
                if let Some(config) = config_name {
                    snapshot.config_name = config.to_owned();
                }
                match SalesBot::from_snapshot(&snapshot, self.deps.clone(), tail) {
                    Ok(rebuilt) => return rebuilt,
                    Err(err) => {
                        tracing::warn!(error = %err, "flow switch rebuild failed, keeping bot");
                        return bot;
                    }
                }
            }
            tracing::debug!(session_id, "session from cache");
            return bot;
        }

        // 2. Local buffer (consumed on successful restore).
        match self.buffer.get(session_id, client.as_deref()) {
            Ok(Some(snapshot)) => {
                if self.snapshot_matches_client(&snapshot, client) {
                    if let Some(bot) = self.restore(&snapshot, session_id, flow_name, config_name)
                    {
                        let _ = self.buffer.delete(session_id, client.as_deref());
                        tracing::info!(session_id, "session restored from local snapshot buffer");
                        return bot;
                    }
                } else {
                    tracing::warn!(
                        session_id,
                        expected_client_id = client.as_deref(),
                        snapshot_client_id = snapshot.client_id.as_deref(),
                        "snapshot client_id mismatch (local buffer)"
                    );
                }
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(error = %err, "snapshot buffer read failed"),
        }

        // 3. External store: tenant-aware key first, then legacy.
        if let Some(store) = &self.store {
            let mut candidates = vec![storage_key(session_id, client.as_deref())];
            if client.is_some() {
                candidates.push(session_id.to_owned());
            }
            for key in candidates {
                match store.load(&key).await {
                    Ok(Some(snapshot)) => {
                        if self.snapshot_matches_client(&snapshot, client) {
                            if let Some(bot) =
                                self.restore(&snapshot, session_id, flow_name, config_name)
                            {
                                tracing::info!(
                                    session_id,
                                    storage_key = %key,
                                    "session restored from external snapshot"
                                );
                                return bot;
                            }
                        } else {
                            tracing::warn!(
                                session_id,
                                storage_key = %key,
                                snapshot_client_id = snapshot.client_id.as_deref(),
                                "snapshot client_id mismatch (external)"
                            );
                        }
                    }
                    Ok(None) => {}
                    Err(err) => tracing::warn!(error = %err, "external snapshot load failed"),
                }
            }
        }

        // 4. New bot.
        tracing::info!(
            session_id,
            client_id = client.as_deref(),
            "new session created"
        );
        SalesBot::new(
            session_id,
            client.as_deref(),
            flow_name.unwrap_or("spin_selling"),
            config_name.unwrap_or("default"),
            self.deps.clone(),
        )
    }

    fn snapshot_matches_client(&self, snapshot: &Snapshot, client: &Option<String>) -> bool {
        match client {
            Some(expected) => snapshot.client_id.as_deref() == Some(expected.as_str()),
            None => !self.config.require_client_id,
        }
    }

    fn restore(
        &self,
        snapshot: &Snapshot,
        session_id: &str,
        flow_name: Option<&str>,
        config_name: Option<&str>,
    ) -> Option<SalesBot> {
        let mut snapshot = snapshot.clone();
        if let Some(flow) = flow_name {
            if flow != snapshot.flow_name {
                snapshot.flow_name = flow.to_owned();
            }
        }
        if let Some(config) = config_name {
            if config != snapshot.config_name {
                snapshot.config_name = config.to_owned();
            }
        }
        let tail = self
            .tail_loader
            .as_ref()
            .map(|loader| loader(session_id))
            .unwrap_or_default();

        match SalesBot::from_snapshot(&snapshot, self.deps.clone(), tail) {
            Ok(bot) => Some(bot),
            Err(err) => {
                // Schema/version skew: discard and start fresh.
                tracing::warn!(session_id, error = %err, "failed to restore snapshot, discarding");
                None
            }
        }
    }

    /// Flush buffered snapshots to the external store once per day past
    /// the configured hour, under the cross-process advisory lock.
    /// Legacy keys are rewritten tenant-aware on the way out.
    async fn maybe_flush_batch(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let now = (self.clock)();
        if now.hour() < self.config.flush_hour {
            return;
        }
        let today = (
            chrono::Datelike::year(&now.date_naive()),
            chrono::Datelike::month(&now.date_naive()),
            chrono::Datelike::day(&now.date_naive()),
        );
        match self.buffer.last_flush_date() {
            Ok(Some(last)) if last == today => return,
            Err(err) => {
                tracing::warn!(error = %err, "flush metadata read failed");
                return;
            }
            _ => {}
        }
        match self.buffer.try_flush_lock(self.config.flush_lock_ttl_secs) {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                tracing::warn!(error = %err, "flush lock acquisition failed");
                return;
            }
        }

        let result: Result<usize> = async {
            let entries = self.buffer.get_all()?;
            let count = entries.len();
            for (_buffer_key, snapshot) in entries {
                // The external key is always tenant-aware, rewriting
                // legacy buffer entries as a side effect.
                let key = storage_key(&snapshot.conversation_id, snapshot.client_id.as_deref());
                store.save(&key, &snapshot).await?;
            }
            self.buffer.clear()?;
            self.buffer.set_last_flush_date(today)?;
            Ok(count)
        }
        .await;

        match result {
            Ok(count) => tracing::info!(count, "snapshot batch flushed"),
            // External store down: retry next request/day, buffer intact.
            Err(err) => tracing::warn!(error = %err, "batch flush failed"),
        }
        let _ = self.buffer.release_flush_lock();
    }
}
