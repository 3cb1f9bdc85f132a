//! Durable local snapshot buffer.
//!
//! SQLite in WAL mode so multiple workers on one host can enqueue
//! concurrently. Snapshots wait here until the daily batch flush pushes
//! them to the external store.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};

use sf_domain::snapshot::Snapshot;
use sf_domain::{Error, Result};

const FLUSH_LOCK_NAME: &str = "snapshot_batch_flush";
const STORAGE_KEY_SEPARATOR: &str = "::";

/// Buffer key for a `(client, session)` pair. Legacy entries without a
/// tenant use the bare session id.
pub fn storage_key(session_id: &str, client_id: Option<&str>) -> String {
    match client_id.filter(|c| !c.trim().is_empty()) {
        Some(client) => format!("{}{}{}", client.trim(), STORAGE_KEY_SEPARATOR, session_id),
        None => session_id.to_owned(),
    }
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub struct SnapshotBuffer {
    db_path: PathBuf,
}

impl SnapshotBuffer {
    /// Open (and initialize) the buffer at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let buffer = Self {
            db_path: db_path.to_path_buf(),
        };
        let conn = buffer.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS snapshots (
                 session_id TEXT PRIMARY KEY,
                 snapshot_json TEXT NOT NULL,
                 updated_at REAL NOT NULL
             );
             CREATE TABLE IF NOT EXISTS metadata (
                 key TEXT PRIMARY KEY,
                 value TEXT
             );
             CREATE TABLE IF NOT EXISTS locks (
                 name TEXT PRIMARY KEY,
                 locked_at REAL NOT NULL,
                 expires_at REAL NOT NULL
             );",
        )
        .map_err(sql_err)?;
        Ok(buffer)
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path).map_err(sql_err)?;
        conn.busy_timeout(std::time::Duration::from_secs(30))
            .map_err(sql_err)?;
        // WAL is mandatory: the buffer is shared across worker processes.
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(sql_err)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(sql_err)?;
        Ok(conn)
    }

    /// Upsert a snapshot.
    pub fn enqueue(
        &self,
        session_id: &str,
        client_id: Option<&str>,
        snapshot: &Snapshot,
    ) -> Result<()> {
        let key = storage_key(session_id, client_id);
        let payload = serde_json::to_string(snapshot)?;
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO snapshots (session_id, snapshot_json, updated_at)
             VALUES (?1, ?2, ?3)",
            params![key, payload, now_epoch()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    /// Fetch a snapshot: tenant-aware key first, then the legacy key.
    pub fn get(&self, session_id: &str, client_id: Option<&str>) -> Result<Option<Snapshot>> {
        let conn = self.connect()?;
        for key in [storage_key(session_id, client_id), session_id.to_owned()] {
            let row: Option<String> = conn
                .query_row(
                    "SELECT snapshot_json FROM snapshots WHERE session_id = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql_err)?;
            if let Some(payload) = row {
                return Ok(Some(serde_json::from_str(&payload)?));
            }
        }
        Ok(None)
    }

    pub fn delete(&self, session_id: &str, client_id: Option<&str>) -> Result<()> {
        let conn = self.connect()?;
        for key in [storage_key(session_id, client_id), session_id.to_owned()] {
            conn.execute("DELETE FROM snapshots WHERE session_id = ?1", params![key])
                .map_err(sql_err)?;
        }
        Ok(())
    }

    /// All buffered entries as `(storage_key, snapshot)`.
    pub fn get_all(&self) -> Result<Vec<(String, Snapshot)>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare("SELECT session_id, snapshot_json FROM snapshots")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(sql_err)?;

        let mut result = Vec::new();
        for row in rows {
            let (key, payload) = row.map_err(sql_err)?;
            match serde_json::from_str(&payload) {
                Ok(snapshot) => result.push((key, snapshot)),
                Err(err) => {
                    tracing::warn!(key, error = %err, "skipping undecodable buffered snapshot");
                }
            }
        }
        Ok(result)
    }

    pub fn clear(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute("DELETE FROM snapshots", [])
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.connect()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))
            .map_err(sql_err)?;
        Ok(count as usize)
    }

    // ── Flush metadata and lock ────────────────────────────────────

    /// Date of the last batch flush, as `(year, month, day)`.
    pub fn last_flush_date(&self) -> Result<Option<(i32, u32, u32)>> {
        let conn = self.connect()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM metadata WHERE key = 'last_flush_date'",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;
        Ok(value.and_then(|v| {
            let parts: Vec<i64> = v.split('-').filter_map(|p| p.parse().ok()).collect();
            match parts.as_slice() {
                [y, m, d] => Some((*y as i32, *m as u32, *d as u32)),
                _ => None,
            }
        }))
    }

    pub fn set_last_flush_date(&self, date: (i32, u32, u32)) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES ('last_flush_date', ?1)",
            params![format!("{:04}-{:02}-{:02}", date.0, date.1, date.2)],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    /// Try to take the advisory flush lock. Only one process on the
    /// host performs the daily flush.
    pub fn try_flush_lock(&self, ttl_seconds: f64) -> Result<bool> {
        let now = now_epoch();
        let conn = self.connect()?;
        conn.execute_batch("BEGIN IMMEDIATE").map_err(sql_err)?;
        let expires: Option<f64> = conn
            .query_row(
                "SELECT expires_at FROM locks WHERE name = ?1",
                params![FLUSH_LOCK_NAME],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;
        if let Some(expires) = expires {
            if expires > now {
                conn.execute_batch("ROLLBACK").map_err(sql_err)?;
                return Ok(false);
            }
        }
        conn.execute(
            "INSERT OR REPLACE INTO locks (name, locked_at, expires_at) VALUES (?1, ?2, ?3)",
            params![FLUSH_LOCK_NAME, now, now + ttl_seconds],
        )
        .map_err(sql_err)?;
        conn.execute_batch("COMMIT").map_err(sql_err)?;
        Ok(true)
    }

    pub fn release_flush_lock(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute("DELETE FROM locks WHERE name = ?1", params![FLUSH_LOCK_NAME])
            .map_err(sql_err)?;
        Ok(())
    }
}

fn sql_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn snapshot(session: &str, client: Option<&str>) -> Snapshot {
        Snapshot {
            version: sf_domain::snapshot::SNAPSHOT_VERSION,
            client_id: client.map(str::to_owned),
            conversation_id: session.to_owned(),
            flow_name: "spin_selling".into(),
            config_name: "default".into(),
            state_machine: Value::Null,
            conversation_guard: Value::Null,
            lead_scorer: Value::Null,
            fallback_handler: Value::Null,
            objection_handler: Value::Null,
            tone_analyzer: Value::Null,
            context_window: Value::Null,
            metrics: Value::Null,
            intent_tracker: Value::Null,
            history: vec![],
            history_compact: None,
            history_compact_meta: None,
        }
    }

    fn buffer() -> (tempfile::TempDir, SnapshotBuffer) {
        let dir = tempfile::tempdir().unwrap();
        let buffer = SnapshotBuffer::open(&dir.path().join("buffer.sqlite")).unwrap();
        (dir, buffer)
    }

    #[test]
    fn enqueue_get_delete_round_trip() {
        let (_dir, buffer) = buffer();
        buffer
            .enqueue("sess-1", Some("c1"), &snapshot("sess-1", Some("c1")))
            .unwrap();
        assert_eq!(buffer.count().unwrap(), 1);

        let loaded = buffer.get("sess-1", Some("c1")).unwrap().unwrap();
        assert_eq!(loaded.conversation_id, "sess-1");

        buffer.delete("sess-1", Some("c1")).unwrap();
        assert_eq!(buffer.count().unwrap(), 0);
        assert!(buffer.get("sess-1", Some("c1")).unwrap().is_none());
    }

    #[test]
    fn enqueue_is_an_upsert() {
        let (_dir, buffer) = buffer();
        buffer
            .enqueue("sess-1", Some("c1"), &snapshot("sess-1", Some("c1")))
            .unwrap();
        buffer
            .enqueue("sess-1", Some("c1"), &snapshot("sess-1", Some("c1")))
            .unwrap();
        assert_eq!(buffer.count().unwrap(), 1);
    }

    #[test]
    fn tenants_do_not_collide() {
        let (_dir, buffer) = buffer();
        buffer
            .enqueue("sess-X", Some("c1"), &snapshot("sess-X", Some("c1")))
            .unwrap();
        buffer
            .enqueue("sess-X", Some("c2"), &snapshot("sess-X", Some("c2")))
            .unwrap();
        assert_eq!(buffer.count().unwrap(), 2);

        let c1 = buffer.get("sess-X", Some("c1")).unwrap().unwrap();
        let c2 = buffer.get("sess-X", Some("c2")).unwrap().unwrap();
        assert_eq!(c1.client_id.as_deref(), Some("c1"));
        assert_eq!(c2.client_id.as_deref(), Some("c2"));
    }

    #[test]
    fn legacy_key_is_found_for_tenant_request() {
        let (_dir, buffer) = buffer();
        // Legacy entry written without a tenant prefix.
        buffer
            .enqueue("sess-legacy", None, &snapshot("sess-legacy", Some("c1")))
            .unwrap();
        let loaded = buffer.get("sess-legacy", Some("c1")).unwrap();
        assert!(loaded.is_some());
    }

    #[test]
    fn flush_lock_is_exclusive_until_released() {
        let (_dir, buffer) = buffer();
        assert!(buffer.try_flush_lock(600.0).unwrap());
        assert!(!buffer.try_flush_lock(600.0).unwrap());
        buffer.release_flush_lock().unwrap();
        assert!(buffer.try_flush_lock(600.0).unwrap());
    }

    #[test]
    fn expired_flush_lock_can_be_retaken() {
        let (_dir, buffer) = buffer();
        assert!(buffer.try_flush_lock(-1.0).unwrap());
        assert!(buffer.try_flush_lock(600.0).unwrap());
    }

    #[test]
    fn last_flush_date_round_trip() {
        let (_dir, buffer) = buffer();
        assert!(buffer.last_flush_date().unwrap().is_none());
        buffer.set_last_flush_date((2026, 8, 1)).unwrap();
        assert_eq!(buffer.last_flush_date().unwrap(), Some((2026, 8, 1)));
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.sqlite");
        {
            let buffer = SnapshotBuffer::open(&path).unwrap();
            buffer
                .enqueue("sess-1", Some("c1"), &snapshot("sess-1", Some("c1")))
                .unwrap();
        }
        let reopened = SnapshotBuffer::open(&path).unwrap();
        assert_eq!(reopened.count().unwrap(), 1);
    }
}
