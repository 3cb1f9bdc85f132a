//! SQL-backed conversation store: the external snapshot store used by
//! the batch flush, plus structured user profiles coalesced from
//! collected data and episodic memory.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use sf_domain::snapshot::Snapshot;
use sf_domain::{Error, Result};
use sf_engine::SalesBot;
use sf_sessions::SnapshotStore;

const STORAGE_KEY_SEPARATOR: &str = "::";

/// Split a storage key into `(user_id, session_id)`. Legacy keys carry
/// no tenant and map to an empty user id.
fn split_key(storage_key: &str) -> (String, String) {
    match storage_key.split_once(STORAGE_KEY_SEPARATOR) {
        Some((user, session)) => (user.to_owned(), session.to_owned()),
        None => (String::new(), storage_key.to_owned()),
    }
}

pub struct ConversationStore {
    conn: Mutex<Connection>,
}

impl ConversationStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path).map_err(sql_err)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(sql_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversations (
                 session_id TEXT NOT NULL,
                 user_id TEXT NOT NULL,
                 snapshot TEXT NOT NULL,
                 updated_at TEXT NOT NULL,
                 PRIMARY KEY (session_id, user_id)
             );
             CREATE TABLE IF NOT EXISTS user_profiles (
                 session_id TEXT NOT NULL,
                 user_id TEXT NOT NULL,
                 company_name TEXT,
                 company_size TEXT,
                 industry TEXT,
                 role TEXT,
                 contact_name TEXT,
                 contact_info TEXT,
                 budget_range TEXT,
                 timeline TEXT,
                 pain_points TEXT,
                 interested_features TEXT,
                 objection_types TEXT,
                 lead_score INTEGER,
                 lead_temperature TEXT,
                 outcome TEXT,
                 last_state TEXT,
                 last_intent TEXT,
                 turns INTEGER,
                 flow_name TEXT,
                 config_name TEXT,
                 frustration_level INTEGER,
                 updated_at TEXT NOT NULL,
                 PRIMARY KEY (session_id, user_id)
             );",
        )
        .map_err(sql_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Upsert the structured profile for a session, coalescing collected
    /// data with the episodic client profile (collected data wins).
    pub fn save_user_profile(&self, session_id: &str, user_id: &str, bot: &SalesBot) -> Result<()> {
        let collected = bot.collected_data();
        let profile = &bot.context_window().episodic().client_profile;

        let get_text = |key: &str| -> Option<String> {
            collected.get(key).and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
        };
        let list_json = |key: &str, episodic: &[String]| -> String {
            let mut items: Vec<String> = collected
                .get(key)
                .and_then(|v| v.as_array())
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(str::to_owned))
                        .collect()
                })
                .unwrap_or_default();
            for item in episodic {
                if !items.contains(item) {
                    items.push(item.clone());
                }
            }
            serde_json::to_string(&items).unwrap_or_else(|_| "[]".into())
        };

        let company_name = get_text("company_name").or_else(|| profile.company_name.clone());
        let company_size = get_text("company_size").or_else(|| profile.company_size.clone());
        let industry = get_text("industry").or_else(|| profile.industry.clone());
        let role = get_text("role").or_else(|| profile.role.clone());
        let contact_name = get_text("contact_name").or_else(|| profile.contact_name.clone());

        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO user_profiles (
                 session_id, user_id, company_name, company_size, industry, role,
                 contact_name, contact_info, budget_range, timeline,
                 pain_points, interested_features, objection_types,
                 lead_score, lead_temperature, outcome, last_state, last_intent,
                 turns, flow_name, config_name, frustration_level, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                       ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
            params![
                session_id,
                user_id,
                company_name,
                company_size,
                industry,
                role,
                contact_name,
                get_text("contact_info"),
                get_text("budget_range"),
                get_text("timeline"),
                list_json("pain_points", &profile.pain_points),
                list_json("interested_features", &profile.interested_features),
                list_json("objection_types", &profile.objections),
                bot.metrics()
                    .summary()
                    .get("final_lead_score")
                    .and_then(|s| s.as_i64()),
                Option::<String>::None,
                serde_json::to_value(bot.metrics().outcome())
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_owned)),
                bot.state().to_owned(),
                Option::<String>::None,
                bot.turn() as i64,
                bot.flow_name().to_owned(),
                bot.config_name().to_owned(),
                Option::<i64>::None,
                chrono::Utc::now().to_rfc3339(),
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    /// All stored profiles for a user, newest first.
    pub fn load_user_profiles(&self, user_id: &str) -> Result<Vec<serde_json::Value>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT session_id, company_name, company_size, industry, contact_name,
                        contact_info, pain_points, interested_features, objection_types,
                        outcome, last_state, turns, updated_at
                 FROM user_profiles WHERE user_id = ?1 ORDER BY updated_at DESC",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                let parse_list = |raw: Option<String>| -> serde_json::Value {
                    raw.and_then(|s| serde_json::from_str(&s).ok())
                        .unwrap_or_else(|| serde_json::Value::Array(vec![]))
                };
                Ok(serde_json::json!({
                    "session_id": row.get::<_, String>(0)?,
                    "company_name": row.get::<_, Option<String>>(1)?,
                    "company_size": row.get::<_, Option<String>>(2)?,
                    "industry": row.get::<_, Option<String>>(3)?,
                    "contact_name": row.get::<_, Option<String>>(4)?,
                    "contact_info": row.get::<_, Option<String>>(5)?,
                    "pain_points": parse_list(row.get::<_, Option<String>>(6)?),
                    "interested_features": parse_list(row.get::<_, Option<String>>(7)?),
                    "objection_types": parse_list(row.get::<_, Option<String>>(8)?),
                    "outcome": row.get::<_, Option<String>>(9)?,
                    "last_state": row.get::<_, Option<String>>(10)?,
                    "turns": row.get::<_, Option<i64>>(11)?,
                    "updated_at": row.get::<_, String>(12)?,
                }))
            })
            .map_err(sql_err)?;

        let mut profiles = Vec::new();
        for row in rows {
            profiles.push(row.map_err(sql_err)?);
        }
        Ok(profiles)
    }
}

#[async_trait::async_trait]
impl SnapshotStore for ConversationStore {
    async fn load(&self, storage_key: &str) -> Result<Option<Snapshot>> {
        let (user_id, session_id) = split_key(storage_key);
        let conn = self.conn.lock();
        let payload: Option<String> = conn
            .query_row(
                "SELECT snapshot FROM conversations WHERE session_id = ?1 AND user_id = ?2",
                params![session_id, user_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;
        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, storage_key: &str, snapshot: &Snapshot) -> Result<()> {
        let (user_id, session_id) = split_key(storage_key);
        let payload = serde_json::to_string(snapshot)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO conversations (session_id, user_id, snapshot, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![session_id, user_id, payload, chrono::Utc::now().to_rfc3339()],
        )
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
    use sf_engine::retriever::StaticRetriever;
    use sf_engine::BotDeps;
    use std::sync::Arc;

    #[tokio::test]
    async fn snapshot_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::open(&dir.path().join("db.sqlite")).unwrap();

        let deps = BotDeps::offline(Arc::new(StaticRetriever::default()));
        let mut bot = SalesBot::new("sess-1", Some("u1"), "spin_selling", "default", deps);
        bot.process("Здравствуйте!").await;
        let snapshot = bot.to_snapshot(false, 4).await;

        store.save("u1::sess-1", &snapshot).await.unwrap();
        let loaded = store.load("u1::sess-1").await.unwrap().unwrap();
        assert_eq!(loaded.conversation_id, "sess-1");
        assert!(store.load("u2::sess-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn user_profile_coalesces_collected_and_episodic() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::open(&dir.path().join("db.sqlite")).unwrap();

        let deps = BotDeps::offline(Arc::new(StaticRetriever::default()));
        let mut bot = SalesBot::new("sess-2", Some("u1"), "spin_selling", "default", deps);
        bot.process("у нас компания Ромашка, 25 сотрудников").await;
        bot.process("всё ведём вручную").await;

        store.save_user_profile("sess-2", "u1", &bot).unwrap();
        let profiles = store.load_user_profiles("u1").unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0]["company_name"], "Ромашка");
        assert!(profiles[0]["pain_points"].as_array().unwrap().len() >= 1);

        assert!(store.load_user_profiles("nobody").unwrap().is_empty());
    }
}
