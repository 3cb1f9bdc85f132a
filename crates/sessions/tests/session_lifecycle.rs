//! End-to-end session lifecycle: restore across manager instances,
//! tenant isolation, and the daily batch flush.

use std::path::Path;
use std::sync::Arc;

use chrono::{Local, TimeZone};

use sf_engine::retriever::StaticRetriever;
use sf_engine::BotDeps;
use sf_sessions::{InMemorySnapshotStore, SessionManager, SessionManagerConfig, SnapshotStore};

fn deps() -> BotDeps {
    BotDeps::offline(Arc::new(StaticRetriever::default()))
}

fn manager(dir: &Path) -> SessionManager {
    SessionManager::new(
        &dir.join("buffer.sqlite"),
        &dir.join("locks"),
        deps(),
        SessionManagerConfig::default(),
    )
    .unwrap()
}

#[tokio::test]
async fn restore_across_manager_instances() {
    let dir = tempfile::tempdir().unwrap();

    // First process: run a short dialogue and close.
    {
        let manager = manager(dir.path());
        manager
            .process_message("sess-A", Some("c1"), Some("spin_selling"), None, "Здравствуйте!")
            .await
            .unwrap();
        manager
            .process_message(
                "sess-A",
                Some("c1"),
                None,
                None,
                "у нас компания ТехноМаркет",
            )
            .await
            .unwrap();
        manager
            .process_message(
                "sess-A",
                Some("c1"),
                None,
                None,
                "главная боль — потеря лидов, всё вручную",
            )
            .await
            .unwrap();

        assert!(manager.close_session("sess-A", Some("c1")).await.unwrap());
        assert_eq!(manager.buffer().count().unwrap(), 1);
        // Closing again is a no-op.
        assert!(!manager.close_session("sess-A", Some("c1")).await.unwrap());
    }

    // Fresh manager over the same buffer: the snapshot is consumed and
    // the restored bot still knows the facts.
    let manager2 = manager(dir.path());
    let outcome = manager2
        .process_message(
            "sess-A",
            Some("c1"),
            None,
            None,
            "так, на чём мы остановились?",
        )
        .await
        .unwrap();

    assert!(
        outcome.response.contains("ТехноМаркет"),
        "restored response should mention the company: {}",
        outcome.response
    );
    assert!(
        outcome.response.contains("потеря лидов") || outcome.response.contains("вручную"),
        "restored response should mention the pain: {}",
        outcome.response
    );
    assert_eq!(manager2.buffer().count().unwrap(), 0);
}

#[tokio::test]
async fn tenant_isolation_for_same_session_id() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(manager(dir.path()));

    // Both tenants use the same session id, concurrently.
    let m1 = manager.clone();
    let m2 = manager.clone();
    let t1 = tokio::spawn(async move {
        m1.process_message(
            "sess-X",
            Some("c1"),
            None,
            None,
            "у нас компания Альфа, 10 сотрудников",
        )
        .await
        .unwrap()
    });
    let t2 = tokio::spawn(async move {
        m2.process_message(
            "sess-X",
            Some("c2"),
            None,
            None,
            "у нас компания Бета, 900 сотрудников",
        )
        .await
        .unwrap()
    });
    t1.await.unwrap();
    t2.await.unwrap();

    let c1_company = manager
        .inspect("sess-X", Some("c1"), |bot| {
            bot.collected_data().get("company_name").cloned()
        })
        .unwrap()
        .unwrap();
    let c2_company = manager
        .inspect("sess-X", Some("c2"), |bot| {
            bot.collected_data().get("company_name").cloned()
        })
        .unwrap()
        .unwrap();
    assert_eq!(c1_company, serde_json::Value::String("Альфа".into()));
    assert_eq!(c2_company, serde_json::Value::String("Бета".into()));

    // Episodic memories are separate too.
    let c1_profile = manager
        .inspect("sess-X", Some("c1"), |bot| {
            bot.context_window().episodic().profile_summary()
        })
        .unwrap();
    assert!(c1_profile.contains("Альфа"));
    assert!(!c1_profile.contains("Бета"));

    // Snapshots carry distinct tenants.
    manager.close_session("sess-X", Some("c1")).await.unwrap();
    manager.close_session("sess-X", Some("c2")).await.unwrap();
    let all = manager.buffer().get_all().unwrap();
    assert_eq!(all.len(), 2);
    let clients: Vec<_> = all
        .iter()
        .map(|(_, s)| s.client_id.clone().unwrap())
        .collect();
    assert!(clients.contains(&"c1".to_string()));
    assert!(clients.contains(&"c2".to_string()));
}

#[tokio::test]
async fn missing_client_id_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path());
    let err = manager
        .process_message("sess-1", None, None, None, "привет")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("client_id"));
}

#[tokio::test]
async fn mismatched_tenant_snapshot_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path());

    manager
        .process_message("sess-Y", Some("c1"), None, None, "компания Альфа у нас")
        .await
        .unwrap();
    manager.close_session("sess-Y", Some("c1")).await.unwrap();

    // Another tenant asks for the same session id: no bleed-over.
    manager
        .process_message("sess-Y", Some("c2"), None, None, "здравствуйте")
        .await
        .unwrap();
    let c2_data = manager
        .inspect("sess-Y", Some("c2"), |bot| bot.collected_data().clone())
        .unwrap();
    assert!(!c2_data.contains_key("company_name"));
    // The original snapshot stays buffered for its rightful owner.
    assert_eq!(manager.buffer().count().unwrap(), 1);
}

fn manager_with_clock(
    dir: &Path,
    store: Arc<InMemorySnapshotStore>,
    at: chrono::DateTime<Local>,
) -> SessionManager {
    SessionManager::new(
        &dir.join("buffer.sqlite"),
        &dir.join("locks"),
        deps(),
        SessionManagerConfig::default(),
    )
    .unwrap()
    .with_store(store)
    .with_clock(Box::new(move || at))
}

#[tokio::test]
async fn batch_flush_moves_buffer_to_store_with_tenant_keys() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemorySnapshotStore::new());

    // Daytime: dialogue runs and closes, snapshot waits in the buffer.
    let afternoon = Local.with_ymd_and_hms(2026, 8, 1, 15, 0, 0).unwrap();
    {
        let manager = manager_with_clock(dir.path(), store.clone(), afternoon);
        manager
            .process_message("sess-F", Some("c1"), None, None, "компания Гамма у нас")
            .await
            .unwrap();
        manager.close_session("sess-F", Some("c1")).await.unwrap();
        assert_eq!(manager.buffer().count().unwrap(), 1);
        assert_eq!(store.len(), 0);
    }

    // The first request past the flush hour triggers the batch flush.
    let late_evening = Local.with_ymd_and_hms(2026, 8, 1, 23, 30, 0).unwrap();
    let manager = manager_with_clock(dir.path(), store.clone(), late_evening);
    manager
        .process_message("sess-other", Some("c1"), None, None, "привет")
        .await
        .unwrap();

    assert_eq!(manager.buffer().count().unwrap(), 0);
    assert_eq!(store.len(), 1);
    let snapshot = store.load("c1::sess-F").await.unwrap();
    assert!(snapshot.is_some(), "store keys: {:?}", store.keys());
    assert_eq!(
        manager.buffer().last_flush_date().unwrap(),
        Some((2026, 8, 1))
    );
}

#[tokio::test]
async fn flush_runs_once_per_day() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemorySnapshotStore::new());

    let afternoon = Local.with_ymd_and_hms(2026, 8, 1, 15, 0, 0).unwrap();
    {
        let manager = manager_with_clock(dir.path(), store.clone(), afternoon);
        manager
            .process_message("s1", Some("c1"), None, None, "привет")
            .await
            .unwrap();
        manager.close_session("s1", Some("c1")).await.unwrap();
    }

    let late = Local.with_ymd_and_hms(2026, 8, 1, 23, 0, 0).unwrap();
    let manager = manager_with_clock(dir.path(), store.clone(), late);
    manager
        .process_message("s2", Some("c1"), None, None, "привет")
        .await
        .unwrap();
    assert_eq!(store.len(), 1);

    // A later close the same evening stays buffered until tomorrow.
    manager.close_session("s2", Some("c1")).await.unwrap();
    manager
        .process_message("s3", Some("c1"), None, None, "привет")
        .await
        .unwrap();
    assert_eq!(manager.buffer().count().unwrap(), 1);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn restore_from_external_store_via_legacy_key() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemorySnapshotStore::new());

    // Seed the store with a legacy (non-tenant) key.
    let seed_manager = manager(dir.path());
    seed_manager
        .process_message("sess-L", Some("c1"), None, None, "компания Дельта у нас")
        .await
        .unwrap();
    seed_manager.close_session("sess-L", Some("c1")).await.unwrap();
    let (_key, snapshot) = seed_manager.buffer().get_all().unwrap().pop().unwrap();
    store.save("sess-L", &snapshot).await.unwrap();
    seed_manager.buffer().clear().unwrap();

    let manager = SessionManager::new(
        &dir.path().join("buffer2.sqlite"),
        &dir.path().join("locks2"),
        deps(),
        SessionManagerConfig::default(),
    )
    .unwrap()
    .with_store(store.clone());

    manager
        .process_message("sess-L", Some("c1"), None, None, "на чём остановились?")
        .await
        .unwrap();
    let company = manager
        .inspect("sess-L", Some("c1"), |bot| {
            bot.collected_data().get("company_name").cloned()
        })
        .unwrap();
    assert_eq!(company, Some(serde_json::Value::String("Дельта".into())));
}
