//! Integration tests for explicit load and save.
//!
//! Every test runs against a private in-memory SQLite database.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::RecordingDriver;
use serde_json::json;
use stowage_engine::{CellValue, Content, DatabasePersisterConfig, JsonConfig, TableEntry, TabularConfig, ValuesConfig};
use stowage_persister::db::Param;
use stowage_persister::{
    ChangeOrigin, MemoryStore, PersistError, Persister, PersisterOptions, ReactiveStore, Subscription, SubscriptionId,
    SyncState,
};

fn persister(
    store: &Arc<MemoryStore>,
    driver: &Arc<RecordingDriver>,
    config: impl Into<DatabasePersisterConfig>,
) -> Persister {
    Persister::new(store.clone(), driver.clone(), config, PersisterOptions::default()).unwrap()
}

fn pets_config() -> TabularConfig {
    TabularConfig::new().both("pets", "pets")
}

// ============================================================================
// JSON mode
// ============================================================================

#[tokio::test]
async fn json_save_writes_single_row() {
    let driver = RecordingDriver::new().await;
    let store = MemoryStore::new_shared();
    store.set_cell("pets", "fido", "species", "dog");

    let persister = persister(&store, &driver, DatabasePersisterConfig::json());
    let report = persister.save().await.unwrap();
    assert_eq!(report.written.len(), 1);

    let rows = driver.rows("tinybase").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["_id"], json!("_"));
    assert_eq!(rows[0]["store"], json!(r#"[{"pets":{"fido":{"species":"dog"}}},{}]"#));
}

#[tokio::test]
async fn json_load_reflects_external_replacement() {
    let driver = RecordingDriver::new().await;
    let store = MemoryStore::new_shared();
    store.set_cell("pets", "fido", "species", "dog");
    let persister = persister(&store, &driver, DatabasePersisterConfig::json());
    persister.save().await.unwrap();

    driver
        .external(
            "UPDATE tinybase SET store = ?1 WHERE _id = '_'",
            &[Param::text(r#"[{"pets":{"felix":{"species":"cat","lives":9}}},{"open":true}]"#)],
        )
        .await;

    let report = persister.load().await.unwrap();
    assert!(report.applied);

    let mut expected = Content::new();
    expected
        .set_cell("pets", "felix", "species", "cat")
        .set_cell("pets", "felix", "lives", 9)
        .set_value("open", true);
    assert_eq!(store.get_content(), expected);
}

#[tokio::test]
async fn json_custom_names() {
    let driver = RecordingDriver::new().await;
    let store = MemoryStore::new_shared();
    store.set_value("theme", "dark");

    let config = JsonConfig {
        store_table_name: Some("app_state".into()),
        store_id_column_name: Some("key".into()),
        store_column_name: Some("blob".into()),
    };
    persister(&store, &driver, config).save().await.unwrap();

    let rows = driver.rows("app_state").await;
    assert_eq!(rows[0]["key"], json!("_"));
    assert_eq!(rows[0]["blob"], json!(r#"[{},{"theme":"dark"}]"#));
}

#[tokio::test]
async fn json_round_trip_into_fresh_store() {
    let driver = RecordingDriver::new().await;
    let source = MemoryStore::new_shared();
    source.transaction(|content| {
        content
            .set_cell("pets", "fido", "species", "dog")
            .set_cell("pets", "fido", "age", 3)
            .set_cell("pets", "fido", "sold", false)
            .set_cell("owners", "ann", "name", "Ann")
            .set_value("version", 2.5);
    });
    persister(&source, &driver, "my_store").save().await.unwrap();

    let target = MemoryStore::new_shared();
    let report = persister(&target, &driver, "my_store").load().await.unwrap();
    assert!(report.applied);
    assert_eq!(target.get_content(), source.get_content());
}

#[tokio::test]
async fn malformed_blob_leaves_store_untouched() {
    let driver = RecordingDriver::new().await;
    let store = MemoryStore::new_shared();
    store.set_cell("pets", "fido", "species", "dog");
    let persister = persister(&store, &driver, DatabasePersisterConfig::json());
    persister.save().await.unwrap();

    driver
        .external(
            "UPDATE tinybase SET store = ?1",
            &[Param::text(r#"[{"pets":{"fido":{"species":["dog"]}}},{}]"#)],
        )
        .await;

    let before = store.get_content();
    let err = persister.load().await.unwrap_err();
    assert!(matches!(err, PersistError::MalformedContent(_)));
    assert_eq!(store.get_content(), before);
    assert_eq!(persister.stats().failures, 1);
}

#[tokio::test]
async fn load_from_empty_database_is_a_no_op() {
    let driver = RecordingDriver::new().await;
    let store = MemoryStore::new_shared();
    store.set_value("local", "kept");

    let report = persister(&store, &driver, DatabasePersisterConfig::json())
        .load()
        .await
        .unwrap();
    assert!(!report.applied);
    assert_eq!(store.get_value("local"), Some(CellValue::from("kept")));
}

// ============================================================================
// Idempotent save
// ============================================================================

#[tokio::test]
async fn second_identical_save_issues_no_writes() {
    let driver = RecordingDriver::new().await;
    let store = MemoryStore::new_shared();
    store.set_cell("pets", "fido", "species", "dog");
    let persister = persister(&store, &driver, pets_config());

    let first = persister.save().await.unwrap();
    assert!(!first.is_skipped());
    let writes = driver.writes();
    assert!(writes > 0);

    let second = persister.save().await.unwrap();
    assert!(second.is_skipped());
    assert_eq!(second.commands, 0);
    assert_eq!(driver.writes(), writes);

    let stats = persister.stats();
    assert_eq!(stats.saves, 2);
    assert_eq!(stats.saves_written, 1);
    assert_eq!(stats.saves_skipped, 1);
}

#[tokio::test]
async fn only_changed_tables_are_rewritten() {
    let driver = RecordingDriver::new().await;
    let store = MemoryStore::new_shared();
    store.transaction(|content| {
        content
            .set_cell("pets", "fido", "species", "dog")
            .set_cell("toys", "ball", "color", "red");
    });
    let persister = persister(&store, &driver, pets_config().both("toys", "toys"));
    persister.save().await.unwrap();

    store.set_cell("toys", "ball", "color", "blue");
    let report = persister.save().await.unwrap();
    assert_eq!(report.written.len(), 1);
    assert_eq!(report.written[0].db_table(), "toys");
}

#[tokio::test]
async fn failed_save_retries_next_time() {
    let driver = RecordingDriver::new().await;
    let store = MemoryStore::new_shared();
    store.set_cell("pets", "fido", "species", "dog");
    let persister = persister(&store, &driver, pets_config());

    driver.set_failing(true);
    let err = persister.save().await.unwrap_err();
    assert!(matches!(err, PersistError::MediumUnavailable(_)));

    driver.set_failing(false);
    let report = persister.save().await.unwrap();
    assert!(!report.is_skipped());
    assert_eq!(driver.rows("pets").await.len(), 1);
}

#[tokio::test]
async fn concurrent_saves_are_serialized() {
    let driver = RecordingDriver::new().await;
    let store = MemoryStore::new_shared();
    store.set_cell("pets", "fido", "species", "dog");
    let persister = Arc::new(persister(&store, &driver, pets_config()));

    let saves: Vec<_> = (0..8)
        .map(|_| {
            let persister = persister.clone();
            tokio::spawn(async move { persister.save().await })
        })
        .collect();
    for save in saves {
        save.await.unwrap().unwrap();
    }

    let stats = persister.stats();
    assert_eq!(stats.saves, 8);
    assert_eq!(stats.saves_written, 1);
    assert_eq!(stats.saves_skipped, 7);
}

// ============================================================================
// Tabular mode
// ============================================================================

#[tokio::test]
async fn tabular_load_merges_external_insert() {
    let driver = RecordingDriver::new().await;
    let store = MemoryStore::new_shared();
    store.set_cell("pets", "fido", "species", "dog");
    let persister = persister(&store, &driver, pets_config());
    persister.save().await.unwrap();

    let rows = driver.rows("pets").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["_id"], json!("fido"));
    assert_eq!(rows[0]["species"], json!("dog"));

    driver
        .external("INSERT INTO pets (_id, species) VALUES ('felix', 'cat')", &[])
        .await;
    let report = persister.load().await.unwrap();
    assert!(report.applied);
    assert_eq!(report.tables, vec!["pets".to_string()]);

    assert_eq!(store.get_cell("pets", "fido", "species"), Some("dog".into()));
    assert_eq!(store.get_cell("pets", "felix", "species"), Some("cat".into()));
}

#[tokio::test]
async fn load_after_a_save_added_a_column_keeps_rows() {
    let driver = RecordingDriver::new().await;
    let store = MemoryStore::new_shared();
    store.set_cell("pets", "fido", "species", "dog");
    let persister = persister(&store, &driver, pets_config());
    persister.save().await.unwrap();
    persister.load().await.unwrap();

    store.set_cell("pets", "fido", "color", "brown");
    persister.save().await.unwrap();
    assert_eq!(driver.rows("pets").await[0]["color"], json!("brown"));

    let report = persister.load().await.unwrap();
    assert!(!report.applied);
    assert_eq!(store.get_cell("pets", "fido", "species"), Some("dog".into()));
    assert_eq!(store.get_cell("pets", "fido", "color"), Some("brown".into()));
}

/// A store that takes one caller edit right when a load reaches it.
struct RacingStore {
    inner: Arc<MemoryStore>,
    armed: AtomicBool,
}

impl RacingStore {
    fn race(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.inner.set_cell("local", "note", "text", "typed during load");
        }
    }
}

impl ReactiveStore for RacingStore {
    fn get_content(&self) -> Content {
        let content = self.inner.get_content();
        self.race();
        content
    }

    fn set_content(&self, content: Content, origin: ChangeOrigin) {
        self.inner.set_content(content, origin);
    }

    fn update(&self, origin: ChangeOrigin, edit: &mut dyn FnMut(&mut Content)) {
        self.race();
        self.inner.update(origin, edit);
    }

    fn subscribe(&self) -> Subscription {
        self.inner.subscribe()
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.unsubscribe(id);
    }
}

#[tokio::test]
async fn edits_racing_a_load_survive() {
    let driver = RecordingDriver::new().await;
    let inner = MemoryStore::new_shared();
    inner.set_cell("pets", "fido", "species", "dog");
    let store = Arc::new(RacingStore {
        inner: inner.clone(),
        armed: AtomicBool::new(false),
    });
    let persister = Persister::new(store.clone(), driver.clone(), pets_config(), PersisterOptions::default()).unwrap();
    persister.save().await.unwrap();

    driver
        .external("INSERT INTO pets (_id, species) VALUES ('felix', 'cat')", &[])
        .await;
    store.armed.store(true, Ordering::SeqCst);
    let report = persister.load().await.unwrap();

    assert!(report.applied);
    assert!(!store.armed.load(Ordering::SeqCst));
    assert!(inner.get_row("pets", "felix").is_some());
    assert_eq!(inner.get_cell("local", "note", "text"), Some("typed during load".into()));
}

#[tokio::test]
async fn tabular_load_keeps_unmapped_tables() {
    let driver = RecordingDriver::new().await;
    let store = MemoryStore::new_shared();
    store.transaction(|content| {
        content
            .set_cell("pets", "fido", "species", "dog")
            .set_cell("scratch", "x", "note", "local only");
    });
    let persister = persister(&store, &driver, pets_config());
    persister.save().await.unwrap();

    driver.external("DELETE FROM pets", &[]).await;
    persister.load().await.unwrap();

    assert_eq!(store.get_table("pets").map(|t| t.len()), Some(0));
    assert_eq!(store.get_cell("scratch", "x", "note"), Some("local only".into()));
}

#[tokio::test]
async fn asymmetric_mapping_respects_directions() {
    let driver = RecordingDriver::new().await;
    driver
        .external("CREATE TABLE remote_table (_id TEXT PRIMARY KEY, score)", &[])
        .await;
    driver
        .external("INSERT INTO remote_table (_id, score) VALUES ('r1', 10)", &[])
        .await;
    driver
        .external("CREATE TABLE local_table (_id TEXT PRIMARY KEY, note)", &[])
        .await;
    driver
        .external("INSERT INTO local_table (_id, note) VALUES ('planted', 'never read')", &[])
        .await;

    let store = MemoryStore::new_shared();
    store.transaction(|content| {
        content
            .set_cell("remote", "mine", "score", 99)
            .set_cell("local", "l1", "note", "hello");
    });
    let persister = persister(
        &store,
        &driver,
        TabularConfig::new()
            .load("remote", "remote_table")
            .save("local", "local_table"),
    );

    persister.save().await.unwrap();
    let remote_rows = driver.rows("remote_table").await;
    assert_eq!(remote_rows.len(), 1);
    assert_eq!(remote_rows[0]["_id"], json!("r1"));
    let local_rows = driver.rows("local_table").await;
    assert_eq!(local_rows.len(), 1);
    assert_eq!(local_rows[0]["_id"], json!("l1"));

    driver
        .external("INSERT INTO local_table (_id, note) VALUES ('planted', 'never read')", &[])
        .await;
    let report = persister.load().await.unwrap();
    assert_eq!(report.tables, vec!["remote".to_string()]);
    assert_eq!(store.get_cell("remote", "r1", "score"), Some(10.into()));
    assert_eq!(store.get_row("remote", "mine"), None);
    assert_eq!(store.get_row("local", "planted"), None);
    assert_eq!(store.get_cell("local", "l1", "note"), Some("hello".into()));
}

#[tokio::test]
async fn partial_failure_applies_healthy_tables() {
    let driver = RecordingDriver::new().await;
    let config = pets_config().both("owners", "owners").both("toys", "toys");

    let source = MemoryStore::new_shared();
    source.transaction(|content| {
        content
            .set_cell("pets", "fido", "species", "dog")
            .set_cell("owners", "ann", "name", "Ann")
            .set_cell("toys", "ball", "color", "red");
    });
    persister(&source, &driver, config.clone()).save().await.unwrap();

    // A blob is not a cell value.
    driver
        .external("UPDATE toys SET color = x'00ff' WHERE _id = 'ball'", &[])
        .await;

    let target = MemoryStore::new_shared();
    let err = persister(&target, &driver, config).load().await.unwrap_err();
    match err {
        PersistError::PartialLoadFailure { failed, applied } => {
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].table_id.as_deref(), Some("toys"));
            assert_eq!(applied, vec!["pets".to_string(), "owners".to_string()]);
        }
        other => panic!("expected partial failure, got {:?}", other),
    }

    assert_eq!(target.get_cell("pets", "fido", "species"), Some("dog".into()));
    assert_eq!(target.get_cell("owners", "ann", "name"), Some("Ann".into()));
    assert_eq!(target.get_table("toys"), None);
}

#[tokio::test]
async fn rows_without_ids_are_skipped_with_warning() {
    let driver = RecordingDriver::new().await;
    let store = MemoryStore::new_shared();
    store.set_cell("pets", "fido", "species", "dog");
    let persister = persister(&store, &driver, pets_config());
    persister.save().await.unwrap();

    // SQLite lets a TEXT PRIMARY KEY hold NULL.
    driver
        .external("INSERT INTO pets (_id, species) VALUES (NULL, 'ghost')", &[])
        .await;
    let report = persister.load().await.unwrap();
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(store.get_table("pets").map(|t| t.len()), Some(1));
}

#[tokio::test]
async fn custom_row_id_column_and_values_table() {
    let driver = RecordingDriver::new().await;
    let config = TabularConfig::new()
        .both(
            "owners",
            TableEntry::Detailed {
                db_table_name: "people".into(),
                row_id_column_name: Some("person_id".into()),
            },
        )
        .with_values(ValuesConfig {
            load: true,
            save: true,
            table_name: Some("settings".into()),
            row_id_column_name: None,
        });

    let source = MemoryStore::new_shared();
    source.transaction(|content| {
        content
            .set_cell("owners", "ann", "age", 40)
            .set_value("theme", "dark")
            .set_value("volume", 7);
    });
    persister(&source, &driver, config.clone()).save().await.unwrap();

    let people = driver.rows("people").await;
    assert_eq!(people[0]["person_id"], json!("ann"));
    assert_eq!(people[0]["age"], json!(40));
    let settings = driver.rows("settings").await;
    assert_eq!(settings.len(), 2);
    assert_eq!(settings[0]["_id"], json!("theme"));
    assert_eq!(settings[0]["value"], json!("dark"));

    let target = MemoryStore::new_shared();
    persister(&target, &driver, config).load().await.unwrap();
    assert_eq!(target.get_content(), source.get_content());
}

#[tokio::test]
async fn reserved_column_fails_save_without_writing() {
    let driver = RecordingDriver::new().await;
    let store = MemoryStore::new_shared();
    store.set_cell("pets", "fido", "_id", "clash");
    let persister = persister(&store, &driver, pets_config());

    let err = persister.save().await.unwrap_err();
    assert!(matches!(err, PersistError::SchemaConflict { ref cell_id, .. } if cell_id == "_id"));
    assert_eq!(driver.writes(), 0);
}

#[tokio::test]
async fn sqlite_booleans_come_back_as_numbers() {
    let driver = RecordingDriver::new().await;
    let source = MemoryStore::new_shared();
    source.set_cell("pets", "fido", "good", true);
    persister(&source, &driver, pets_config()).save().await.unwrap();

    let target = MemoryStore::new_shared();
    persister(&target, &driver, pets_config()).load().await.unwrap();
    assert_eq!(target.get_cell("pets", "fido", "good"), Some(CellValue::Number(1.0)));
}

#[tokio::test]
async fn invalid_config_is_rejected_up_front() {
    let driver = RecordingDriver::new().await;
    let store = MemoryStore::new_shared();
    let config = JsonConfig {
        store_table_name: Some("t".into()),
        store_id_column_name: Some("same".into()),
        store_column_name: Some("same".into()),
    };
    let err = Persister::new(store, driver, config, PersisterOptions::default()).unwrap_err();
    assert!(matches!(err, PersistError::InvalidConfig(_)));
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn destroyed_persister_refuses_work() {
    let driver = RecordingDriver::new().await;
    let store = MemoryStore::new_shared();
    let persister = persister(&store, &driver, pets_config());

    persister.destroy();
    assert_eq!(persister.state(), SyncState::Destroyed);
    assert!(matches!(persister.load().await, Err(PersistError::PersisterDestroyed)));
    assert!(matches!(persister.save().await, Err(PersistError::PersisterDestroyed)));
    assert!(matches!(
        persister.start_auto_load().await,
        Err(PersistError::PersisterDestroyed)
    ));
    assert!(matches!(
        persister.start_auto_save().await,
        Err(PersistError::PersisterDestroyed)
    ));

    // Destroying twice is harmless.
    persister.destroy();
}

#[tokio::test]
async fn operations_queued_at_destroy_fail_cleanly() {
    let driver = RecordingDriver::new().await;
    let store = MemoryStore::new_shared();
    store.set_cell("pets", "fido", "species", "dog");
    let persister = Arc::new(persister(&store, &driver, pets_config()));

    let saves: Vec<_> = (0..5)
        .map(|_| {
            let persister = persister.clone();
            tokio::spawn(async move { persister.save().await })
        })
        .collect();
    persister.destroy();

    for save in saves {
        match save.await.unwrap() {
            Ok(_) | Err(PersistError::PersisterDestroyed) => {}
            Err(other) => panic!("unexpected error {:?}", other),
        }
    }
    assert!(matches!(persister.save().await, Err(PersistError::PersisterDestroyed)));
}

#[tokio::test]
async fn config_is_returned_as_given() {
    let driver = RecordingDriver::new().await;
    let store = MemoryStore::new_shared();
    let persister = persister(&store, &driver, "my_store");
    assert_eq!(persister.config(), &DatabasePersisterConfig::from("my_store"));
    assert!(persister.mode().is_json());
    assert!(!persister.is_auto_loading());
    assert!(!persister.is_auto_saving());
    assert_eq!(persister.state(), SyncState::Idle);
}
