use std::fs;
use std::thread;
use std::time::Duration;

use serde_json::json;
use session_store::{
    session_file_name, session_root, FileSessionStorage, MemorySessionStorage, SessionSnapshot,
    SessionStorage, SessionStoreError,
};

fn snapshot(session_id: &str, run_count: u64) -> SessionSnapshot {
    SessionSnapshot::v1(
        session_id,
        "2026-02-14T00:00:00Z",
        run_count,
        json!({ "client_state": { "query_string": "a=1" } }),
    )
}

fn fresh_snapshot(session_id: &str, run_count: u64) -> SessionSnapshot {
    SessionSnapshot::now(session_id, run_count, json!({ "run_on_save": false }))
        .expect("current time should format")
}

#[test]
fn memory_round_trip() {
    let mut storage = MemorySessionStorage::new(Duration::from_secs(60), 8);
    storage.save(snapshot("s1", 3)).expect("save should succeed");

    let loaded = storage
        .load("s1")
        .expect("load should succeed")
        .expect("snapshot should be present");
    assert_eq!(loaded, snapshot("s1", 3));
    assert_eq!(storage.list().expect("list"), vec!["s1".to_string()]);

    storage.delete("s1").expect("delete should succeed");
    assert!(storage.load("s1").expect("load").is_none());
    storage.delete("s1").expect("second delete is a no-op");
}

#[test]
fn memory_entries_expire_after_ttl() {
    let mut storage = MemorySessionStorage::new(Duration::from_millis(10), 8);
    storage.save(snapshot("s1", 0)).expect("save");
    thread::sleep(Duration::from_millis(20));

    assert!(storage.load("s1").expect("load").is_none());
    assert_eq!(storage.evict_expired().expect("evict"), vec!["s1".to_string()]);
    assert!(storage.is_empty());
}

#[test]
fn memory_capacity_displaces_oldest() {
    let mut storage = MemorySessionStorage::new(Duration::from_secs(60), 2);
    storage.save(snapshot("s1", 0)).expect("save s1");
    thread::sleep(Duration::from_millis(2));
    storage.save(snapshot("s2", 0)).expect("save s2");
    thread::sleep(Duration::from_millis(2));
    storage.save(snapshot("s3", 0)).expect("save s3");

    assert_eq!(
        storage.list().expect("list"),
        vec!["s2".to_string(), "s3".to_string()]
    );
    assert_eq!(storage.evict_expired().expect("evict"), vec!["s1".to_string()]);
    assert!(storage.evict_expired().expect("evict").is_empty());
}

#[test]
fn memory_rejects_unsafe_session_ids() {
    let mut storage = MemorySessionStorage::new(Duration::from_secs(60), 2);
    let error = storage
        .save(snapshot("../escape", 0))
        .expect_err("path-like id must be rejected");
    assert!(matches!(error, SessionStoreError::InvalidSessionId { .. }));
}

#[test]
fn file_round_trip_uses_one_file_per_session() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let root = session_root(dir.path());
    let mut storage =
        FileSessionStorage::new(&root, Duration::from_secs(60)).expect("storage should open");

    storage.save(fresh_snapshot("s1", 2)).expect("save s1");
    storage.save(fresh_snapshot("s2", 5)).expect("save s2");

    assert!(root.join(session_file_name("s1")).is_file());
    assert_eq!(
        storage.list().expect("list"),
        vec!["s1".to_string(), "s2".to_string()]
    );
    let loaded = storage
        .load("s2")
        .expect("load should succeed")
        .expect("snapshot should be present");
    assert_eq!(loaded.script_run_count, 5);
    assert_eq!(loaded.state, json!({ "run_on_save": false }));
}

#[test]
fn file_save_overwrites_previous_snapshot() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let mut storage =
        FileSessionStorage::new(dir.path(), Duration::from_secs(60)).expect("storage should open");

    storage.save(fresh_snapshot("s1", 1)).expect("first save");
    storage.save(fresh_snapshot("s1", 4)).expect("second save");

    let loaded = storage.load("s1").expect("load").expect("present");
    assert_eq!(loaded.script_run_count, 4);
    assert_eq!(storage.list().expect("list").len(), 1);
}

#[test]
fn file_snapshot_older_than_ttl_is_evicted() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let mut storage =
        FileSessionStorage::new(dir.path(), Duration::from_secs(60)).expect("storage should open");

    // Saved in the past, so already beyond the TTL.
    storage.save(snapshot("old", 0)).expect("save old");
    storage.save(fresh_snapshot("new", 0)).expect("save new");

    assert!(storage.load("old").expect("load").is_none());
    assert_eq!(storage.evict_expired().expect("evict"), vec!["old".to_string()]);
    assert_eq!(storage.list().expect("list"), vec!["new".to_string()]);
}

#[test]
fn file_load_reports_corrupt_json() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let mut storage =
        FileSessionStorage::new(dir.path(), Duration::from_secs(60)).expect("storage should open");
    fs::write(dir.path().join(session_file_name("broken")), "{ not json").expect("write");

    let error = storage.load("broken").expect_err("corrupt file must fail");
    assert!(matches!(error, SessionStoreError::JsonParse { .. }));

    assert_eq!(
        storage.evict_expired().expect("evict"),
        vec!["broken".to_string()]
    );
}

#[test]
fn file_load_rejects_unknown_version_and_bad_timestamp() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let mut storage =
        FileSessionStorage::new(dir.path(), Duration::from_secs(60)).expect("storage should open");

    let mut future = fresh_snapshot("v2", 0);
    future.version = 2;
    storage.save(future).expect("save");
    let error = storage.load("v2").expect_err("version 2 must fail");
    assert!(matches!(
        error,
        SessionStoreError::UnsupportedVersion { found: 2, .. }
    ));

    let mut bad_time = fresh_snapshot("bad-time", 0);
    bad_time.saved_at = "yesterday".to_string();
    storage.save(bad_time).expect("save");
    let error = storage.load("bad-time").expect_err("timestamp must fail");
    assert!(matches!(
        error,
        SessionStoreError::InvalidTimestamp {
            field: "saved_at",
            ..
        }
    ));
}

#[test]
fn file_missing_snapshot_is_none() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let mut storage =
        FileSessionStorage::new(dir.path(), Duration::from_secs(60)).expect("storage should open");

    assert!(storage.load("absent").expect("load").is_none());
    storage.delete("absent").expect("delete of missing id is a no-op");
}
