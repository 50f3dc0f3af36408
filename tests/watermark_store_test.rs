use change_relay::sync::{FileWatermarkStore, SyncError, WatermarkStore};
use tempfile::tempdir;

#[tokio::test]
async fn test_get_returns_zero_when_never_set() {
    let dir = tempdir().unwrap();
    let store = FileWatermarkStore::new(dir.path()).await.unwrap();

    assert_eq!(store.get("employees").await.unwrap(), 0);
}

#[tokio::test]
async fn test_set_then_get_roundtrip() {
    let dir = tempdir().unwrap();
    let store = FileWatermarkStore::new(dir.path()).await.unwrap();

    store.set("employees", 42).await.unwrap();
    assert_eq!(store.get("employees").await.unwrap(), 42);

    // Overwrite semantics: last write wins
    store.set("employees", 50).await.unwrap();
    assert_eq!(store.get("employees").await.unwrap(), 50);
}

#[tokio::test]
async fn test_watermark_survives_reopen() {
    let dir = tempdir().unwrap();

    {
        let store = FileWatermarkStore::new(dir.path()).await.unwrap();
        store.set("employees", 123).await.unwrap();
    }

    let store = FileWatermarkStore::new(dir.path()).await.unwrap();
    assert_eq!(store.get("employees").await.unwrap(), 123);
}

#[tokio::test]
async fn test_initialize_if_absent_is_idempotent() {
    let dir = tempdir().unwrap();
    let store = FileWatermarkStore::new(dir.path()).await.unwrap();

    store.initialize_if_absent("employees").await.unwrap();
    assert_eq!(store.get("employees").await.unwrap(), 0);

    // A second init must not clobber an advanced watermark
    store.set("employees", 9).await.unwrap();
    store.initialize_if_absent("employees").await.unwrap();
    assert_eq!(store.get("employees").await.unwrap(), 9);
}

#[tokio::test]
async fn test_on_disk_format_is_a_decimal_string() {
    let dir = tempdir().unwrap();
    let store = FileWatermarkStore::new(dir.path()).await.unwrap();

    store.set("employees", 987654321).await.unwrap();

    let contents = std::fs::read_to_string(dir.path().join("employees.version")).unwrap();
    assert_eq!(contents, "987654321");
}

#[tokio::test]
async fn test_tables_get_independent_keys() {
    let dir = tempdir().unwrap();
    let store = FileWatermarkStore::new(dir.path()).await.unwrap();

    store.set("employees", 10).await.unwrap();
    store.set("orders", 20).await.unwrap();

    assert_eq!(store.get("employees").await.unwrap(), 10);
    assert_eq!(store.get("orders").await.unwrap(), 20);
}

#[tokio::test]
async fn test_corrupt_value_surfaces_as_store_unavailable() {
    let dir = tempdir().unwrap();
    let store = FileWatermarkStore::new(dir.path()).await.unwrap();

    std::fs::write(dir.path().join("employees.version"), "not-a-number").unwrap();

    match store.get("employees").await {
        Err(SyncError::StoreUnavailable(msg)) => assert!(msg.contains("employees")),
        other => panic!("expected StoreUnavailable, got {:?}", other),
    }
}
