// Store integration tests against an in-memory SQLite database.

use chrono::Utc;
use serde_json::json;

use conveyor_core::machine::{InstanceStore, WorkflowInstance};
use conveyor_core::{DataMap, DataMapExt};
use conveyor_storage::{
    generate_encryption_key, FieldEncryptor, SqliteInstanceStore, Store, UserRecord,
};

async fn open_plain() -> Store {
    Store::open("sqlite::memory:", FieldEncryptor::disabled())
        .await
        .unwrap()
}

async fn open_encrypted(fields: &[&str]) -> Store {
    let key = generate_encryption_key("kek-v1");
    let encryptor =
        FieldEncryptor::new(&key, &[], fields.iter().map(|s| s.to_string())).unwrap();
    Store::open("sqlite::memory:", encryptor).await.unwrap()
}

fn instance(id: &str) -> WorkflowInstance {
    let mut data = DataMap::new();
    data.insert("k".into(), json!(1));
    WorkflowInstance {
        id: id.to_string(),
        workflow_type: "intake".to_string(),
        current_state: "new".to_string(),
        previous_state: None,
        data,
        start_time: Utc::now(),
        last_updated: Utc::now(),
        completed: false,
        error: None,
    }
}

// ============================================
// Migrations
// ============================================

#[tokio::test]
async fn test_migrations_idempotent_across_reopen() {
    let path = std::env::temp_dir().join(format!("conveyor-store-test-{}.db", std::process::id()));
    let _ = std::fs::remove_file(&path);
    let url = format!("sqlite://{}", path.display());

    {
        let store = Store::open(&url, FieldEncryptor::disabled()).await.unwrap();
        store.save_resource("r", "1", &DataMap::new()).await.unwrap();
        store.pool().close().await;
    }

    // Re-opening re-runs every migration against the populated file
    let store = Store::open(&url, FieldEncryptor::disabled()).await.unwrap();
    assert_eq!(store.load_resources("r").await.unwrap().len(), 1);
    store.pool().close().await;

    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
    }
}

// ============================================
// Resources
// ============================================

#[tokio::test]
async fn test_resource_round_trip() {
    let store = open_plain().await;

    let mut data = DataMap::new();
    data.insert("name".into(), json!("alice"));
    data.insert("state".into(), json!("open"));

    store.save_resource("conversations", "c1", &data).await.unwrap();

    let loaded = store
        .load_resource("conversations", "c1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded, data);

    let all = store.load_resources("conversations").await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all["c1"].get_str("name"), Some("alice"));
}

#[tokio::test]
async fn test_resource_upsert_overwrites() {
    let store = open_plain().await;

    let mut data = DataMap::new();
    data.insert("v".into(), json!(1));
    store.save_resource("r", "1", &data).await.unwrap();

    data.insert("v".into(), json!(2));
    store.save_resource("r", "1", &data).await.unwrap();

    let loaded = store.load_resource("r", "1").await.unwrap().unwrap();
    assert_eq!(loaded.get_i64("v"), Some(2));
    assert_eq!(store.load_resources("r").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_resource_delete() {
    let store = open_plain().await;
    store.save_resource("r", "1", &DataMap::new()).await.unwrap();

    assert!(store.delete_resource("r", "1").await.unwrap());
    assert!(!store.delete_resource("r", "1").await.unwrap());
    assert!(store.load_resource("r", "1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_resource_types_are_isolated() {
    let store = open_plain().await;
    store.save_resource("a", "1", &DataMap::new()).await.unwrap();
    store.save_resource("b", "1", &DataMap::new()).await.unwrap();

    assert_eq!(store.load_resources("a").await.unwrap().len(), 1);
    assert!(store.delete_resource("a", "1").await.unwrap());
    assert_eq!(store.load_resources("b").await.unwrap().len(), 1);
}

// ============================================
// PII encryption at the store boundary
// ============================================

#[tokio::test]
async fn test_pii_encrypted_at_rest_and_transparent_on_read() {
    let store = open_encrypted(&["email"]).await;

    let mut data = DataMap::new();
    data.insert("email".into(), json!("alice@example.com"));
    data.insert("note".into(), json!("visible"));
    store.save_resource("contacts", "c1", &data).await.unwrap();

    // Transparent decryption on read
    let loaded = store.load_resource("contacts", "c1").await.unwrap().unwrap();
    assert_eq!(loaded, data);

    // At rest the email column value is a self-identifying ciphertext
    let raw: String = sqlx::query_scalar(
        "SELECT data FROM resources WHERE resource_type = 'contacts' AND id = 'c1'",
    )
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert!(raw.contains("$enc$kek-v1$"));
    assert!(!raw.contains("alice@example.com"));
    assert!(raw.contains("visible"));
}

// ============================================
// Workflow instances
// ============================================

#[tokio::test]
async fn test_instance_round_trip_preserves_timestamps() {
    let store = open_plain().await;
    let original = instance("i1");
    store.save_workflow_instance(&original).await.unwrap();

    let loaded = store.load_workflow_instance("i1").await.unwrap().unwrap();
    assert_eq!(loaded.id, original.id);
    assert_eq!(loaded.workflow_type, original.workflow_type);
    assert_eq!(loaded.current_state, original.current_state);
    assert_eq!(loaded.data, original.data);
    // Nanosecond-precision storage round-trips exactly
    assert_eq!(loaded.start_time, original.start_time);
    assert_eq!(loaded.last_updated, original.last_updated);
}

#[tokio::test]
async fn test_instances_by_type() {
    let store = open_plain().await;
    store.save_workflow_instance(&instance("i1")).await.unwrap();
    store.save_workflow_instance(&instance("i2")).await.unwrap();

    let mut other = instance("x1");
    other.workflow_type = "other".into();
    store.save_workflow_instance(&other).await.unwrap();

    assert_eq!(store.load_workflow_instances("intake").await.unwrap().len(), 2);
    assert_eq!(store.load_all_workflow_instances().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_instance_store_port() {
    let store = std::sync::Arc::new(open_plain().await);
    let port = SqliteInstanceStore::new(store);

    let mut i = instance("i1");
    port.save(&i).await.unwrap();

    i.current_state = "open".into();
    i.previous_state = Some("new".into());
    port.save(&i).await.unwrap();

    let loaded = port.load("i1").await.unwrap().unwrap();
    assert_eq!(loaded.current_state, "open");
    assert_eq!(loaded.previous_state.as_deref(), Some("new"));
    assert_eq!(port.load_all().await.unwrap().len(), 1);
}

// ============================================
// Users
// ============================================

#[tokio::test]
async fn test_user_round_trip_with_encrypted_fields() {
    let store = open_encrypted(&["phone"]).await;

    let now = Utc::now();
    let mut data = DataMap::new();
    data.insert("phone".into(), json!("+1-555-0100"));
    let user = UserRecord {
        id: "u1".into(),
        email: "bob@example.com".into(),
        name: Some("Bob".into()),
        data,
        created_at: now,
        updated_at: now,
    };
    store.save_user(&user).await.unwrap();

    let users = store.load_users().await.unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0], user);

    assert!(store.delete_user("u1").await.unwrap());
    assert!(store.load_users().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_user_email_unique() {
    let store = open_plain().await;
    let now = Utc::now();
    let user = UserRecord {
        id: "u1".into(),
        email: "same@example.com".into(),
        name: None,
        data: DataMap::new(),
        created_at: now,
        updated_at: now,
    };
    store.save_user(&user).await.unwrap();

    let mut clash = user.clone();
    clash.id = "u2".into();
    assert!(store.save_user(&clash).await.is_err());
}
