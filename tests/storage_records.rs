use dbchat_server::storage::{
    message_role, query_status, ConnectionPatch, NewConnection, NewQueryExecution, SqliteStorage,
    StorageBackend,
};
use serde_json::json;
use tempfile::TempDir;

fn temp_storage(label: &str) -> (SqliteStorage, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join(format!("dbchat_{label}.db"));
    let storage = SqliteStorage::new(db_path.to_string_lossy().to_string());
    storage.ensure_initialized().unwrap();
    (storage, dir)
}

fn build_connection(owner: &str, name: &str) -> NewConnection {
    NewConnection {
        name: name.to_string(),
        engine: "postgres".to_string(),
        credentials: json!({
            "host": "127.0.0.1",
            "port": 5432,
            "database": "analytics",
            "username": "reporting",
            "password": "hunter2",
            "type": "postgres",
        }),
        owner_id: owner.to_string(),
        description: Some("reporting warehouse".to_string()),
    }
}

#[test]
fn connection_crud_is_owner_scoped() {
    let (storage, _db) = temp_storage("conn_crud");

    let inserted = storage
        .insert_connection(build_connection("owner_a", "warehouse"))
        .unwrap();
    assert!(inserted.is_active);
    assert_eq!(inserted.engine, "postgres");

    let fetched = storage.get_connection(&inserted.id).unwrap().unwrap();
    assert_eq!(fetched.credentials["host"], "127.0.0.1");
    assert_eq!(fetched.owner_id, "owner_a");

    assert!(storage
        .get_connection_for_owner(&inserted.id, "owner_b")
        .unwrap()
        .is_none());

    storage
        .insert_connection(build_connection("owner_b", "other"))
        .unwrap();
    let listed = storage.list_connections("owner_a").unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, inserted.id);

    assert!(!storage.delete_connection(&inserted.id, "owner_b").unwrap());
    assert!(storage.delete_connection(&inserted.id, "owner_a").unwrap());
    assert!(storage.get_connection(&inserted.id).unwrap().is_none());
    assert!(!storage.delete_connection(&inserted.id, "owner_a").unwrap());
}

#[test]
fn connection_patch_updates_only_named_fields() {
    let (storage, _db) = temp_storage("conn_patch");

    let inserted = storage
        .insert_connection(build_connection("owner_a", "warehouse"))
        .unwrap();
    let updated = storage
        .update_connection(
            &inserted.id,
            "owner_a",
            ConnectionPatch {
                name: Some("renamed".to_string()),
                is_active: Some(false),
                ..ConnectionPatch::default()
            },
        )
        .unwrap()
        .unwrap();
    assert_eq!(updated.name, "renamed");
    assert!(!updated.is_active);
    assert_eq!(updated.engine, "postgres");
    assert_eq!(updated.credentials["database"], "analytics");
    assert_eq!(updated.description.as_deref(), Some("reporting warehouse"));

    let foreign = storage
        .update_connection(
            &inserted.id,
            "owner_b",
            ConnectionPatch {
                name: Some("stolen".to_string()),
                ..ConnectionPatch::default()
            },
        )
        .unwrap();
    assert!(foreign.is_none());
    let kept = storage.get_connection(&inserted.id).unwrap().unwrap();
    assert_eq!(kept.name, "renamed");
}

#[test]
fn touch_refreshes_last_connected_at() {
    let (storage, _db) = temp_storage("conn_touch");

    let inserted = storage
        .insert_connection(build_connection("owner_a", "warehouse"))
        .unwrap();
    storage.touch_connection(&inserted.id).unwrap();
    let fetched = storage.get_connection(&inserted.id).unwrap().unwrap();
    let touched = fetched.last_connected_at.unwrap();
    assert!(touched >= inserted.created_at);
    assert!(fetched.updated_at >= inserted.updated_at);
}

#[test]
fn deleting_a_connection_clears_default_and_snapshot() {
    let (storage, _db) = temp_storage("conn_cleanup");

    let inserted = storage
        .insert_connection(build_connection("owner_a", "warehouse"))
        .unwrap();
    storage
        .set_default_connection("owner_a", &inserted.id)
        .unwrap();
    storage
        .upsert_table_metadata(&inserted.id, &json!({"rows": []}))
        .unwrap();

    assert!(storage.delete_connection(&inserted.id, "owner_a").unwrap());
    let preferences = storage.get_preferences("owner_a").unwrap().unwrap();
    assert!(preferences.default_connection_id.is_none());
    assert!(storage.get_table_metadata(&inserted.id).unwrap().is_none());
}

#[test]
fn chat_delete_cascades_messages_and_executions() {
    let (storage, _db) = temp_storage("chat_cascade");

    let chat = storage.insert_chat("owner_a", "db-1", "sales chat").unwrap();
    storage
        .insert_message(&chat.id, message_role::USER, "total sales by region")
        .unwrap();
    let assistant = storage
        .insert_message(&chat.id, message_role::ASSISTANT, "here is the query")
        .unwrap();
    let execution = storage
        .insert_query_execution(NewQueryExecution {
            message_id: assistant.id.clone(),
            connection_id: "db-1".to_string(),
            owner_id: "owner_a".to_string(),
            sql_text: "SELECT region, SUM(total) FROM sales GROUP BY region".to_string(),
            status: query_status::RUNNING.to_string(),
        })
        .unwrap();

    assert!(!storage.delete_chat(&chat.id, "owner_b").unwrap());
    assert_eq!(storage.list_messages(&chat.id).unwrap().len(), 2);

    assert!(storage.delete_chat(&chat.id, "owner_a").unwrap());
    assert!(storage.get_chat(&chat.id).unwrap().is_none());
    assert!(storage.list_messages(&chat.id).unwrap().is_empty());
    assert!(storage.get_query_execution(&execution.id).unwrap().is_none());
}

#[test]
fn execution_status_moves_forward_only() {
    let (storage, _db) = temp_storage("exec_status");

    let chat = storage.insert_chat("owner_a", "db-1", "chat").unwrap();
    let message = storage
        .insert_message(&chat.id, message_role::ASSISTANT, "running")
        .unwrap();
    let build = |sql: &str| NewQueryExecution {
        message_id: message.id.clone(),
        connection_id: "db-1".to_string(),
        owner_id: "owner_a".to_string(),
        sql_text: sql.to_string(),
        status: query_status::RUNNING.to_string(),
    };

    let completed = storage.insert_query_execution(build("SELECT 1")).unwrap();
    assert!(storage
        .complete_query_execution(&completed.id, &json!([{"n": 1}]), 1)
        .unwrap());
    assert!(!storage
        .fail_query_execution(&completed.id, "late failure", 10)
        .unwrap());
    let fetched = storage
        .get_query_execution(&completed.id)
        .unwrap()
        .unwrap();
    assert_eq!(fetched.status, query_status::COMPLETED);
    assert_eq!(fetched.row_count, Some(1));
    assert!(fetched.error.is_none());
    assert_eq!(fetched.result.unwrap(), json!([{"n": 1}]));

    let failed = storage.insert_query_execution(build("SELECT 2")).unwrap();
    assert!(storage.fail_query_execution(&failed.id, "boom", 42).unwrap());
    assert!(!storage
        .complete_query_execution(&failed.id, &json!([]), 0)
        .unwrap());
    let fetched = storage.get_query_execution(&failed.id).unwrap().unwrap();
    assert_eq!(fetched.status, query_status::FAILED);
    assert_eq!(fetched.error.as_deref(), Some("boom"));
    assert_eq!(fetched.execution_time_ms, Some(42));
    assert!(fetched.result.is_none());
}

#[test]
fn message_views_join_chart_and_execution() {
    let (storage, _db) = temp_storage("message_views");

    let chat = storage.insert_chat("owner_a", "db-1", "chat").unwrap();
    storage
        .insert_message(&chat.id, message_role::USER, "sales by region?")
        .unwrap();
    let assistant = storage
        .insert_message(&chat.id, message_role::ASSISTANT, "regional totals")
        .unwrap();
    let execution = storage
        .insert_query_execution(NewQueryExecution {
            message_id: assistant.id.clone(),
            connection_id: "db-1".to_string(),
            owner_id: "owner_a".to_string(),
            sql_text: "SELECT region, total FROM sales".to_string(),
            status: query_status::RUNNING.to_string(),
        })
        .unwrap();
    storage
        .complete_query_execution(&execution.id, &json!([{"region": "EMEA", "total": 42}]), 1)
        .unwrap();
    storage
        .set_message_chart(
            &assistant.id,
            &json!({"chartType": "bar", "config": {"title": "Sales"}}),
        )
        .unwrap();

    let views = storage.list_messages(&chat.id).unwrap();
    assert_eq!(views.len(), 2);
    assert_eq!(views[0].role, message_role::USER);
    assert!(views[0].sql_query.is_none());
    assert!(views[0].chart_data.is_none());
    assert_eq!(views[1].role, message_role::ASSISTANT);
    assert_eq!(
        views[1].sql_query.as_deref(),
        Some("SELECT region, total FROM sales")
    );
    assert_eq!(
        views[1].query_result.clone().unwrap(),
        json!([{"region": "EMEA", "total": 42}])
    );
    assert_eq!(views[1].chart_data.clone().unwrap()["chartType"], "bar");
}

#[test]
fn schema_snapshots_replace_on_upsert() {
    let (storage, _db) = temp_storage("snapshots");

    storage
        .upsert_table_metadata("db-1", &json!({"rows": [{"database_schema": "one"}]}))
        .unwrap();
    storage
        .upsert_table_metadata("db-1", &json!({"rows": [{"database_schema": "two"}]}))
        .unwrap();

    let snapshot = storage.get_table_metadata("db-1").unwrap().unwrap();
    assert_eq!(snapshot.connection_id, "db-1");
    assert_eq!(snapshot.structure["rows"][0]["database_schema"], "two");
    assert!(snapshot.last_synced_at > 0.0);
    assert!(storage.get_table_metadata("db-2").unwrap().is_none());
}

#[test]
fn chats_list_most_recent_first() {
    let (storage, _db) = temp_storage("chat_order");

    let first = storage.insert_chat("owner_a", "db-1", "first").unwrap();
    let second = storage.insert_chat("owner_a", "db-1", "second").unwrap();
    storage.update_chat(&first.id, "first", 100.0).unwrap();
    storage.update_chat(&second.id, "second", 200.0).unwrap();

    let listed = storage.list_chats("owner_a").unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, second.id);

    storage
        .update_chat(&first.id, "first renamed", 300.0)
        .unwrap();
    let listed = storage.list_chats("owner_a").unwrap();
    assert_eq!(listed[0].id, first.id);
    assert_eq!(listed[0].name, "first renamed");
    assert!(storage.list_chats("owner_b").unwrap().is_empty());
}

#[test]
fn default_connection_preference_upserts() {
    let (storage, _db) = temp_storage("preferences");

    assert!(storage.get_preferences("owner_a").unwrap().is_none());
    storage.set_default_connection("owner_a", "db-1").unwrap();
    let preferences = storage.get_preferences("owner_a").unwrap().unwrap();
    assert_eq!(preferences.default_connection_id.as_deref(), Some("db-1"));

    storage.set_default_connection("owner_a", "db-2").unwrap();
    let preferences = storage.get_preferences("owner_a").unwrap().unwrap();
    assert_eq!(preferences.default_connection_id.as_deref(), Some("db-2"));
}
