//! Persistence for the gateway's own records: registered database
//! connections, chats, messages, query executions, schema snapshots and
//! per-user preferences. Backends are synchronous; async callers go through
//! `spawn_blocking` at their own seams.

mod postgres;
mod sqlite;

use crate::config::StorageConfig;
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::sync::Arc;

pub use postgres::PostgresStorage;
pub use sqlite::SqliteStorage;

pub mod query_status {
    pub const PENDING: &str = "pending";
    pub const RUNNING: &str = "running";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
    pub const CANCELLED: &str = "cancelled";
}

pub mod message_role {
    pub const USER: &str = "user";
    pub const ASSISTANT: &str = "assistant";
}

#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub id: String,
    pub name: String,
    pub engine: String,
    pub credentials: Value,
    pub owner_id: String,
    pub is_active: bool,
    pub description: Option<String>,
    pub last_connected_at: Option<f64>,
    pub created_at: f64,
    pub updated_at: f64,
}

#[derive(Debug, Clone)]
pub struct NewConnection {
    pub name: String,
    pub engine: String,
    pub credentials: Value,
    pub owner_id: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionPatch {
    pub name: Option<String>,
    pub credentials: Option<Value>,
    pub is_active: Option<bool>,
    pub description: Option<String>,
}

impl ConnectionPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.credentials.is_none()
            && self.is_active.is_none()
            && self.description.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct ChatRecord {
    pub id: String,
    pub owner_id: String,
    pub connection_id: String,
    pub name: String,
    pub created_at: f64,
    pub last_message_at: f64,
}

#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub id: String,
    pub chat_id: String,
    pub role: String,
    pub content: String,
    pub created_at: f64,
}

/// One message joined with its query execution, as served by the chat
/// detail endpoint.
#[derive(Debug, Clone)]
pub struct ChatMessageView {
    pub id: String,
    pub role: String,
    pub content: String,
    pub chart_data: Option<Value>,
    pub sql_query: Option<String>,
    pub query_result: Option<Value>,
    pub created_at: f64,
}

#[derive(Debug, Clone)]
pub struct QueryExecutionRecord {
    pub id: String,
    pub message_id: String,
    pub connection_id: String,
    pub owner_id: String,
    pub sql_text: String,
    pub status: String,
    pub result: Option<Value>,
    pub row_count: Option<i64>,
    pub error: Option<String>,
    pub execution_time_ms: Option<i64>,
    pub created_at: f64,
}

#[derive(Debug, Clone)]
pub struct NewQueryExecution {
    pub message_id: String,
    pub connection_id: String,
    pub owner_id: String,
    pub sql_text: String,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct TableMetadataRecord {
    pub connection_id: String,
    pub structure: Value,
    pub last_synced_at: f64,
}

#[derive(Debug, Clone)]
pub struct PreferencesRecord {
    pub user_id: String,
    pub default_connection_id: Option<String>,
    pub updated_at: f64,
}

pub trait StorageBackend: Send + Sync {
    fn ensure_initialized(&self) -> Result<()>;

    // registered database connections
    fn insert_connection(&self, record: NewConnection) -> Result<ConnectionRecord>;
    fn get_connection(&self, id: &str) -> Result<Option<ConnectionRecord>>;
    fn get_connection_for_owner(&self, id: &str, owner_id: &str)
        -> Result<Option<ConnectionRecord>>;
    fn list_connections(&self, owner_id: &str) -> Result<Vec<ConnectionRecord>>;
    fn update_connection(
        &self,
        id: &str,
        owner_id: &str,
        patch: ConnectionPatch,
    ) -> Result<Option<ConnectionRecord>>;
    fn delete_connection(&self, id: &str, owner_id: &str) -> Result<bool>;
    fn touch_connection(&self, id: &str) -> Result<()>;

    // chats and messages
    fn insert_chat(&self, owner_id: &str, connection_id: &str, name: &str) -> Result<ChatRecord>;
    fn get_chat(&self, id: &str) -> Result<Option<ChatRecord>>;
    fn list_chats(&self, owner_id: &str) -> Result<Vec<ChatRecord>>;
    fn update_chat(&self, id: &str, name: &str, last_message_at: f64) -> Result<()>;
    fn delete_chat(&self, id: &str, owner_id: &str) -> Result<bool>;
    fn insert_message(&self, chat_id: &str, role: &str, content: &str) -> Result<MessageRecord>;
    fn list_messages(&self, chat_id: &str) -> Result<Vec<ChatMessageView>>;
    fn set_message_chart(&self, message_id: &str, chart: &Value) -> Result<()>;

    // query executions; completed/failed are terminal, the guards below
    // refuse to rewrite them
    fn insert_query_execution(&self, record: NewQueryExecution) -> Result<QueryExecutionRecord>;
    fn get_query_execution(&self, id: &str) -> Result<Option<QueryExecutionRecord>>;
    fn update_query_execution_sql(&self, id: &str, sql_text: &str) -> Result<()>;
    fn complete_query_execution(&self, id: &str, result: &Value, row_count: i64) -> Result<bool>;
    fn fail_query_execution(&self, id: &str, error: &str, execution_time_ms: i64) -> Result<bool>;

    // tenant schema snapshots, one row per connection
    fn upsert_table_metadata(&self, connection_id: &str, structure: &Value) -> Result<()>;
    fn get_table_metadata(&self, connection_id: &str) -> Result<Option<TableMetadataRecord>>;

    // per-user preferences
    fn get_preferences(&self, user_id: &str) -> Result<Option<PreferencesRecord>>;
    fn set_default_connection(&self, user_id: &str, connection_id: &str) -> Result<()>;
}

/// Runs one storage call on the blocking pool.
pub async fn run_blocking<T, F>(storage: &Arc<dyn StorageBackend>, op: F) -> Result<T>
where
    F: FnOnce(&dyn StorageBackend) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let storage = Arc::clone(storage);
    match tokio::task::spawn_blocking(move || op(storage.as_ref())).await {
        Ok(result) => result,
        Err(err) => Err(anyhow!("storage task panicked: {err}")),
    }
}

pub fn build_storage(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    let backend = config.backend.trim().to_lowercase();
    let backend = if backend.is_empty() {
        "sqlite".to_string()
    } else {
        backend
    };
    match backend.as_str() {
        "sqlite" | "default" => Ok(Arc::new(SqliteStorage::new(
            config.db_path.trim().to_string(),
        ))),
        "postgres" | "postgresql" | "pg" => Ok(Arc::new(PostgresStorage::new(
            config.postgres.dsn.clone(),
            config.postgres.connect_timeout_s,
            config.postgres.pool_size,
        )?)),
        other => Err(anyhow!("unknown storage backend: {other}")),
    }
}
