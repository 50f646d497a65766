use crate::storage::{
    query_status, ChatMessageView, ChatRecord, ConnectionPatch, ConnectionRecord, MessageRecord,
    NewConnection, NewQueryExecution, PreferencesRecord, QueryExecutionRecord, StorageBackend,
    TableMetadataRecord,
};
use anyhow::{anyhow, Result};
use chrono::Utc;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_postgres::types::ToSql;
use tokio_postgres::NoTls;
use uuid::Uuid;

pub struct PostgresStorage {
    pool: Pool,
    initialized: AtomicBool,
    init_guard: Mutex<()>,
    fallback_runtime: tokio::runtime::Runtime,
}

struct PgConn<'a> {
    storage: &'a PostgresStorage,
    client: deadpool_postgres::Client,
}

impl PgConn<'_> {
    fn batch_execute(&mut self, query: &str) -> Result<()> {
        self.storage.block_on(self.client.batch_execute(query))??;
        Ok(())
    }

    fn execute(&mut self, query: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        Ok(self
            .storage
            .block_on(self.client.execute(query, params))??)
    }

    fn query(
        &mut self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<tokio_postgres::Row>> {
        Ok(self.storage.block_on(self.client.query(query, params))??)
    }

    fn query_opt(
        &mut self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<tokio_postgres::Row>> {
        Ok(self
            .storage
            .block_on(self.client.query_opt(query, params))??)
    }

    fn transaction(&mut self) -> Result<PgTx<'_>> {
        let tx = self.storage.block_on(self.client.transaction())??;
        Ok(PgTx {
            storage: self.storage,
            tx,
        })
    }
}

struct PgTx<'a> {
    storage: &'a PostgresStorage,
    tx: deadpool_postgres::Transaction<'a>,
}

impl PgTx<'_> {
    fn execute(&mut self, query: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        Ok(self.storage.block_on(self.tx.execute(query, params))??)
    }

    fn query_opt(
        &mut self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<tokio_postgres::Row>> {
        Ok(self
            .storage
            .block_on(self.tx.query_opt(query, params))??)
    }

    fn commit(self) -> Result<()> {
        self.storage.block_on(self.tx.commit())??;
        Ok(())
    }
}

impl PostgresStorage {
    pub fn new(dsn: String, connect_timeout_s: u64, pool_size: usize) -> Result<Self> {
        let cleaned = dsn.trim().to_string();
        if cleaned.is_empty() {
            return Err(anyhow!("postgres dsn is empty"));
        }
        let timeout = Duration::from_secs(connect_timeout_s.max(1));
        let mut config = cleaned.parse::<tokio_postgres::Config>()?;
        config.connect_timeout(timeout);
        let manager_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let manager = Manager::from_config(config, NoTls, manager_config);
        let max_size = if pool_size == 0 { 16 } else { pool_size };
        let pool = Pool::builder(manager).max_size(max_size).build()?;
        let fallback_runtime = tokio::runtime::Runtime::new()
            .map_err(|err| anyhow!("create tokio runtime for postgres: {err}"))?;
        Ok(Self {
            pool,
            initialized: AtomicBool::new(false),
            init_guard: Mutex::new(()),
            fallback_runtime,
        })
    }

    fn block_on<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => Ok(tokio::task::block_in_place(|| handle.block_on(fut))),
            Err(_) => Ok(self.fallback_runtime.block_on(fut)),
        }
    }

    fn now_ts() -> f64 {
        Utc::now().timestamp_millis() as f64 / 1000.0
    }

    fn json_to_string(value: &Value) -> String {
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    }

    fn json_from_str(text: &str) -> Option<Value> {
        if text.trim().is_empty() {
            return None;
        }
        serde_json::from_str::<Value>(text).ok()
    }

    fn conn(&self) -> Result<PgConn<'_>> {
        let client = self.block_on(self.pool.get())??;
        Ok(PgConn {
            storage: self,
            client,
        })
    }
}

const CONNECTION_COLUMNS: &str = "id, name, engine, credentials, owner_id, is_active, \
     description, last_connected_at, created_at, updated_at";

fn connection_from_row(row: &tokio_postgres::Row) -> Result<ConnectionRecord> {
    let credentials_text: String = row.try_get(3)?;
    Ok(ConnectionRecord {
        id: row.try_get(0)?,
        name: row.try_get(1)?,
        engine: row.try_get(2)?,
        credentials: serde_json::from_str(&credentials_text).unwrap_or_else(|_| json!({})),
        owner_id: row.try_get(4)?,
        is_active: row.try_get::<_, i32>(5)? != 0,
        description: row.try_get(6)?,
        last_connected_at: row.try_get(7)?,
        created_at: row.try_get(8)?,
        updated_at: row.try_get(9)?,
    })
}

fn chat_from_row(row: &tokio_postgres::Row) -> Result<ChatRecord> {
    Ok(ChatRecord {
        id: row.try_get(0)?,
        owner_id: row.try_get(1)?,
        connection_id: row.try_get(2)?,
        name: row.try_get(3)?,
        created_at: row.try_get(4)?,
        last_message_at: row.try_get(5)?,
    })
}

const EXECUTION_COLUMNS: &str = "id, message_id, connection_id, owner_id, sql_text, status, \
     result, row_count, error, execution_time_ms, created_at";

fn execution_from_row(row: &tokio_postgres::Row) -> Result<QueryExecutionRecord> {
    let result_text: Option<String> = row.try_get(6)?;
    Ok(QueryExecutionRecord {
        id: row.try_get(0)?,
        message_id: row.try_get(1)?,
        connection_id: row.try_get(2)?,
        owner_id: row.try_get(3)?,
        sql_text: row.try_get(4)?,
        status: row.try_get(5)?,
        result: result_text
            .as_deref()
            .and_then(PostgresStorage::json_from_str),
        row_count: row.try_get(7)?,
        error: row.try_get(8)?,
        execution_time_ms: row.try_get(9)?,
        created_at: row.try_get(10)?,
    })
}

impl StorageBackend for PostgresStorage {
    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.init_guard.lock();
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut attempts = 0u32;
        let mut conn = loop {
            attempts += 1;
            match self.conn() {
                Ok(conn) => break conn,
                Err(err) => {
                    if attempts >= 3 {
                        return Err(err);
                    }
                    std::thread::sleep(Duration::from_millis(200));
                }
            }
        };
        conn.batch_execute(
            r#"
            CREATE TABLE IF NOT EXISTS db_connections (
              id TEXT PRIMARY KEY,
              name TEXT NOT NULL,
              engine TEXT NOT NULL,
              credentials TEXT NOT NULL,
              owner_id TEXT NOT NULL,
              is_active INTEGER NOT NULL DEFAULT 1,
              description TEXT,
              last_connected_at DOUBLE PRECISION,
              created_at DOUBLE PRECISION NOT NULL,
              updated_at DOUBLE PRECISION NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_db_connections_owner
              ON db_connections (owner_id, created_at);
            CREATE TABLE IF NOT EXISTS chats (
              id TEXT PRIMARY KEY,
              owner_id TEXT NOT NULL,
              connection_id TEXT NOT NULL,
              name TEXT NOT NULL,
              created_at DOUBLE PRECISION NOT NULL,
              last_message_at DOUBLE PRECISION NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chats_owner_activity
              ON chats (owner_id, last_message_at);
            CREATE TABLE IF NOT EXISTS chat_messages (
              seq BIGSERIAL,
              id TEXT PRIMARY KEY,
              chat_id TEXT NOT NULL,
              role TEXT NOT NULL,
              content TEXT NOT NULL,
              chart_data TEXT,
              created_at DOUBLE PRECISION NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chat_messages_chat
              ON chat_messages (chat_id, seq);
            CREATE TABLE IF NOT EXISTS query_executions (
              id TEXT PRIMARY KEY,
              message_id TEXT NOT NULL,
              connection_id TEXT NOT NULL,
              owner_id TEXT NOT NULL,
              sql_text TEXT NOT NULL,
              status TEXT NOT NULL,
              result TEXT,
              row_count BIGINT,
              error TEXT,
              execution_time_ms BIGINT,
              created_at DOUBLE PRECISION NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_query_executions_message
              ON query_executions (message_id);
            CREATE TABLE IF NOT EXISTS table_metadata (
              connection_id TEXT PRIMARY KEY,
              structure TEXT NOT NULL,
              last_synced_at DOUBLE PRECISION NOT NULL
            );
            CREATE TABLE IF NOT EXISTS user_preferences (
              user_id TEXT PRIMARY KEY,
              default_connection_id TEXT,
              updated_at DOUBLE PRECISION NOT NULL
            );
            "#,
        )?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn insert_connection(&self, record: NewConnection) -> Result<ConnectionRecord> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let now = Self::now_ts();
        let id = Uuid::new_v4().to_string();
        let credentials = Self::json_to_string(&record.credentials);
        conn.execute(
            "INSERT INTO db_connections (id, name, engine, credentials, owner_id, is_active, \
             description, last_connected_at, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, 1, $6, $7, $8, $9)",
            &[
                &id,
                &record.name,
                &record.engine,
                &credentials,
                &record.owner_id,
                &record.description,
                &now,
                &now,
                &now,
            ],
        )?;
        Ok(ConnectionRecord {
            id,
            name: record.name,
            engine: record.engine,
            credentials: record.credentials,
            owner_id: record.owner_id,
            is_active: true,
            description: record.description,
            last_connected_at: Some(now),
            created_at: now,
            updated_at: now,
        })
    }

    fn get_connection(&self, id: &str) -> Result<Option<ConnectionRecord>> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let row = conn.query_opt(
            &format!("SELECT {CONNECTION_COLUMNS} FROM db_connections WHERE id = $1"),
            &[&id],
        )?;
        row.as_ref().map(connection_from_row).transpose()
    }

    fn get_connection_for_owner(
        &self,
        id: &str,
        owner_id: &str,
    ) -> Result<Option<ConnectionRecord>> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let row = conn.query_opt(
            &format!(
                "SELECT {CONNECTION_COLUMNS} FROM db_connections \
                 WHERE id = $1 AND owner_id = $2"
            ),
            &[&id, &owner_id],
        )?;
        row.as_ref().map(connection_from_row).transpose()
    }

    fn list_connections(&self, owner_id: &str) -> Result<Vec<ConnectionRecord>> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let rows = conn.query(
            &format!(
                "SELECT {CONNECTION_COLUMNS} FROM db_connections WHERE owner_id = $1 \
                 ORDER BY created_at DESC"
            ),
            &[&owner_id],
        )?;
        rows.iter().map(connection_from_row).collect()
    }

    fn update_connection(
        &self,
        id: &str,
        owner_id: &str,
        patch: ConnectionPatch,
    ) -> Result<Option<ConnectionRecord>> {
        self.ensure_initialized()?;
        if patch.is_empty() {
            return self.get_connection_for_owner(id, owner_id);
        }
        let mut sets: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn ToSql + Sync>> = Vec::new();
        if let Some(name) = patch.name {
            values.push(Box::new(name));
            sets.push(format!("name = ${}", values.len()));
        }
        if let Some(credentials) = patch.credentials.as_ref() {
            values.push(Box::new(Self::json_to_string(credentials)));
            sets.push(format!("credentials = ${}", values.len()));
        }
        if let Some(active) = patch.is_active {
            values.push(Box::new(if active { 1i32 } else { 0i32 }));
            sets.push(format!("is_active = ${}", values.len()));
        }
        if let Some(description) = patch.description {
            values.push(Box::new(description));
            sets.push(format!("description = ${}", values.len()));
        }
        values.push(Box::new(Self::now_ts()));
        sets.push(format!("updated_at = ${}", values.len()));
        values.push(Box::new(id.to_string()));
        let id_index = values.len();
        values.push(Box::new(owner_id.to_string()));
        let owner_index = values.len();
        let query = format!(
            "UPDATE db_connections SET {} WHERE id = ${} AND owner_id = ${}",
            sets.join(", "),
            id_index,
            owner_index
        );
        let affected = {
            let refs: Vec<&(dyn ToSql + Sync)> =
                values.iter().map(|value| value.as_ref()).collect();
            let mut conn = self.conn()?;
            conn.execute(&query, &refs)?
        };
        if affected == 0 {
            return Ok(None);
        }
        self.get_connection_for_owner(id, owner_id)
    }

    fn delete_connection(&self, id: &str, owner_id: &str) -> Result<bool> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let mut tx = conn.transaction()?;
        tx.execute(
            "UPDATE user_preferences SET default_connection_id = NULL \
             WHERE default_connection_id = $1",
            &[&id],
        )?;
        tx.execute(
            "DELETE FROM table_metadata WHERE connection_id = $1",
            &[&id],
        )?;
        let affected = tx.execute(
            "DELETE FROM db_connections WHERE id = $1 AND owner_id = $2",
            &[&id, &owner_id],
        )?;
        tx.commit()?;
        Ok(affected > 0)
    }

    fn touch_connection(&self, id: &str) -> Result<()> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let now = Self::now_ts();
        conn.execute(
            "UPDATE db_connections SET last_connected_at = $1, updated_at = $2 WHERE id = $3",
            &[&now, &now, &id],
        )?;
        Ok(())
    }

    fn insert_chat(&self, owner_id: &str, connection_id: &str, name: &str) -> Result<ChatRecord> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let now = Self::now_ts();
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO chats (id, owner_id, connection_id, name, created_at, last_message_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            &[&id, &owner_id, &connection_id, &name, &now, &now],
        )?;
        Ok(ChatRecord {
            id,
            owner_id: owner_id.to_string(),
            connection_id: connection_id.to_string(),
            name: name.to_string(),
            created_at: now,
            last_message_at: now,
        })
    }

    fn get_chat(&self, id: &str) -> Result<Option<ChatRecord>> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let row = conn.query_opt(
            "SELECT id, owner_id, connection_id, name, created_at, last_message_at \
             FROM chats WHERE id = $1",
            &[&id],
        )?;
        row.as_ref().map(chat_from_row).transpose()
    }

    fn list_chats(&self, owner_id: &str) -> Result<Vec<ChatRecord>> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let rows = conn.query(
            "SELECT id, owner_id, connection_id, name, created_at, last_message_at \
             FROM chats WHERE owner_id = $1 ORDER BY last_message_at DESC",
            &[&owner_id],
        )?;
        rows.iter().map(chat_from_row).collect()
    }

    fn update_chat(&self, id: &str, name: &str, last_message_at: f64) -> Result<()> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        conn.execute(
            "UPDATE chats SET name = $1, last_message_at = $2 WHERE id = $3",
            &[&name, &last_message_at, &id],
        )?;
        Ok(())
    }

    fn delete_chat(&self, id: &str, owner_id: &str) -> Result<bool> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let mut tx = conn.transaction()?;
        let owned = tx.query_opt(
            "SELECT id FROM chats WHERE id = $1 AND owner_id = $2",
            &[&id, &owner_id],
        )?;
        if owned.is_none() {
            return Ok(false);
        }
        tx.execute(
            "DELETE FROM query_executions WHERE message_id IN \
             (SELECT id FROM chat_messages WHERE chat_id = $1)",
            &[&id],
        )?;
        tx.execute("DELETE FROM chat_messages WHERE chat_id = $1", &[&id])?;
        tx.execute("DELETE FROM chats WHERE id = $1", &[&id])?;
        tx.commit()?;
        Ok(true)
    }

    fn insert_message(&self, chat_id: &str, role: &str, content: &str) -> Result<MessageRecord> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let now = Self::now_ts();
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO chat_messages (id, chat_id, role, content, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
            &[&id, &chat_id, &role, &content, &now],
        )?;
        Ok(MessageRecord {
            id,
            chat_id: chat_id.to_string(),
            role: role.to_string(),
            content: content.to_string(),
            created_at: now,
        })
    }

    fn list_messages(&self, chat_id: &str) -> Result<Vec<ChatMessageView>> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let rows = conn.query(
            "SELECT m.id, m.role, m.content, m.chart_data, m.created_at, q.sql_text, q.result \
             FROM chat_messages m \
             LEFT JOIN query_executions q ON q.message_id = m.id \
             WHERE m.chat_id = $1 ORDER BY m.seq ASC",
            &[&chat_id],
        )?;
        rows.iter()
            .map(|row| {
                let chart_text: Option<String> = row.try_get(3)?;
                let result_text: Option<String> = row.try_get(6)?;
                Ok(ChatMessageView {
                    id: row.try_get(0)?,
                    role: row.try_get(1)?,
                    content: row.try_get(2)?,
                    chart_data: chart_text.as_deref().and_then(Self::json_from_str),
                    sql_query: row.try_get(5)?,
                    query_result: result_text.as_deref().and_then(Self::json_from_str),
                    created_at: row.try_get(4)?,
                })
            })
            .collect()
    }

    fn set_message_chart(&self, message_id: &str, chart: &Value) -> Result<()> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        conn.execute(
            "UPDATE chat_messages SET chart_data = $1 WHERE id = $2",
            &[&Self::json_to_string(chart), &message_id],
        )?;
        Ok(())
    }

    fn insert_query_execution(&self, record: NewQueryExecution) -> Result<QueryExecutionRecord> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let now = Self::now_ts();
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO query_executions (id, message_id, connection_id, owner_id, sql_text, \
             status, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
            &[
                &id,
                &record.message_id,
                &record.connection_id,
                &record.owner_id,
                &record.sql_text,
                &record.status,
                &now,
            ],
        )?;
        Ok(QueryExecutionRecord {
            id,
            message_id: record.message_id,
            connection_id: record.connection_id,
            owner_id: record.owner_id,
            sql_text: record.sql_text,
            status: record.status,
            result: None,
            row_count: None,
            error: None,
            execution_time_ms: None,
            created_at: now,
        })
    }

    fn get_query_execution(&self, id: &str) -> Result<Option<QueryExecutionRecord>> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let row = conn.query_opt(
            &format!("SELECT {EXECUTION_COLUMNS} FROM query_executions WHERE id = $1"),
            &[&id],
        )?;
        row.as_ref().map(execution_from_row).transpose()
    }

    fn update_query_execution_sql(&self, id: &str, sql_text: &str) -> Result<()> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        conn.execute(
            "UPDATE query_executions SET sql_text = $1 WHERE id = $2",
            &[&sql_text, &id],
        )?;
        Ok(())
    }

    fn complete_query_execution(&self, id: &str, result: &Value, row_count: i64) -> Result<bool> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let affected = conn.execute(
            "UPDATE query_executions SET status = $1, result = $2, row_count = $3, \
             error = NULL WHERE id = $4 AND status = $5",
            &[
                &query_status::COMPLETED,
                &Self::json_to_string(result),
                &row_count,
                &id,
                &query_status::RUNNING,
            ],
        )?;
        Ok(affected > 0)
    }

    fn fail_query_execution(&self, id: &str, error: &str, execution_time_ms: i64) -> Result<bool> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let affected = conn.execute(
            "UPDATE query_executions SET status = $1, error = $2, execution_time_ms = $3 \
             WHERE id = $4 AND status IN ($5, $6)",
            &[
                &query_status::FAILED,
                &error,
                &execution_time_ms,
                &id,
                &query_status::PENDING,
                &query_status::RUNNING,
            ],
        )?;
        Ok(affected > 0)
    }

    fn upsert_table_metadata(&self, connection_id: &str, structure: &Value) -> Result<()> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let now = Self::now_ts();
        conn.execute(
            "INSERT INTO table_metadata (connection_id, structure, last_synced_at) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (connection_id) DO UPDATE SET structure = EXCLUDED.structure, \
             last_synced_at = EXCLUDED.last_synced_at",
            &[&connection_id, &Self::json_to_string(structure), &now],
        )?;
        Ok(())
    }

    fn get_table_metadata(&self, connection_id: &str) -> Result<Option<TableMetadataRecord>> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let row = conn.query_opt(
            "SELECT connection_id, structure, last_synced_at FROM table_metadata \
             WHERE connection_id = $1",
            &[&connection_id],
        )?;
        row.map(|row| {
            let structure_text: String = row.try_get(1)?;
            Ok(TableMetadataRecord {
                connection_id: row.try_get(0)?,
                structure: Self::json_from_str(&structure_text).unwrap_or_else(|| json!({})),
                last_synced_at: row.try_get(2)?,
            })
        })
        .transpose()
    }

    fn get_preferences(&self, user_id: &str) -> Result<Option<PreferencesRecord>> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let row = conn.query_opt(
            "SELECT user_id, default_connection_id, updated_at FROM user_preferences \
             WHERE user_id = $1",
            &[&user_id],
        )?;
        row.map(|row| {
            Ok(PreferencesRecord {
                user_id: row.try_get(0)?,
                default_connection_id: row.try_get(1)?,
                updated_at: row.try_get(2)?,
            })
        })
        .transpose()
    }

    fn set_default_connection(&self, user_id: &str, connection_id: &str) -> Result<()> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let now = Self::now_ts();
        conn.execute(
            "INSERT INTO user_preferences (user_id, default_connection_id, updated_at) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (user_id) DO UPDATE SET \
             default_connection_id = EXCLUDED.default_connection_id, \
             updated_at = EXCLUDED.updated_at",
            &[&user_id, &connection_id, &now],
        )?;
        Ok(())
    }
}
