use crate::storage::{
    query_status, ChatMessageView, ChatRecord, ConnectionPatch, ConnectionRecord, MessageRecord,
    NewConnection, NewQueryExecution, PreferencesRecord, QueryExecutionRecord, StorageBackend,
    TableMetadataRecord,
};
use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

pub struct SqliteStorage {
    db_path: PathBuf,
    initialized: AtomicBool,
    init_guard: Mutex<()>,
}

impl SqliteStorage {
    pub fn new(db_path: String) -> Self {
        let path = if db_path.trim().is_empty() {
            PathBuf::from("./data/dbchat.sqlite3")
        } else {
            PathBuf::from(db_path)
        };
        Self {
            db_path: path,
            initialized: AtomicBool::new(false),
            init_guard: Mutex::new(()),
        }
    }

    fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn open(&self) -> Result<Connection> {
        self.ensure_db_dir()?;
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Ok(conn)
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
}

fn connection_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConnectionRecord> {
    let credentials_text: String = row.get(3)?;
    Ok(ConnectionRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        engine: row.get(2)?,
        credentials: serde_json::from_str(&credentials_text).unwrap_or_else(|_| json!({})),
        owner_id: row.get(4)?,
        is_active: row.get::<_, i64>(5)? != 0,
        description: row.get(6)?,
        last_connected_at: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

const CONNECTION_COLUMNS: &str = "id, name, engine, credentials, owner_id, is_active, \
     description, last_connected_at, created_at, updated_at";

fn chat_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatRecord> {
    Ok(ChatRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        connection_id: row.get(2)?,
        name: row.get(3)?,
        created_at: row.get(4)?,
        last_message_at: row.get(5)?,
    })
}

fn execution_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueryExecutionRecord> {
    let result_text: Option<String> = row.get(6)?;
    Ok(QueryExecutionRecord {
        id: row.get(0)?,
        message_id: row.get(1)?,
        connection_id: row.get(2)?,
        owner_id: row.get(3)?,
        sql_text: row.get(4)?,
        status: row.get(5)?,
        result: result_text.as_deref().and_then(SqliteStorage::json_from_str),
        row_count: row.get(7)?,
        error: row.get(8)?,
        execution_time_ms: row.get(9)?,
        created_at: row.get(10)?,
    })
}

const EXECUTION_COLUMNS: &str = "id, message_id, connection_id, owner_id, sql_text, status, \
     result, row_count, error, execution_time_ms, created_at";

impl StorageBackend for SqliteStorage {
    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.init_guard.lock();
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.open()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS db_connections (
              id TEXT PRIMARY KEY,
              name TEXT NOT NULL,
              engine TEXT NOT NULL,
              credentials TEXT NOT NULL,
              owner_id TEXT NOT NULL,
              is_active INTEGER NOT NULL DEFAULT 1,
              description TEXT,
              last_connected_at REAL,
              created_at REAL NOT NULL,
              updated_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_db_connections_owner
              ON db_connections (owner_id, created_at);
            CREATE TABLE IF NOT EXISTS chats (
              id TEXT PRIMARY KEY,
              owner_id TEXT NOT NULL,
              connection_id TEXT NOT NULL,
              name TEXT NOT NULL,
              created_at REAL NOT NULL,
              last_message_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chats_owner_activity
              ON chats (owner_id, last_message_at);
            CREATE TABLE IF NOT EXISTS chat_messages (
              id TEXT PRIMARY KEY,
              chat_id TEXT NOT NULL,
              role TEXT NOT NULL,
              content TEXT NOT NULL,
              chart_data TEXT,
              created_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chat_messages_chat
              ON chat_messages (chat_id, created_at);
            CREATE TABLE IF NOT EXISTS query_executions (
              id TEXT PRIMARY KEY,
              message_id TEXT NOT NULL,
              connection_id TEXT NOT NULL,
              owner_id TEXT NOT NULL,
              sql_text TEXT NOT NULL,
              status TEXT NOT NULL,
              result TEXT,
              row_count INTEGER,
              error TEXT,
              execution_time_ms INTEGER,
              created_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_query_executions_message
              ON query_executions (message_id);
            CREATE TABLE IF NOT EXISTS table_metadata (
              connection_id TEXT PRIMARY KEY,
              structure TEXT NOT NULL,
              last_synced_at REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS user_preferences (
              user_id TEXT PRIMARY KEY,
              default_connection_id TEXT,
              updated_at REAL NOT NULL
            );
            "#,
        )?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn insert_connection(&self, record: NewConnection) -> Result<ConnectionRecord> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let now = Self::now_ts();
        let id = Uuid::new_v4().to_string();
        let credentials = Self::json_to_string(&record.credentials);
        conn.execute(
            "INSERT INTO db_connections (id, name, engine, credentials, owner_id, is_active, \
             description, last_connected_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, 1, ?, ?, ?, ?)",
            params![
                id,
                record.name,
                record.engine,
                credentials,
                record.owner_id,
                record.description,
                now,
                now,
                now
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
        let conn = self.open()?;
        let record = conn
            .query_row(
                &format!("SELECT {CONNECTION_COLUMNS} FROM db_connections WHERE id = ?"),
                params![id],
                connection_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn get_connection_for_owner(
        &self,
        id: &str,
        owner_id: &str,
    ) -> Result<Option<ConnectionRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {CONNECTION_COLUMNS} FROM db_connections WHERE id = ? AND owner_id = ?"
                ),
                params![id, owner_id],
                connection_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn list_connections(&self, owner_id: &str) -> Result<Vec<ConnectionRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONNECTION_COLUMNS} FROM db_connections WHERE owner_id = ? \
             ORDER BY created_at DESC"
        ))?;
        let records = stmt
            .query_map(params![owner_id], connection_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
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
        let conn = self.open()?;
        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();
        if let Some(name) = patch.name {
            sets.push("name = ?");
            values.push(SqlValue::Text(name));
        }
        if let Some(credentials) = patch.credentials.as_ref() {
            sets.push("credentials = ?");
            values.push(SqlValue::Text(Self::json_to_string(credentials)));
        }
        if let Some(active) = patch.is_active {
            sets.push("is_active = ?");
            values.push(SqlValue::Integer(if active { 1 } else { 0 }));
        }
        if let Some(description) = patch.description {
            sets.push("description = ?");
            values.push(SqlValue::Text(description));
        }
        sets.push("updated_at = ?");
        values.push(SqlValue::Real(Self::now_ts()));
        values.push(SqlValue::Text(id.to_string()));
        values.push(SqlValue::Text(owner_id.to_string()));
        let query = format!(
            "UPDATE db_connections SET {} WHERE id = ? AND owner_id = ?",
            sets.join(", ")
        );
        let affected = conn.execute(&query, params_from_iter(values))?;
        if affected == 0 {
            return Ok(None);
        }
        drop(conn);
        self.get_connection_for_owner(id, owner_id)
    }

    fn delete_connection(&self, id: &str, owner_id: &str) -> Result<bool> {
        self.ensure_initialized()?;
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE user_preferences SET default_connection_id = NULL \
             WHERE default_connection_id = ?",
            params![id],
        )?;
        tx.execute(
            "DELETE FROM table_metadata WHERE connection_id = ?",
            params![id],
        )?;
        let affected = tx.execute(
            "DELETE FROM db_connections WHERE id = ? AND owner_id = ?",
            params![id, owner_id],
        )?;
        tx.commit()?;
        Ok(affected > 0)
    }

    fn touch_connection(&self, id: &str) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let now = Self::now_ts();
        conn.execute(
            "UPDATE db_connections SET last_connected_at = ?, updated_at = ? WHERE id = ?",
            params![now, now, id],
        )?;
        Ok(())
    }

    fn insert_chat(&self, owner_id: &str, connection_id: &str, name: &str) -> Result<ChatRecord> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let now = Self::now_ts();
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO chats (id, owner_id, connection_id, name, created_at, last_message_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
            params![id, owner_id, connection_id, name, now, now],
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
        let conn = self.open()?;
        let record = conn
            .query_row(
                "SELECT id, owner_id, connection_id, name, created_at, last_message_at \
                 FROM chats WHERE id = ?",
                params![id],
                chat_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn list_chats(&self, owner_id: &str) -> Result<Vec<ChatRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, owner_id, connection_id, name, created_at, last_message_at \
             FROM chats WHERE owner_id = ? ORDER BY last_message_at DESC",
        )?;
        let records = stmt
            .query_map(params![owner_id], chat_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn update_chat(&self, id: &str, name: &str, last_message_at: f64) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "UPDATE chats SET name = ?, last_message_at = ? WHERE id = ?",
            params![name, last_message_at, id],
        )?;
        Ok(())
    }

    fn delete_chat(&self, id: &str, owner_id: &str) -> Result<bool> {
        self.ensure_initialized()?;
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let owned: Option<String> = tx
            .query_row(
                "SELECT id FROM chats WHERE id = ? AND owner_id = ?",
                params![id, owner_id],
                |row| row.get(0),
            )
            .optional()?;
        if owned.is_none() {
            return Ok(false);
        }
        tx.execute(
            "DELETE FROM query_executions WHERE message_id IN \
             (SELECT id FROM chat_messages WHERE chat_id = ?)",
            params![id],
        )?;
        tx.execute("DELETE FROM chat_messages WHERE chat_id = ?", params![id])?;
        tx.execute("DELETE FROM chats WHERE id = ?", params![id])?;
        tx.commit()?;
        Ok(true)
    }

    fn insert_message(&self, chat_id: &str, role: &str, content: &str) -> Result<MessageRecord> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let now = Self::now_ts();
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO chat_messages (id, chat_id, role, content, created_at) \
             VALUES (?, ?, ?, ?, ?)",
            params![id, chat_id, role, content, now],
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
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT m.id, m.role, m.content, m.chart_data, m.created_at, q.sql_text, q.result \
             FROM chat_messages m \
             LEFT JOIN query_executions q ON q.message_id = m.id \
             WHERE m.chat_id = ? ORDER BY m.created_at ASC, m.rowid ASC",
        )?;
        let records = stmt
            .query_map(params![chat_id], |row| {
                let chart_text: Option<String> = row.get(3)?;
                let result_text: Option<String> = row.get(6)?;
                Ok(ChatMessageView {
                    id: row.get(0)?,
                    role: row.get(1)?,
                    content: row.get(2)?,
                    chart_data: chart_text.as_deref().and_then(Self::json_from_str),
                    sql_query: row.get(5)?,
                    query_result: result_text.as_deref().and_then(Self::json_from_str),
                    created_at: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn set_message_chart(&self, message_id: &str, chart: &Value) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "UPDATE chat_messages SET chart_data = ? WHERE id = ?",
            params![Self::json_to_string(chart), message_id],
        )?;
        Ok(())
    }

    fn insert_query_execution(&self, record: NewQueryExecution) -> Result<QueryExecutionRecord> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let now = Self::now_ts();
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO query_executions (id, message_id, connection_id, owner_id, sql_text, \
             status, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                id,
                record.message_id,
                record.connection_id,
                record.owner_id,
                record.sql_text,
                record.status,
                now
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
        let conn = self.open()?;
        let record = conn
            .query_row(
                &format!("SELECT {EXECUTION_COLUMNS} FROM query_executions WHERE id = ?"),
                params![id],
                execution_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn update_query_execution_sql(&self, id: &str, sql_text: &str) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "UPDATE query_executions SET sql_text = ? WHERE id = ?",
            params![sql_text, id],
        )?;
        Ok(())
    }

    fn complete_query_execution(&self, id: &str, result: &Value, row_count: i64) -> Result<bool> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE query_executions SET status = ?, result = ?, row_count = ?, \
             error = NULL WHERE id = ? AND status = ?",
            params![
                query_status::COMPLETED,
                Self::json_to_string(result),
                row_count,
                id,
                query_status::RUNNING
            ],
        )?;
        Ok(affected > 0)
    }

    fn fail_query_execution(&self, id: &str, error: &str, execution_time_ms: i64) -> Result<bool> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE query_executions SET status = ?, error = ?, execution_time_ms = ? \
             WHERE id = ? AND status IN (?, ?)",
            params![
                query_status::FAILED,
                error,
                execution_time_ms,
                id,
                query_status::PENDING,
                query_status::RUNNING
            ],
        )?;
        Ok(affected > 0)
    }

    fn upsert_table_metadata(&self, connection_id: &str, structure: &Value) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let now = Self::now_ts();
        conn.execute(
            "INSERT INTO table_metadata (connection_id, structure, last_synced_at) \
             VALUES (?, ?, ?) \
             ON CONFLICT(connection_id) DO UPDATE SET structure = excluded.structure, \
             last_synced_at = excluded.last_synced_at",
            params![connection_id, Self::json_to_string(structure), now],
        )?;
        Ok(())
    }

    fn get_table_metadata(&self, connection_id: &str) -> Result<Option<TableMetadataRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let record = conn
            .query_row(
                "SELECT connection_id, structure, last_synced_at FROM table_metadata \
                 WHERE connection_id = ?",
                params![connection_id],
                |row| {
                    let structure_text: String = row.get(1)?;
                    Ok(TableMetadataRecord {
                        connection_id: row.get(0)?,
                        structure: Self::json_from_str(&structure_text)
                            .unwrap_or_else(|| json!({})),
                        last_synced_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn get_preferences(&self, user_id: &str) -> Result<Option<PreferencesRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let record = conn
            .query_row(
                "SELECT user_id, default_connection_id, updated_at FROM user_preferences \
                 WHERE user_id = ?",
                params![user_id],
                |row| {
                    Ok(PreferencesRecord {
                        user_id: row.get(0)?,
                        default_connection_id: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn set_default_connection(&self, user_id: &str, connection_id: &str) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let now = Self::now_ts();
        conn.execute(
            "INSERT INTO user_preferences (user_id, default_connection_id, updated_at) \
             VALUES (?, ?, ?) \
             ON CONFLICT(user_id) DO UPDATE SET \
             default_connection_id = excluded.default_connection_id, \
             updated_at = excluded.updated_at",
            params![user_id, connection_id, now],
        )?;
        Ok(())
    }
}
