//! Job kinds and their handlers. Jobs travel as JSON envelopes; dispatch is
//! an exhaustive match so an unrecognized kind fails loudly instead of being
//! silently skipped.

use crate::error::AppError;
use crate::storage::{run_blocking, StorageBackend};
use crate::userdb::{structure_sql, Credentials, QueryRunner};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub const INTROSPECT_STRUCTURE: &str = "introspect-structure";
pub const ENSURE_DEFAULT_CONNECTION: &str = "ensure-default-connection";

/// Wire form of a queued job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: String,
    pub kind: String,
    pub data: Value,
    pub attempt: u32,
    pub max_attempts: u32,
    pub enqueued_at: i64,
}

impl JobEnvelope {
    pub fn new(job: &Job, max_attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: job.kind().to_string(),
            data: job.data(),
            attempt: 1,
            max_attempts: max_attempts.max(1),
            enqueued_at: Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// Snapshot the tenant schema for a registered connection.
    IntrospectStructure { connection_id: String },
    /// Make sure the user has a default connection, picking the most
    /// recently created one when none is set.
    EnsureDefaultConnection { user_id: String },
}

impl Job {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::IntrospectStructure { .. } => INTROSPECT_STRUCTURE,
            Self::EnsureDefaultConnection { .. } => ENSURE_DEFAULT_CONNECTION,
        }
    }

    pub fn data(&self) -> Value {
        match self {
            Self::IntrospectStructure { connection_id } => json!({ "connectionId": connection_id }),
            Self::EnsureDefaultConnection { user_id } => json!({ "userId": user_id }),
        }
    }

    pub fn from_envelope(envelope: &JobEnvelope) -> Result<Self, AppError> {
        match envelope.kind.as_str() {
            INTROSPECT_STRUCTURE => {
                let connection_id = required_field(&envelope.data, "connectionId", &envelope.kind)?;
                Ok(Self::IntrospectStructure { connection_id })
            }
            ENSURE_DEFAULT_CONNECTION => {
                let user_id = required_field(&envelope.data, "userId", &envelope.kind)?;
                Ok(Self::EnsureDefaultConnection { user_id })
            }
            other => Err(AppError::unhandled_job_kind(other)),
        }
    }
}

fn required_field(data: &Value, field: &str, kind: &str) -> Result<String, AppError> {
    data.get(field)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::queue(format!("{kind} job is missing {field}")))
}

/// Shared dependencies the handlers run against.
pub struct JobContext {
    pub storage: Arc<dyn StorageBackend>,
    pub runner: Arc<dyn QueryRunner>,
}

impl JobContext {
    pub async fn dispatch(&self, job: &Job) -> Result<(), AppError> {
        match job {
            Job::IntrospectStructure { connection_id } => {
                self.introspect_structure(connection_id).await
            }
            Job::EnsureDefaultConnection { user_id } => {
                self.ensure_default_connection(user_id).await
            }
        }
    }

    /// Runs the dialect structure query against the tenant database and
    /// upserts the serialized result as the connection's schema snapshot.
    async fn introspect_structure(&self, connection_id: &str) -> Result<(), AppError> {
        let lookup_id = connection_id.to_string();
        let record = run_blocking(&self.storage, move |s| s.get_connection(&lookup_id))
            .await
            .map_err(storage_error)?
            .ok_or_else(|| {
                AppError::not_found(format!("Connection {connection_id} not found"))
            })?;

        let credentials = Credentials::from_record(&record)?;
        let sql = structure_sql(credentials.engine);
        let outcome = self
            .runner
            .execute_query(&record.id, sql, Some(&credentials))
            .await?;
        let structure = serde_json::to_value(&outcome)
            .map_err(|err| AppError::queue(format!("Structure snapshot serialization failed: {err}")))?;

        info!("storing schema snapshot for connection {}", record.id);
        let target_id = record.id.clone();
        run_blocking(&self.storage, move |s| {
            s.upsert_table_metadata(&target_id, &structure)
        })
        .await
        .map_err(storage_error)?;
        Ok(())
    }

    async fn ensure_default_connection(&self, user_id: &str) -> Result<(), AppError> {
        let owner = user_id.to_string();
        let preferences = run_blocking(&self.storage, move |s| s.get_preferences(&owner))
            .await
            .map_err(storage_error)?;
        if preferences
            .and_then(|record| record.default_connection_id)
            .is_some()
        {
            info!("default connection already set for user {user_id}");
            return Ok(());
        }

        let owner = user_id.to_string();
        let connections = run_blocking(&self.storage, move |s| s.list_connections(&owner))
            .await
            .map_err(storage_error)?;
        let latest = connections.into_iter().max_by(|a, b| {
            a.created_at
                .partial_cmp(&b.created_at)
                .unwrap_or(Ordering::Equal)
        });
        let Some(latest) = latest else {
            info!("no connections found for user {user_id}");
            return Ok(());
        };

        info!(
            "setting default connection for user {user_id} to {}",
            latest.id
        );
        let owner = user_id.to_string();
        run_blocking(&self.storage, move |s| {
            s.set_default_connection(&owner, &latest.id)
        })
        .await
        .map_err(storage_error)
    }
}

fn storage_error(err: anyhow::Error) -> AppError {
    AppError::queue(err.to_string())
}
