//! Coordinator for one chat turn. Resolves the chat and connection, stores
//! the user message, generates and executes SQL with one regeneration on
//! failure, then optionally asks for a chart. Progress streams out as
//! events; every turn ends with exactly one `error` or `complete`.

use crate::chat::stream::TurnEmitter;
use crate::chat::ChatTurnRequest;
use crate::config::RetrySettings;
use crate::error::AppError;
use crate::sqlgen::{charts, retry, GeneratedSql, SqlGeneration};
use crate::storage::{
    message_role, query_status, run_blocking, ConnectionRecord, NewQueryExecution, StorageBackend,
};
use crate::userdb::{Credentials, QueryOutcome, QueryRunner};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::error;

pub struct ChatTurn {
    storage: Arc<dyn StorageBackend>,
    runner: Arc<dyn QueryRunner>,
    generator: Arc<dyn SqlGeneration>,
}

impl ChatTurn {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        runner: Arc<dyn QueryRunner>,
        generator: Arc<dyn SqlGeneration>,
    ) -> Self {
        Self {
            storage,
            runner,
            generator,
        }
    }

    /// Drives the turn to its terminal event. Errors that escape the flow
    /// are reported on the stream rather than returned.
    pub async fn run(&self, user_id: &str, request: ChatTurnRequest, emitter: &TurnEmitter) {
        if let Err(err) = self.drive(user_id, request, emitter).await {
            report_failure(err, emitter).await;
        }
    }

    async fn drive(
        &self,
        user_id: &str,
        request: ChatTurnRequest,
        emitter: &TurnEmitter,
    ) -> Result<(), AppError> {
        let ChatTurnRequest {
            messages,
            chat_id: requested_chat_id,
            db_connection_id,
        } = request;

        let Some(last_message) = messages.last().cloned() else {
            return Err(AppError::validation("At least one message is required"));
        };

        // Resolve which connection this turn runs against.
        let preset_connection_id = if let Some(chat_id) = &requested_chat_id {
            let lookup_id = chat_id.clone();
            let chat = run_blocking(&self.storage, move |s| s.get_chat(&lookup_id))
                .await
                .map_err(storage_error)?;
            let Some(chat) = chat else {
                emitter
                    .error(json!({ "message": "Chat not found", "code": 404 }))
                    .await;
                return Ok(());
            };
            if chat.owner_id != user_id {
                emitter
                    .error(json!({ "message": "Unauthorized access to chat", "code": 403 }))
                    .await;
                return Ok(());
            }
            chat.connection_id
        } else if let Some(connection_id) = &db_connection_id {
            let lookup_id = connection_id.clone();
            let owner = user_id.to_string();
            let exists = run_blocking(&self.storage, move |s| {
                s.get_connection_for_owner(&lookup_id, &owner)
            })
            .await
            .map_err(storage_error)?;
            if exists.is_none() {
                emitter
                    .error(json!({ "message": "Invalid database connection ID", "code": 400 }))
                    .await;
                return Ok(());
            }
            connection_id.clone()
        } else {
            let owner = user_id.to_string();
            let preferences = run_blocking(&self.storage, move |s| s.get_preferences(&owner))
                .await
                .map_err(storage_error)?;
            let default_id = preferences.and_then(|record| record.default_connection_id);
            let Some(default_id) = default_id else {
                emitter
                    .error(json!({
                        "message": "Database connection ID is required for new chat",
                        "code": 400,
                    }))
                    .await;
                return Ok(());
            };
            default_id
        };

        let lookup_id = preset_connection_id.clone();
        let owner = user_id.to_string();
        let connection = run_blocking(&self.storage, move |s| {
            s.get_connection_for_owner(&lookup_id, &owner)
        })
        .await
        .map_err(storage_error)?;
        let Some(connection) = connection else {
            emitter
                .error(json!({
                    "message": "Unauthorized access to database connection",
                    "code": 403,
                }))
                .await;
            return Ok(());
        };
        let connection_id = connection.id.clone();

        let chat_id = match requested_chat_id {
            Some(chat_id) => chat_id,
            None => {
                let name = initial_chat_name(&messages[0].content);
                let owner = user_id.to_string();
                let for_connection = connection_id.clone();
                let chat = run_blocking(&self.storage, move |s| {
                    s.insert_chat(&owner, &for_connection, &name)
                })
                .await
                .map_err(storage_error)?;
                chat.id
            }
        };

        {
            let chat = chat_id.clone();
            let content = last_message.content.clone();
            run_blocking(&self.storage, move |s| {
                s.insert_message(&chat, message_role::USER, &content)
            })
            .await
            .map_err(storage_error)?;
        }

        let generated = self
            .generator
            .generate(
                &last_message.content,
                &connection.engine,
                &connection.credentials,
                None,
            )
            .await?;

        emitter
            .emit(
                "sql-query",
                json!({ "query": generated.query, "content": generated.explanation }),
            )
            .await;

        if generated.query.is_empty() {
            let content = if generated.explanation.is_empty() {
                "Failed to generate SQL query".to_string()
            } else {
                generated.explanation.clone()
            };
            {
                let chat = chat_id.clone();
                let text = content.clone();
                run_blocking(&self.storage, move |s| {
                    s.insert_message(&chat, message_role::ASSISTANT, &text)
                })
                .await
                .map_err(storage_error)?;
            }
            {
                let chat = chat_id.clone();
                run_blocking(&self.storage, move |s| {
                    s.update_chat(&chat, "New Chat", now_ts())
                })
                .await
                .map_err(storage_error)?;
            }
            emitter
                .error(json!({ "message": content, "code": 400 }))
                .await;
            return Ok(());
        }

        let assistant = {
            let chat = chat_id.clone();
            let text = generated.explanation.clone();
            run_blocking(&self.storage, move |s| {
                s.insert_message(&chat, message_role::ASSISTANT, &text)
            })
            .await
            .map_err(storage_error)?
        };

        let execution = {
            let record = NewQueryExecution {
                message_id: assistant.id.clone(),
                connection_id: connection_id.clone(),
                owner_id: user_id.to_string(),
                sql_text: generated.query.clone(),
                status: query_status::RUNNING.to_string(),
            };
            run_blocking(&self.storage, move |s| s.insert_query_execution(record))
                .await
                .map_err(storage_error)?
        };

        // Execution gets the standard retry budget; a retry first asks the
        // generator for a corrected statement, once, without its own retries.
        let current_sql = Mutex::new(generated.query.clone());
        let execute_retry = RetrySettings::default();
        let executed = retry::retry_with_feedback(&execute_retry, |feedback| {
            self.execute_attempt(
                &last_message.content,
                &connection,
                &execution.id,
                &current_sql,
                feedback,
            )
        })
        .await;

        let outcome = match executed {
            Ok(outcome) => outcome,
            Err(err) => {
                let message = err.message().to_string();
                {
                    let id = execution.id.clone();
                    let text = message.clone();
                    let elapsed = elapsed_ms(execution.created_at);
                    run_blocking(&self.storage, move |s| {
                        s.fail_query_execution(&id, &text, elapsed)
                    })
                    .await
                    .map_err(storage_error)?;
                }
                emitter
                    .error(json!({
                        "message": message,
                        "phase": "query-execution",
                        "code": 500,
                    }))
                    .await;
                return Ok(());
            }
        };

        emitter
            .emit(
                "sql-results",
                json!({
                    "results": outcome.rows,
                    "executionTime": elapsed_ms(execution.created_at),
                }),
            )
            .await;

        {
            let id = execution.id.clone();
            let result = Value::Array(outcome.rows.clone());
            let row_count = outcome.rows.len() as i64;
            run_blocking(&self.storage, move |s| {
                s.complete_query_execution(&id, &result, row_count)
            })
            .await
            .map_err(storage_error)?;
        }

        if generated.visualization == "table" || outcome.rows.is_empty() {
            emitter
                .complete(json!({ "chatId": chat_id, "dbId": connection_id }))
                .await;
            return Ok(());
        }

        let chart = self.generator.chart_for(&messages, &outcome.rows).await?;
        let Some(arguments) = chart.arguments else {
            emitter
                .error(json!({ "message": "No visualization generated", "code": 500 }))
                .await;
            return Ok(());
        };

        let processed = charts::process_chart(&arguments)?;
        emitter
            .emit(
                "visualization",
                json!({
                    "chartData": processed,
                    "content": chart.content.clone().unwrap_or_default(),
                }),
            )
            .await;

        {
            let message_id = assistant.id.clone();
            let chart_payload = processed.clone();
            run_blocking(&self.storage, move |s| {
                s.set_message_chart(&message_id, &chart_payload)
            })
            .await
            .map_err(storage_error)?;
        }
        {
            let chat = chat_id.clone();
            let title = processed
                .get("config")
                .and_then(|config| config.get("title"))
                .and_then(Value::as_str)
                .unwrap_or("New Chat")
                .to_string();
            run_blocking(&self.storage, move |s| {
                s.update_chat(&chat, &title, now_ts())
            })
            .await
            .map_err(storage_error)?;
        }

        emitter
            .complete(json!({ "chatId": chat_id, "dbId": connection_id }))
            .await;
        Ok(())
    }

    /// One execution attempt. After a failed attempt the generator is asked
    /// for a replacement statement; when it produces one, the stored record
    /// is updated before running it.
    async fn execute_attempt(
        &self,
        question: &str,
        connection: &ConnectionRecord,
        execution_id: &str,
        current_sql: &Mutex<String>,
        feedback: Option<String>,
    ) -> Result<QueryOutcome, AppError> {
        if feedback.is_some() {
            let regenerated: GeneratedSql = self
                .generator
                .generate(
                    question,
                    &connection.engine,
                    &connection.credentials,
                    Some(retry::single_attempt()),
                )
                .await?;
            if !regenerated.query.is_empty() {
                let id = execution_id.to_string();
                let sql = regenerated.query.clone();
                run_blocking(&self.storage, move |s| {
                    s.update_query_execution_sql(&id, &sql)
                })
                .await
                .map_err(storage_error)?;
                *current_sql.lock() = regenerated.query;
            }
        }

        let sql = current_sql.lock().clone();
        let credentials = Credentials::from_record(connection)?;
        self.runner
            .execute_query(&connection.id, &sql, Some(&credentials))
            .await
    }
}

/// Maps an escaped error onto the terminal `error` event.
async fn report_failure(err: AppError, emitter: &TurnEmitter) {
    error!("chat turn failed: {}", err.message());
    let payload = match &err {
        AppError::Validation { message, errors } => json!({
            "type": "validation_error",
            "errors": errors.clone().unwrap_or_else(|| json!([message])),
            "code": 422,
        }),
        AppError::Generation {
            message,
            status: Some(status),
        } => json!({
            "type": "ai_error",
            "message": message,
            "status": status,
            "code": status,
        }),
        other => json!({
            "message": other.message(),
            "type": "general_error",
            "code": 500,
        }),
    };
    emitter.error(payload).await;
}

fn initial_chat_name(content: &str) -> String {
    let head: String = content.chars().take(50).collect();
    format!("{head}...")
}

fn storage_error(err: anyhow::Error) -> AppError {
    AppError::execution(err.to_string())
}

fn now_ts() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

fn elapsed_ms(created_at: f64) -> i64 {
    let elapsed = Utc::now().timestamp_millis() as f64 - created_at * 1000.0;
    elapsed.max(0.0).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_names_truncate_long_questions() {
        assert_eq!(initial_chat_name("top customers"), "top customers...");
        let long = "x".repeat(80);
        let name = initial_chat_name(&long);
        assert_eq!(name.chars().count(), 53);
        assert!(name.ends_with("..."));
    }

    #[test]
    fn elapsed_never_goes_negative() {
        let future = now_ts() + 120.0;
        assert_eq!(elapsed_ms(future), 0);
        assert!(elapsed_ms(now_ts() - 1.0) >= 1000);
    }
}
