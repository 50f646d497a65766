//! SQL generation pipeline. A short-lived connection introspects the tenant
//! schema, the dialect prompt goes to the generator, and the sectioned reply
//! is parsed into query, explanation and visualization hint.

pub mod charts;
pub mod extract;
pub mod prompts;
pub mod retry;

use crate::config::{GeneratorConfig, RetrySettings, UserDbConfig};
use crate::error::AppError;
use crate::llm::{ChatMessage, LlmClient, ToolCallOutcome};
use crate::userdb::{columns_sql, render_schema_text, Credentials, EngineHandle};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

/// Parsed generator reply. `query` is empty when the model declined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedSql {
    pub query: String,
    pub explanation: String,
    pub visualization: String,
}

/// Generation surface the chat coordinator talks to.
#[async_trait]
pub trait SqlGeneration: Send + Sync {
    /// Turns a question into SQL for the engine named on the connection
    /// record. `retry` overrides the configured policy when set.
    async fn generate(
        &self,
        question: &str,
        engine: &str,
        credentials: &Value,
        retry: Option<RetrySettings>,
    ) -> Result<GeneratedSql, AppError>;

    /// Asks the generator for a chart definition over the query results.
    async fn chart_for(
        &self,
        messages: &[ChatMessage],
        rows: &[Value],
    ) -> Result<ToolCallOutcome, AppError>;
}

pub struct SqlGenerator {
    llm: LlmClient,
    config: GeneratorConfig,
    connect_timeout: Duration,
}

impl SqlGenerator {
    pub fn new(config: GeneratorConfig, userdb: &UserDbConfig) -> anyhow::Result<Self> {
        let llm = LlmClient::new(config.clone())?;
        Ok(Self {
            llm,
            config,
            connect_timeout: Duration::from_secs(userdb.connect_timeout_s),
        })
    }

    /// One full generation attempt. The introspection connection is opened
    /// fresh and torn down whether or not the attempt succeeds.
    async fn attempt(
        &self,
        question: &str,
        engine: &str,
        credentials: &Value,
        feedback: Option<String>,
    ) -> Result<GeneratedSql, AppError> {
        let prompt = prompts::dialect_prompt(engine)?;
        let parsed = Credentials::from_parts(engine, credentials)?;

        let handle = EngineHandle::connect(&parsed, self.connect_timeout).await?;
        let described = self.describe_schema(&handle, &parsed).await;
        handle.close().await;
        let table_info = described?;

        let input = match feedback {
            Some(message) => format!(
                "{question}\nPrevious attempt failed with error: {message}\nPlease fix the query accordingly."
            ),
            None => question.to_string(),
        };
        let rendered = prompt.render(&table_info, &input, self.config.top_k);
        let reply = self
            .llm
            .complete(&[ChatMessage::new("user", rendered)])
            .await?;
        debug!("generator reply: {}", reply);

        let generated = GeneratedSql {
            explanation: extract::extract_explanation(&reply),
            visualization: extract::extract_visualization(&reply),
            query: extract::extract_sql(&reply),
        };
        info!("SQL query generated: {}", generated.query);
        Ok(generated)
    }

    async fn describe_schema(
        &self,
        handle: &EngineHandle,
        credentials: &Credentials,
    ) -> Result<String, AppError> {
        let sql = columns_sql(credentials.engine, credentials.schema.as_deref());
        let outcome = handle.execute(&sql).await?;
        Ok(render_schema_text(&outcome.rows))
    }
}

#[async_trait]
impl SqlGeneration for SqlGenerator {
    async fn generate(
        &self,
        question: &str,
        engine: &str,
        credentials: &Value,
        retry: Option<RetrySettings>,
    ) -> Result<GeneratedSql, AppError> {
        let settings = retry.unwrap_or_else(|| self.config.retry.clone());
        retry::retry_with_feedback(&settings, |feedback| {
            self.attempt(question, engine, credentials, feedback)
        })
        .await
    }

    async fn chart_for(
        &self,
        messages: &[ChatMessage],
        rows: &[Value],
    ) -> Result<ToolCallOutcome, AppError> {
        let mut wire = messages.to_vec();
        if let Some(last) = wire.last_mut() {
            last.content = format!(
                "data contents for the request: {}\n\n{}",
                Value::Array(rows.to_vec()),
                last.content
            );
        }
        self.llm
            .tool_call(
                prompts::VISUALIZATION_SYSTEM_PROMPT,
                &wire,
                &charts::graph_tools(),
                charts::GRAPH_TOOL_NAME,
            )
            .await
    }
}
