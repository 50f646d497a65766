//! OpenAI-compatible Chat Completions client for the text generator.
//! `complete` drives SQL generation; `tool_call` forces one declared
//! function for visualization payloads.

use crate::config::GeneratorConfig;
use crate::error::AppError;
use anyhow::Result;
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Result of a forced tool call: parsed arguments plus any free text the
/// model emitted alongside.
#[derive(Debug, Clone)]
pub struct ToolCallOutcome {
    pub arguments: Option<Value>,
    pub content: Option<String>,
}

#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    config: GeneratorConfig,
}

impl LlmClient {
    pub fn new(config: GeneratorConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_s.max(5)))
            .build()?;
        Ok(Self { http, config })
    }

    fn endpoint(&self) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
        }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let api_key = self.config.api_key.trim();
        if !api_key.is_empty() {
            let value = format!("Bearer {api_key}");
            if let Ok(header_value) = value.parse() {
                headers.insert(reqwest::header::AUTHORIZATION, header_value);
            }
        }
        headers
    }

    /// One non-streaming completion; returns the message content verbatim.
    pub async fn complete(&self, messages: &[ChatMessage]) -> Result<String, AppError> {
        let payload = json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_output_tokens,
            "stream": false,
        });
        let body = self.send(&payload).await?;
        let content = body
            .get("choices")
            .and_then(|value| value.get(0))
            .and_then(|value| value.get("message"))
            .and_then(|value| value.get("content"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        Ok(content)
    }

    /// Forces the named function and parses its arguments. Temperature is
    /// pinned to zero so the structured payload stays deterministic.
    pub async fn tool_call(
        &self,
        system: &str,
        messages: &[ChatMessage],
        tools: &[Value],
        forced_tool: &str,
    ) -> Result<ToolCallOutcome, AppError> {
        let mut wire: Vec<Value> = Vec::with_capacity(messages.len() + 1);
        wire.push(json!({ "role": "system", "content": system }));
        for message in messages {
            wire.push(json!({ "role": message.role, "content": message.content }));
        }
        let payload = json!({
            "model": self.config.model,
            "messages": wire,
            "temperature": 0,
            "max_tokens": 4096,
            "stream": false,
            "tools": tools,
            "tool_choice": { "type": "function", "function": { "name": forced_tool } },
        });
        let body = self.send(&payload).await?;
        let message = body
            .get("choices")
            .and_then(|value| value.get(0))
            .and_then(|value| value.get("message"))
            .cloned()
            .unwrap_or(Value::Null);
        let content = message
            .get("content")
            .and_then(Value::as_str)
            .filter(|text| !text.is_empty())
            .map(str::to_string);
        let arguments = message
            .get("tool_calls")
            .and_then(Value::as_array)
            .and_then(|calls| {
                calls
                    .iter()
                    .find(|call| {
                        call.get("function")
                            .and_then(|function| function.get("name"))
                            .and_then(Value::as_str)
                            == Some(forced_tool)
                    })
                    .or_else(|| calls.first())
            })
            .and_then(|call| call.get("function"))
            .and_then(|function| function.get("arguments"))
            .and_then(parse_arguments);
        Ok(ToolCallOutcome { arguments, content })
    }

    async fn send(&self, payload: &Value) -> Result<Value, AppError> {
        let response = self
            .http
            .post(self.endpoint())
            .headers(self.headers())
            .json(payload)
            .send()
            .await
            .map_err(|err| AppError::generation(format!("Generator request failed: {err}")))?;
        let status = response.status();
        let body_text = response
            .text()
            .await
            .map_err(|err| AppError::generation(format!("Generator response read failed: {err}")))?;
        let body = match serde_json::from_str::<Value>(&body_text) {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    "generator response json parse failed: {err}, body={}",
                    truncate_text(&body_text, 2048)
                );
                Value::Null
            }
        };
        if !status.is_success() {
            let detail = if body == Value::Null {
                json!({ "raw": truncate_text(&body_text, 2048) })
            } else {
                body
            };
            return Err(AppError::upstream(
                status.as_u16(),
                format!("Generator request failed: {status} {detail}"),
            ));
        }
        if body == Value::Null {
            return Err(AppError::generation(format!(
                "Generator response parse failed: {}",
                truncate_text(&body_text, 2048)
            )));
        }
        Ok(body)
    }
}

/// Tool arguments arrive either as a JSON string or already parsed.
fn parse_arguments(raw: &Value) -> Option<Value> {
    match raw {
        Value::String(text) => serde_json::from_str(text).ok(),
        Value::Object(_) => Some(raw.clone()),
        _ => None,
    }
}

fn truncate_text(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    let mut output = text[..end].to_string();
    output.push_str("...");
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_handles_v1_suffix() {
        let config = GeneratorConfig {
            base_url: "http://127.0.0.1:8080/v1".to_string(),
            ..GeneratorConfig::default()
        };
        let client = LlmClient::new(config).unwrap();
        assert_eq!(
            client.endpoint(),
            "http://127.0.0.1:8080/v1/chat/completions"
        );

        let config = GeneratorConfig {
            base_url: "http://127.0.0.1:8080/".to_string(),
            ..GeneratorConfig::default()
        };
        let client = LlmClient::new(config).unwrap();
        assert_eq!(
            client.endpoint(),
            "http://127.0.0.1:8080/v1/chat/completions"
        );
    }

    #[test]
    fn tool_arguments_parse_from_string_or_object() {
        let from_string = parse_arguments(&Value::String("{\"chartType\":\"bar\"}".to_string()));
        assert_eq!(from_string.unwrap()["chartType"], "bar");
        let from_object = parse_arguments(&json!({"chartType": "pie"}));
        assert_eq!(from_object.unwrap()["chartType"], "pie");
        assert!(parse_arguments(&Value::Null).is_none());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_text("short", 10), "short");
        let truncated = truncate_text("日本語テキスト", 4);
        assert!(truncated.ends_with("..."));
    }
}
