//! Chat turns: request types, the NDJSON event stream and the coordinator
//! that drives generation, execution and visualization for one message.

pub mod stream;
pub mod turn;

pub use stream::{StreamEvent, TurnEmitter};
pub use turn::ChatTurn;

use crate::llm::ChatMessage;
use serde::Deserialize;

/// Body of `POST /api/chat/message`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatTurnRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default, rename = "chatId")]
    pub chat_id: Option<String>,
    #[serde(default, rename = "dbConnectionId")]
    pub db_connection_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_parses_wire_names() {
        let request: ChatTurnRequest = serde_json::from_str(
            r#"{"messages":[{"role":"user","content":"top customers"}],"dbConnectionId":"db-1"}"#,
        )
        .unwrap();
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.db_connection_id.as_deref(), Some("db-1"));
        assert!(request.chat_id.is_none());
    }
}
