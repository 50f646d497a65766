//! NDJSON event stream for a chat turn. Events flow through a bounded
//! channel to the response body; a closed channel means the client went
//! away and writes become no-ops.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::warn;

/// One line on the wire.
#[derive(Debug, Clone, Serialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub timestamp: i64,
}

impl StreamEvent {
    pub fn new(kind: &str, data: Value) -> Self {
        Self {
            kind: kind.to_string(),
            data,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Writer handle for one turn. `error` and `complete` are terminal; a turn
/// emits exactly one of them, and later terminal calls are dropped.
pub struct TurnEmitter {
    tx: mpsc::Sender<StreamEvent>,
    terminal_sent: AtomicBool,
}

impl TurnEmitter {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            tx,
            terminal_sent: AtomicBool::new(false),
        }
    }

    pub async fn emit(&self, kind: &str, data: Value) {
        self.send(StreamEvent::new(kind, data)).await;
    }

    pub async fn error(&self, data: Value) {
        if self.mark_terminal("error") {
            self.send(StreamEvent::new("error", data)).await;
        }
    }

    pub async fn complete(&self, data: Value) {
        if self.mark_terminal("complete") {
            self.send(StreamEvent::new("complete", data)).await;
        }
    }

    pub fn finished(&self) -> bool {
        self.terminal_sent.load(Ordering::SeqCst)
    }

    fn mark_terminal(&self, kind: &str) -> bool {
        if self.terminal_sent.swap(true, Ordering::SeqCst) {
            warn!("chat stream already finished, dropping {kind} event");
            return false;
        }
        true
    }

    async fn send(&self, event: StreamEvent) {
        let _ = self.tx.send(event).await;
    }
}
