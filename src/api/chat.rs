use crate::api::errors::{error_response, success, unauthorized};
use crate::auth;
use crate::chat::{ChatTurnRequest, StreamEvent, TurnEmitter};
use crate::state::AppState;
use crate::storage::{run_blocking, ChatMessageView, ChatRecord};
use axum::body::{Body, Bytes};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::error;

const EVENT_CHANNEL_CAPACITY: usize = 32;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/chat/message", post(post_message))
        .route("/api/chat", get(list_chats))
        .route("/api/chat/{id}", get(get_chat).delete(delete_chat))
}

/// Runs one chat turn and streams its events as NDJSON. The turn is spawned
/// so a client that disconnects mid-stream never cancels persistence.
async fn post_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<ChatTurnRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return error_response(
                StatusCode::UNPROCESSABLE_ENTITY,
                "VALIDATION_ERROR",
                rejection.body_text(),
            )
        }
    };

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let emitter = TurnEmitter::new(tx);

    let Some(user_id) = auth::principal_from_headers(&headers) else {
        emitter
            .error(json!({ "message": "Authentication required", "code": 401 }))
            .await;
        return ndjson_response(rx);
    };

    let turn = state.chat.clone();
    tokio::spawn(async move {
        turn.run(&user_id, request, &emitter).await;
    });
    ndjson_response(rx)
}

fn ndjson_response(rx: mpsc::Receiver<StreamEvent>) -> Response {
    let stream = ReceiverStream::new(rx).map(|event| {
        let mut line = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        line.push('\n');
        Ok::<_, Infallible>(Bytes::from(line))
    });
    (
        [
            (header::CONTENT_TYPE, "application/x-ndjson"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

async fn list_chats(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(user_id) = auth::principal_from_headers(&headers) else {
        return unauthorized();
    };

    let chats = run_blocking(&state.storage, move |storage| storage.list_chats(&user_id)).await;
    match chats {
        Ok(chats) => {
            let data = chats
                .iter()
                .map(|chat| {
                    json!({
                        "id": chat.id,
                        "name": chat.name,
                        "createdAt": chat.created_at,
                        "lastMessageAt": chat.last_message_at,
                        "dbConnectionId": chat.connection_id,
                    })
                })
                .collect::<Vec<_>>();
            success(json!(data))
        }
        Err(err) => {
            error!("failed to list chats: {err}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "EXECUTION_ERROR",
                "Failed to fetch chats",
            )
        }
    }
}

async fn get_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let Some(user_id) = auth::principal_from_headers(&headers) else {
        return unauthorized();
    };

    let result = run_blocking(&state.storage, move |storage| -> anyhow::Result<
        Option<(ChatRecord, Vec<ChatMessageView>)>,
    > {
        let Some(chat) = storage.get_chat(&id)? else {
            return Ok(None);
        };
        if chat.owner_id != user_id {
            return Ok(None);
        }
        let messages = storage.list_messages(&chat.id)?;
        Ok(Some((chat, messages)))
    })
    .await;

    match result {
        Ok(Some((chat, messages))) => {
            let messages = messages
                .iter()
                .map(|message| {
                    json!({
                        "id": message.id,
                        "content": message.content,
                        "role": message.role,
                        "chartData": message.chart_data,
                        "sqlQuery": message.sql_query,
                        "data": message.query_result,
                    })
                })
                .collect::<Vec<_>>();
            success(json!({
                "chat": {
                    "chatId": chat.id,
                    "chatName": chat.name,
                    "dbConnectionId": chat.connection_id,
                    "ownerId": chat.owner_id,
                    "lastMessageAt": chat.last_message_at,
                    "createdAt": chat.created_at,
                },
                "messages": messages,
            }))
        }
        Ok(None) => error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "Chat not found"),
        Err(err) => {
            error!("failed to fetch chat: {err}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "EXECUTION_ERROR",
                "Failed to fetch chat",
            )
        }
    }
}

async fn delete_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let Some(user_id) = auth::principal_from_headers(&headers) else {
        return unauthorized();
    };

    let result = run_blocking(&state.storage, move |storage| -> anyhow::Result<bool> {
        let Some(chat) = storage.get_chat(&id)? else {
            return Ok(false);
        };
        if chat.owner_id != user_id {
            return Ok(false);
        }
        storage.delete_chat(&chat.id, &user_id)
    })
    .await;

    match result {
        Ok(true) => Json(json!({ "success": true })).into_response(),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "Chat not found"),
        Err(err) => {
            error!("failed to delete chat: {err}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "EXECUTION_ERROR",
                "Failed to delete chat",
            )
        }
    }
}
