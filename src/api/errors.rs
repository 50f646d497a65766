use crate::error::AppError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Success envelope shared by all JSON routes.
pub(crate) fn success(data: Value) -> Response {
    Json(json!({ "success": true, "data": data })).into_response()
}

/// Error envelope: `{"error": {code, message, status, timestamp}}`.
pub(crate) fn error_response(
    status: StatusCode,
    code: &str,
    message: impl Into<String>,
) -> Response {
    let payload = json!({
        "error": {
            "code": code,
            "message": message.into(),
            "status": status.as_u16(),
            "timestamp": now_unix_seconds(),
        }
    });
    (status, Json(payload)).into_response()
}

/// Rejection for JSON routes called without a resolvable principal.
pub(crate) fn unauthorized() -> Response {
    error_response(
        StatusCode::UNAUTHORIZED,
        "UNAUTHORIZED_ACCESS",
        "Authentication required",
    )
}

/// Maps an application error onto the envelope using its own code and
/// status. Validation details ride along when present.
pub(crate) fn app_error_response(err: &AppError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut meta = err.to_payload();
    if let Value::Object(ref mut map) = meta {
        map.insert("status".to_string(), json!(status.as_u16()));
        map.insert("timestamp".to_string(), json!(now_unix_seconds()));
    }
    (status, Json(json!({ "error": meta }))).into_response()
}

fn now_unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs_f64())
        .unwrap_or(0.0)
}
