//! Request principal resolution. Identity is established upstream; this
//! service trusts the `x-user-id` header installed by the fronting proxy
//! and scopes every ownership check to that value.

use axum::http::HeaderMap;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Returns the trimmed principal id, or None when the header is missing,
/// unreadable or blank.
pub fn principal_from_headers(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(USER_ID_HEADER)?;
    let text = value.to_str().ok()?.trim();
    if text.is_empty() {
        return None;
    }
    Some(text.to_string())
}
