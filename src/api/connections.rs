use crate::api::errors::{app_error_response, error_response, success, unauthorized};
use crate::auth;
use crate::error::AppError;
use crate::queue::{Job, JobQueue};
use crate::state::AppState;
use crate::storage::{run_blocking, ConnectionPatch, ConnectionRecord, NewConnection};
use crate::userdb::{Credentials, EngineKind};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{error, warn};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/db", get(list_connections).post(create_connection))
        .route(
            "/api/db/{id}",
            get(get_connection)
                .put(update_connection)
                .delete(delete_connection),
        )
        .route("/api/db/{id}/test", post(test_connection))
        .route("/api/db/{id}/structure", get(get_structure))
}

#[derive(Debug, Deserialize)]
struct CreateConnectionRequest {
    name: String,
    #[serde(rename = "type")]
    engine: String,
    credentials: Value,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UpdateConnectionRequest {
    name: Option<String>,
    credentials: Option<Value>,
    #[serde(rename = "isActive")]
    is_active: Option<bool>,
    description: Option<String>,
}

/// Public shape of a connection record. Credentials and description never
/// leave the service.
fn serialize_connection(record: &ConnectionRecord) -> Value {
    json!({
        "id": record.id,
        "name": record.name,
        "type": record.engine,
        "isActive": record.is_active,
        "lastConnectedAt": record.last_connected_at,
        "createdAt": record.created_at,
        "updatedAt": record.updated_at,
    })
}

/// Stored credential bundles carry the engine tag inline so job handlers
/// can rebuild credentials from the record alone.
fn tagged_bundle(credentials: &Value, engine: EngineKind) -> Value {
    let mut map = match credentials {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    map.insert(
        "type".to_string(),
        Value::String(engine.as_str().to_string()),
    );
    Value::Object(map)
}

async fn list_connections(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(user_id) = auth::principal_from_headers(&headers) else {
        return unauthorized();
    };

    let connections =
        run_blocking(&state.storage, move |storage| storage.list_connections(&user_id)).await;
    match connections {
        Ok(connections) => {
            let data = connections
                .iter()
                .map(serialize_connection)
                .collect::<Vec<_>>();
            success(json!(data))
        }
        Err(err) => {
            error!("failed to list connections: {err}");
            error_response(
                StatusCode::UNPROCESSABLE_ENTITY,
                "EXECUTION_ERROR",
                "Failed to fetch connections",
            )
        }
    }
}

/// Registers a connection. Credentials must pass a live connect test before
/// the record is persisted; a valid record then enqueues the schema
/// introspection and default-preference jobs.
async fn create_connection(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<CreateConnectionRequest>, JsonRejection>,
) -> Response {
    let Some(user_id) = auth::principal_from_headers(&headers) else {
        return unauthorized();
    };
    let Json(body) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return error_response(
                StatusCode::UNPROCESSABLE_ENTITY,
                "VALIDATION_ERROR",
                rejection.body_text(),
            )
        }
    };
    if body.name.trim().is_empty() {
        return error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            "VALIDATION_ERROR",
            "Connection name is required",
        );
    }
    let credentials = match Credentials::from_parts(&body.engine, &body.credentials) {
        Ok(credentials) => credentials,
        Err(err) => {
            return error_response(
                StatusCode::UNPROCESSABLE_ENTITY,
                err.code(),
                err.message().to_string(),
            )
        }
    };

    if !state.pool.test_credentials(&credentials).await {
        return error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            "CONNECTION_ERROR",
            "Failed to connect to database",
        );
    }

    let record = NewConnection {
        name: body.name.clone(),
        engine: credentials.engine.as_str().to_string(),
        credentials: tagged_bundle(&body.credentials, credentials.engine),
        owner_id: user_id.clone(),
        description: body.description.clone(),
    };
    let inserted =
        run_blocking(&state.storage, move |storage| storage.insert_connection(record)).await;
    let connection = match inserted {
        Ok(connection) => connection,
        Err(err) => {
            error!("failed to persist connection: {err}");
            return error_response(
                StatusCode::UNPROCESSABLE_ENTITY,
                "EXECUTION_ERROR",
                "Failed to create connection",
            );
        }
    };

    if let Err(err) =
        enqueue_connection_jobs(state.queue.as_ref(), &connection.id, &user_id).await
    {
        error!("failed to enqueue connection jobs: {err}");
        return error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            err.code(),
            "Failed to create connection",
        );
    }

    success(serialize_connection(&connection))
}

/// Follow-up work for a fresh connection: snapshot its schema, then make
/// sure the owner has a default connection picked.
pub(crate) async fn enqueue_connection_jobs(
    queue: &dyn JobQueue,
    connection_id: &str,
    user_id: &str,
) -> Result<(), AppError> {
    queue
        .add_job(
            Job::IntrospectStructure {
                connection_id: connection_id.to_string(),
            },
            None,
        )
        .await?;
    queue
        .add_job(
            Job::EnsureDefaultConnection {
                user_id: user_id.to_string(),
            },
            None,
        )
        .await
}

async fn get_connection(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let Some(user_id) = auth::principal_from_headers(&headers) else {
        return unauthorized();
    };

    let result = run_blocking(&state.storage, move |storage| storage.get_connection(&id)).await;
    match result {
        Ok(Some(record)) if record.owner_id == user_id => success(serialize_connection(&record)),
        Ok(Some(_)) => error_response(
            StatusCode::FORBIDDEN,
            "UNAUTHORIZED_ACCESS",
            "Unauthorized access",
        ),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "Connection not found"),
        Err(err) => {
            error!("failed to fetch connection: {err}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "EXECUTION_ERROR",
                "Failed to fetch connection",
            )
        }
    }
}

async fn update_connection(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    payload: Result<Json<UpdateConnectionRequest>, JsonRejection>,
) -> Response {
    let Some(user_id) = auth::principal_from_headers(&headers) else {
        return unauthorized();
    };
    let Json(body) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return error_response(
                StatusCode::UNPROCESSABLE_ENTITY,
                "VALIDATION_ERROR",
                rejection.body_text(),
            )
        }
    };

    let lookup_id = id.clone();
    let owner = user_id.clone();
    let existing = run_blocking(&state.storage, move |storage| {
        storage.get_connection_for_owner(&lookup_id, &owner)
    })
    .await;
    let existing = match existing {
        Ok(Some(record)) => record,
        Ok(None) => {
            return error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "Connection not found")
        }
        Err(err) => {
            error!("failed to fetch connection for update: {err}");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "EXECUTION_ERROR",
                "Failed to update connection",
            );
        }
    };

    // A replacement credential bundle is connect-tested against the stored
    // engine before it is saved.
    let mut credentials_patch = None;
    if let Some(bundle) = body.credentials.as_ref() {
        let parsed = match Credentials::from_parts(&existing.engine, bundle) {
            Ok(parsed) => parsed,
            Err(err) => {
                return error_response(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    err.code(),
                    err.message().to_string(),
                )
            }
        };
        if !state.pool.test_credentials(&parsed).await {
            return error_response(
                StatusCode::UNPROCESSABLE_ENTITY,
                "CONNECTION_ERROR",
                "Failed to connect to database",
            );
        }
        credentials_patch = Some(tagged_bundle(bundle, parsed.engine));
    }

    let patch = ConnectionPatch {
        name: body.name.clone(),
        credentials: credentials_patch,
        is_active: body.is_active,
        description: body.description.clone(),
    };
    if patch.is_empty() {
        return success(serialize_connection(&existing));
    }

    let owner = user_id.clone();
    let updated = run_blocking(&state.storage, move |storage| {
        storage.update_connection(&id, &owner, patch)
    })
    .await;
    match updated {
        Ok(Some(record)) => success(serialize_connection(&record)),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "Connection not found"),
        Err(err) => {
            error!("failed to update connection: {err}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "EXECUTION_ERROR",
                "Failed to update connection",
            )
        }
    }
}

async fn delete_connection(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let Some(user_id) = auth::principal_from_headers(&headers) else {
        return unauthorized();
    };

    let lookup_id = id.clone();
    let owner = user_id.clone();
    let existing = run_blocking(&state.storage, move |storage| {
        storage.get_connection_for_owner(&lookup_id, &owner)
    })
    .await;
    match existing {
        Ok(Some(_)) => {}
        Ok(None) => {
            return error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "Connection not found")
        }
        Err(err) => {
            error!("failed to fetch connection for delete: {err}");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "EXECUTION_ERROR",
                "Failed to delete connection",
            );
        }
    }

    // Any pooled handle goes away with the record.
    state.pool.close(&id).await;

    let deleted = run_blocking(&state.storage, move |storage| {
        storage.delete_connection(&id, &user_id)
    })
    .await;
    match deleted {
        Ok(true) => success(Value::Null),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "Connection not found"),
        Err(err) => {
            error!("failed to delete connection: {err}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "EXECUTION_ERROR",
                "Failed to delete connection",
            )
        }
    }
}

async fn test_connection(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let Some(user_id) = auth::principal_from_headers(&headers) else {
        return unauthorized();
    };

    let record = run_blocking(&state.storage, move |storage| {
        storage.get_connection_for_owner(&id, &user_id)
    })
    .await;
    let record = match record {
        Ok(Some(record)) => record,
        Ok(None) => {
            return error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "Connection not found")
        }
        Err(err) => {
            error!("failed to fetch connection for test: {err}");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "EXECUTION_ERROR",
                "Failed to test connection",
            );
        }
    };

    let credentials = match Credentials::from_record(&record) {
        Ok(credentials) => credentials,
        Err(err) => return app_error_response(&err),
    };
    let ok = state.pool.test_credentials(&credentials).await;
    if ok {
        let touch_id = record.id.clone();
        if let Err(err) =
            run_blocking(&state.storage, move |storage| storage.touch_connection(&touch_id)).await
        {
            warn!("failed to refresh last_connected_at: {err}");
        }
    }

    success(json!({
        "isConnected": ok,
        "message": if ok { "Connection successful" } else { "Failed to connect to database" },
    }))
}

/// Serves the schema snapshot the introspection job stored for the
/// connection. SQL Server snapshots arrive as a JSON string cell and are
/// unwrapped before returning.
async fn get_structure(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let Some(user_id) = auth::principal_from_headers(&headers) else {
        return unauthorized();
    };

    let lookup_id = id.clone();
    let record = run_blocking(&state.storage, move |storage| {
        storage.get_connection_for_owner(&lookup_id, &user_id)
    })
    .await;
    let record = match record {
        Ok(Some(record)) => record,
        Ok(None) => {
            return error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "Connection not found")
        }
        Err(err) => {
            error!("failed to fetch connection for structure: {err}");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "EXECUTION_ERROR",
                "Failed to fetch structure",
            );
        }
    };

    let metadata = run_blocking(&state.storage, move |storage| {
        storage.get_table_metadata(&id)
    })
    .await;
    let metadata = match metadata {
        Ok(Some(metadata)) => metadata,
        Ok(None) => {
            return error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "Structure not found")
        }
        Err(err) => {
            error!("failed to load structure snapshot: {err}");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "EXECUTION_ERROR",
                "Failed to fetch structure",
            );
        }
    };

    let cell = metadata
        .structure
        .get("rows")
        .and_then(|rows| rows.get(0))
        .and_then(|row| row.get("database_schema"))
        .cloned();
    let data = match cell {
        Some(Value::String(text)) if record.engine == "mssql" => {
            match serde_json::from_str::<Value>(&text) {
                Ok(parsed) => json!({ "database_structure": parsed }),
                Err(err) => {
                    error!("failed to parse mssql structure snapshot: {err}");
                    return error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "EXECUTION_ERROR",
                        "Failed to fetch structure",
                    );
                }
            }
        }
        Some(Value::Null) | None => json!({ "db_structure": [] }),
        Some(value) => value,
    };
    success(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ConnectionRecord {
        ConnectionRecord {
            id: "db-1".to_string(),
            name: "analytics".to_string(),
            engine: "postgres".to_string(),
            credentials: json!({ "password": "hunter2", "host": "db" }),
            owner_id: "u-1".to_string(),
            is_active: true,
            description: Some("internal warehouse".to_string()),
            last_connected_at: Some(1000.0),
            created_at: 900.0,
            updated_at: 950.0,
        }
    }

    #[test]
    fn serialized_connections_redact_credentials() {
        let value = serialize_connection(&record());
        assert_eq!(value["id"], "db-1");
        assert_eq!(value["type"], "postgres");
        assert_eq!(value["isActive"], true);
        assert!(value.get("credentials").is_none());
        assert!(value.get("description").is_none());
    }

    #[test]
    fn stored_bundles_carry_the_engine_tag() {
        let bundle = tagged_bundle(
            &json!({ "host": "db", "port": 5432 }),
            EngineKind::Postgres,
        );
        assert_eq!(bundle["type"], "postgres");
        assert_eq!(bundle["host"], "db");
    }

    #[derive(Default)]
    struct RecordingQueue {
        jobs: parking_lot::Mutex<Vec<Job>>,
    }

    #[async_trait::async_trait]
    impl JobQueue for RecordingQueue {
        async fn initialize(&self) -> Result<(), AppError> {
            Ok(())
        }

        async fn health_check(&self) -> bool {
            true
        }

        async fn add_job(&self, job: Job, _delay_ms: Option<u64>) -> Result<(), AppError> {
            self.jobs.lock().push(job);
            Ok(())
        }

        async fn shutdown(&self) {}
    }

    #[tokio::test]
    async fn new_connections_queue_introspection_then_default_pick() {
        let queue = RecordingQueue::default();
        enqueue_connection_jobs(&queue, "db-1", "u-1").await.unwrap();

        let jobs = queue.jobs.lock();
        assert_eq!(jobs.len(), 2);
        assert!(
            matches!(&jobs[0], Job::IntrospectStructure { connection_id } if connection_id == "db-1")
        );
        assert!(matches!(&jobs[1], Job::EnsureDefaultConnection { user_id } if user_id == "u-1"));
    }
}
