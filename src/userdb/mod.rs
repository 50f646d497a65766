//! Tenant database access: engine-tagged credential bundles, a keyed
//! connection pool with liveness checks and idle eviction, and the result
//! normalization shared by the chat pipeline and the job queue.

mod driver;
mod executor;
mod pool;
mod structure;

pub use driver::EngineHandle;
pub use executor::{QueryExecutor, QueryRunner};
pub use pool::ConnectionPool;
pub use structure::{columns_sql, render_schema_text, structure_sql};

use crate::error::AppError;
use crate::storage::ConnectionRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Engines the gateway can connect to. Anything else is rejected at the
/// boundary where the string arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Postgres,
    MySql,
    Mssql,
}

impl EngineKind {
    pub fn parse(value: &str) -> Result<Self, AppError> {
        match value.trim().to_lowercase().as_str() {
            "postgres" => Ok(Self::Postgres),
            "mysql" => Ok(Self::MySql),
            "mssql" => Ok(Self::Mssql),
            other => Err(AppError::validation(format!(
                "Unsupported database type: {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
            Self::Mssql => "mssql",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credential bundle stored as JSON on a connection record. The engine tag
/// travels inside the bundle under `type`, matching the stored shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(rename = "type")]
    pub engine: EngineKind,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Postgres search path override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    /// SQL Server transport flags; both default to on when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypt: Option<bool>,
    #[serde(
        default,
        rename = "trustServerCertificate",
        skip_serializing_if = "Option::is_none"
    )]
    pub trust_server_certificate: Option<bool>,
}

impl Credentials {
    /// Builds credentials from an engine string plus a bundle that may or
    /// may not already carry the `type` tag. The explicit engine wins.
    pub fn from_parts(engine: &str, bundle: &Value) -> Result<Self, AppError> {
        let engine = EngineKind::parse(engine)?;
        let mut merged = match bundle {
            Value::Object(map) => map.clone(),
            _ => {
                return Err(AppError::validation(
                    "Database credentials must be an object",
                ))
            }
        };
        merged.insert("type".to_string(), Value::String(engine.as_str().to_string()));
        serde_json::from_value(Value::Object(merged))
            .map_err(|err| AppError::validation(format!("Invalid database credentials: {err}")))
    }

    pub fn from_record(record: &ConnectionRecord) -> Result<Self, AppError> {
        Self::from_parts(&record.engine, &record.credentials)
    }
}

/// Column descriptor derived from the first row of a result set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

/// Normalized result of one SQL statement. Row objects keep the column
/// order the driver produced them in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryOutcome {
    pub rows: Vec<Value>,
    #[serde(rename = "rowCount")]
    pub row_count: i64,
    pub fields: Vec<FieldMeta>,
}

impl QueryOutcome {
    /// Field metadata comes from the first row's keys and runtime value
    /// types; statements without a result set yield the empty outcome.
    pub fn from_rows(rows: Vec<Value>) -> Self {
        let fields = rows
            .first()
            .and_then(Value::as_object)
            .map(|row| {
                row.iter()
                    .map(|(name, value)| FieldMeta {
                        name: name.clone(),
                        type_name: runtime_type_name(value).to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            row_count: rows.len() as i64,
            rows,
            fields,
        }
    }
}

fn runtime_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) | Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_known_engines_case_insensitively() {
        assert_eq!(EngineKind::parse("postgres").unwrap(), EngineKind::Postgres);
        assert_eq!(EngineKind::parse(" MySQL ").unwrap(), EngineKind::MySql);
        assert_eq!(EngineKind::parse("MSSQL").unwrap(), EngineKind::Mssql);
    }

    #[test]
    fn rejects_unknown_engine() {
        let err = EngineKind::parse("oracle").unwrap_err();
        assert_eq!(err.message(), "Unsupported database type: oracle");
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn from_parts_injects_engine_tag() {
        let bundle = json!({
            "host": "db.internal",
            "port": 5432,
            "database": "sales",
            "username": "reporter",
            "password": "s3cret",
            "schema": "analytics"
        });
        let creds = Credentials::from_parts("postgres", &bundle).unwrap();
        assert_eq!(creds.engine, EngineKind::Postgres);
        assert_eq!(creds.schema.as_deref(), Some("analytics"));
        assert!(creds.encrypt.is_none());
    }

    #[test]
    fn from_parts_overrides_a_stale_tag() {
        let bundle = json!({
            "type": "postgres",
            "host": "db.internal",
            "port": 1433,
            "database": "sales",
            "username": "sa",
            "password": "x",
            "trustServerCertificate": false
        });
        let creds = Credentials::from_parts("mssql", &bundle).unwrap();
        assert_eq!(creds.engine, EngineKind::Mssql);
        assert_eq!(creds.trust_server_certificate, Some(false));
    }

    #[test]
    fn fields_come_from_the_first_row() {
        let outcome = QueryOutcome::from_rows(vec![
            json!({"country": "USA", "total": 12, "active": true}),
            json!({"country": "Peru", "total": null, "active": false}),
        ]);
        assert_eq!(outcome.row_count, 2);
        let names: Vec<_> = outcome.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["country", "total", "active"]);
        let types: Vec<_> = outcome.fields.iter().map(|f| f.type_name.as_str()).collect();
        assert_eq!(types, vec!["string", "number", "boolean"]);
    }

    #[test]
    fn empty_result_has_no_fields() {
        let outcome = QueryOutcome::from_rows(Vec::new());
        assert_eq!(outcome.row_count, 0);
        assert!(outcome.fields.is_empty());
    }
}
