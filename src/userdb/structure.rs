//! Dialect-specific introspection statements. `structure_sql` returns one
//! row with a `database_schema` column holding the snapshot the metadata
//! job persists; `columns_sql` feeds the schema text handed to the
//! generator prompt.

use super::EngineKind;
use serde_json::Value;

/// Snapshot query. Postgres and MySQL aggregate straight to JSON; SQL
/// Server produces a JSON string via FOR JSON PATH which the caller
/// parses and wraps.
pub fn structure_sql(engine: EngineKind) -> &'static str {
    match engine {
        EngineKind::Postgres => {
            "SELECT json_build_object('database_structure', \
             COALESCE(json_agg(tables.table_json ORDER BY tables.table_name), '[]'::json)) \
             AS database_schema \
             FROM ( \
             SELECT t.table_name, json_build_object('table_name', t.table_name, 'columns', \
             json_agg(json_build_object('column_name', c.column_name, 'data_type', c.data_type, \
             'is_nullable', c.is_nullable) ORDER BY c.ordinal_position)) AS table_json \
             FROM information_schema.tables t \
             JOIN information_schema.columns c \
             ON c.table_schema = t.table_schema AND c.table_name = t.table_name \
             WHERE t.table_schema = 'public' AND t.table_type = 'BASE TABLE' \
             GROUP BY t.table_name \
             ) tables"
        }
        EngineKind::MySql => {
            "SELECT JSON_OBJECT('database_structure', \
             COALESCE((SELECT JSON_ARRAYAGG(JSON_OBJECT('table_name', t.TABLE_NAME, 'columns', \
             (SELECT JSON_ARRAYAGG(JSON_OBJECT('column_name', c.COLUMN_NAME, 'data_type', \
             c.DATA_TYPE, 'is_nullable', c.IS_NULLABLE)) \
             FROM information_schema.COLUMNS c \
             WHERE c.TABLE_SCHEMA = t.TABLE_SCHEMA AND c.TABLE_NAME = t.TABLE_NAME))) \
             FROM information_schema.TABLES t \
             WHERE t.TABLE_SCHEMA = DATABASE() AND t.TABLE_TYPE = 'BASE TABLE'), \
             JSON_ARRAY())) AS database_schema"
        }
        EngineKind::Mssql => {
            "SELECT ( \
             SELECT t.name AS table_name, \
             (SELECT c.name AS column_name, ty.name AS data_type, c.is_nullable \
             FROM sys.columns c \
             JOIN sys.types ty ON ty.user_type_id = c.user_type_id \
             WHERE c.object_id = t.object_id \
             ORDER BY c.column_id \
             FOR JSON PATH) AS columns \
             FROM sys.tables t \
             ORDER BY t.name \
             FOR JSON PATH \
             ) AS database_schema"
        }
    }
}

/// Flat column listing ordered by table then position, used to build the
/// schema text for prompts. Postgres honors a schema override; the other
/// engines scope to the connected database.
pub fn columns_sql(engine: EngineKind, schema: Option<&str>) -> String {
    match engine {
        EngineKind::Postgres => {
            let schema = schema
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or("public")
                .replace('\'', "''");
            format!(
                "SELECT c.table_name, c.column_name, c.data_type, c.is_nullable \
                 FROM information_schema.columns c \
                 JOIN information_schema.tables t \
                 ON t.table_schema = c.table_schema AND t.table_name = c.table_name \
                 WHERE c.table_schema = '{schema}' AND t.table_type = 'BASE TABLE' \
                 ORDER BY c.table_name, c.ordinal_position"
            )
        }
        EngineKind::MySql => "SELECT c.TABLE_NAME AS table_name, c.COLUMN_NAME AS column_name, \
             c.DATA_TYPE AS data_type, c.IS_NULLABLE AS is_nullable \
             FROM information_schema.COLUMNS c \
             JOIN information_schema.TABLES t \
             ON t.TABLE_SCHEMA = c.TABLE_SCHEMA AND t.TABLE_NAME = c.TABLE_NAME \
             WHERE c.TABLE_SCHEMA = DATABASE() AND t.TABLE_TYPE = 'BASE TABLE' \
             ORDER BY c.TABLE_NAME, c.ORDINAL_POSITION"
            .to_string(),
        EngineKind::Mssql => "SELECT t.name AS table_name, c.name AS column_name, \
             ty.name AS data_type, \
             CASE WHEN c.is_nullable = 1 THEN 'YES' ELSE 'NO' END AS is_nullable \
             FROM sys.tables t \
             JOIN sys.columns c ON c.object_id = t.object_id \
             JOIN sys.types ty ON ty.user_type_id = c.user_type_id \
             ORDER BY t.name, c.column_id"
            .to_string(),
    }
}

/// Renders column rows as CREATE TABLE text for the generator prompt.
/// Rows must already be ordered by table.
pub fn render_schema_text(rows: &[Value]) -> String {
    let mut out = String::new();
    let mut current: Option<String> = None;
    for row in rows {
        let table = row.get("table_name").and_then(Value::as_str).unwrap_or("");
        let column = row.get("column_name").and_then(Value::as_str).unwrap_or("");
        let data_type = row.get("data_type").and_then(Value::as_str).unwrap_or("");
        let nullable = matches!(row.get("is_nullable").and_then(Value::as_str), Some("YES"));
        if table.is_empty() || column.is_empty() {
            continue;
        }
        if current.as_deref() != Some(table) {
            if current.is_some() {
                out.push_str("\n)\n\n");
            }
            out.push_str("CREATE TABLE ");
            out.push_str(table);
            out.push_str(" (");
            current = Some(table.to_string());
        } else {
            out.push(',');
        }
        out.push_str("\n\t");
        out.push_str(column);
        out.push(' ');
        out.push_str(data_type);
        if !nullable {
            out.push_str(" NOT NULL");
        }
    }
    if current.is_some() {
        out.push_str("\n)\n");
    }
    out
}
