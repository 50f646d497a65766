//! Chart payload handling: the tool schema offered to the generator and the
//! post-processing applied to its arguments before they reach the client.

use crate::error::AppError;
use serde_json::{json, Map, Value};

pub const GRAPH_TOOL_NAME: &str = "generate_graph_data";

/// Tool list for the forced visualization call, in Chat Completions format.
pub fn graph_tools() -> Vec<Value> {
    vec![json!({
        "type": "function",
        "function": {
            "name": GRAPH_TOOL_NAME,
            "description": "Generate structured JSON data for creating charts and graphs.",
            "parameters": {
                "type": "object",
                "properties": {
                    "chartType": {
                        "type": "string",
                        "enum": ["bar", "multiBar", "line", "pie", "area", "stackedArea"],
                        "description": "The type of chart or table to generate"
                    },
                    "config": {
                        "type": "object",
                        "properties": {
                            "title": { "type": "string" },
                            "description": { "type": "string" },
                            "trend": {
                                "type": "object",
                                "properties": {
                                    "percentage": { "type": "number" },
                                    "direction": { "type": "string", "enum": ["up", "down"] }
                                },
                                "required": ["percentage", "direction"]
                            },
                            "footer": { "type": "string" },
                            "totalLabel": { "type": "string" },
                            "xAxisKey": { "type": "string" }
                        },
                        "required": ["title", "description"]
                    },
                    "data": {
                        "type": "array",
                        "items": { "type": "object", "additionalProperties": true }
                    },
                    "chartConfig": {
                        "type": "object",
                        "additionalProperties": {
                            "type": "object",
                            "properties": {
                                "label": { "type": "string" },
                                "stacked": { "type": "boolean" }
                            },
                            "required": ["label"]
                        }
                    }
                },
                "required": ["chartType", "config", "data", "chartConfig"]
            }
        }
    })]
}

/// Validates and normalizes the tool arguments into the chart payload sent
/// to the client. Pie data is reduced to value/segment pairs and each series
/// in `chartConfig` is assigned a theme color by position.
pub fn process_chart(arguments: &Value) -> Result<Value, AppError> {
    let source = arguments
        .as_object()
        .ok_or_else(|| AppError::execution("Invalid chart data structure"))?;

    let chart_type = source
        .get("chartType")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| AppError::execution("Invalid chart data structure"))?
        .to_string();

    let rows = source
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| AppError::execution("Invalid chart data structure"))?;

    let mut chart = source.clone();

    if chart_type == "pie" {
        let transformed = transform_pie_rows(rows)?;
        chart.insert("data".to_string(), Value::Array(transformed));
        let config = chart
            .entry("config".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(config) = config.as_object_mut() {
            config.insert("xAxisKey".to_string(), Value::String("segment".to_string()));
        }
    }

    let mut recolored = Map::new();
    if let Some(series) = source.get("chartConfig").and_then(Value::as_object) {
        for (index, (key, entry)) in series.iter().enumerate() {
            let mut entry = match entry.as_object() {
                Some(fields) => fields.clone(),
                None => Map::new(),
            };
            entry.insert(
                "color".to_string(),
                Value::String(format!("hsl(var(--chart-{}))", index + 1)),
            );
            recolored.insert(key.clone(), Value::Object(entry));
        }
    }
    chart.insert("chartConfig".to_string(), Value::Object(recolored));

    Ok(Value::Object(chart))
}

/// Collapses arbitrary result rows into `{value, segment}` pairs for pie
/// charts. The first numeric field becomes the value and the first field
/// left over becomes the segment label.
pub fn transform_pie_rows(rows: &[Value]) -> Result<Vec<Value>, AppError> {
    rows.iter()
        .map(|row| {
            let object = row
                .as_object()
                .ok_or_else(pie_entry_error)?;

            let mut value: Option<f64> = None;
            let mut segment: Option<String> = None;
            for entry in object.values() {
                let number = numeric_value(entry);
                if value.is_none() && number.is_some() {
                    value = number;
                } else if segment.is_none() {
                    segment = Some(segment_label(entry));
                }
                if value.is_some() && segment.is_some() {
                    break;
                }
            }

            match (value, segment) {
                (Some(value), Some(segment)) => Ok(json!({ "value": value, "segment": segment })),
                _ => Err(pie_entry_error()),
            }
        })
        .collect()
}

fn pie_entry_error() -> AppError {
    AppError::execution("Object does not contain a valid numeric entry and a segment.")
}

fn numeric_value(entry: &Value) -> Option<f64> {
    match entry {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                None
            } else {
                trimmed.parse::<f64>().ok().filter(|number| number.is_finite())
            }
        }
        _ => None,
    }
}

fn segment_label(entry: &Value) -> String {
    match entry {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pie_rows_pick_first_numeric_and_first_remaining_field() {
        let rows = vec![
            json!({"region": "North", "sales": 120}),
            json!({"total": "42.5", "label": "South"}),
        ];
        let transformed = transform_pie_rows(&rows).unwrap();
        assert_eq!(transformed[0], json!({"value": 120.0, "segment": "North"}));
        assert_eq!(transformed[1], json!({"value": 42.5, "segment": "South"}));
    }

    #[test]
    fn pie_rows_without_numeric_field_are_rejected() {
        let rows = vec![json!({"a": "North", "b": "South"})];
        let err = transform_pie_rows(&rows).unwrap_err();
        assert_eq!(
            err.message(),
            "Object does not contain a valid numeric entry and a segment."
        );

        let rows = vec![json!({"only": 7})];
        assert!(transform_pie_rows(&rows).is_err());
    }

    #[test]
    fn process_chart_rejects_malformed_payloads() {
        assert!(process_chart(&json!("nope")).is_err());
        assert!(process_chart(&json!({"config": {}})).is_err());
        assert!(process_chart(&json!({"chartType": "bar", "data": "rows"})).is_err());
    }

    #[test]
    fn process_chart_colors_series_in_order() {
        let arguments = json!({
            "chartType": "multiBar",
            "config": {"title": "Sales", "description": "by region"},
            "data": [{"region": "North", "q1": 10, "q2": 20}],
            "chartConfig": {
                "q1": {"label": "Q1"},
                "q2": {"label": "Q2", "stacked": true}
            }
        });
        let chart = process_chart(&arguments).unwrap();
        assert_eq!(
            chart["chartConfig"]["q1"],
            json!({"label": "Q1", "color": "hsl(var(--chart-1))"})
        );
        assert_eq!(
            chart["chartConfig"]["q2"],
            json!({"label": "Q2", "stacked": true, "color": "hsl(var(--chart-2))"})
        );
        assert_eq!(chart["data"], arguments["data"]);
    }

    #[test]
    fn process_chart_reshapes_pie_payloads() {
        let arguments = json!({
            "chartType": "pie",
            "config": {"title": "Share", "description": "per region"},
            "data": [
                {"region": "North", "share": 60},
                {"region": "South", "share": 40}
            ],
            "chartConfig": {"share": {"label": "Share"}}
        });
        let chart = process_chart(&arguments).unwrap();
        assert_eq!(chart["config"]["xAxisKey"], "segment");
        assert_eq!(
            chart["data"],
            json!([
                {"value": 60.0, "segment": "North"},
                {"value": 40.0, "segment": "South"}
            ])
        );
        assert_eq!(chart["config"]["title"], "Share");
    }
}
