//! Parsers for the structured generator reply (explanation / query /
//! visualization sections).

use regex::Regex;

const READ_KEYWORDS: [&str; 10] = [
    "SELECT",
    "WITH",
    "EXPLAIN",
    "ANALYZE",
    "SHOW",
    "DESCRIBE",
    "DESC",
    "PREPARE",
    "VALUES",
    "TABLE",
];

const VALID_VISUALIZATIONS: [&str; 7] = [
    "bar",
    "multiBar",
    "line",
    "pie",
    "area",
    "stackedArea",
    "table",
];

fn query_na_regex() -> &'static Regex {
    static REGEX: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"(?i)Query:\s*N/A").expect("invalid query n/a regex"))
}

fn quoted_query_regex() -> &'static Regex {
    static REGEX: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r#"Query:\s*"(.+)""#).expect("invalid quoted query regex"))
}

fn visualization_regex() -> &'static Regex {
    static REGEX: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(?is)visualization:?(.*?)(explanation:|query:|$)")
            .expect("invalid visualization regex")
    })
}

fn explanation_regex() -> &'static Regex {
    static REGEX: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(?is)explanation:?(.*?)(visualization:|query:|$)")
            .expect("invalid explanation regex")
    })
}

/// Pulls the SQL statement out of a generator reply.
///
/// A reply of `Query: N/A` means the model declined, which comes back as an
/// empty string. Otherwise the quoted form `Query: "..."` is unwrapped when
/// present, the text is scanned for the earliest read keyword, and the
/// statement runs until the first blank line with code fences stripped.
pub fn extract_sql(text: &str) -> String {
    if query_na_regex().is_match(text) {
        return String::new();
    }

    let clean_text = match quoted_query_regex().captures(text) {
        Some(captures) => match captures.get(1) {
            Some(group) => group.as_str(),
            None => text,
        },
        None => text,
    };

    let start_index = READ_KEYWORDS
        .iter()
        .filter_map(|keyword| clean_text.find(keyword))
        .min();

    let Some(start_index) = start_index else {
        return String::new();
    };

    let sql = &clean_text[start_index..];
    let sql = sql.split("\n\n").next().unwrap_or(sql);
    sql.replace("```", "").trim().to_string()
}

/// Reads the suggested visualization type, defaulting to `table` when the
/// section is missing or names an unknown type.
pub fn extract_visualization(text: &str) -> String {
    let section = match visualization_regex().captures(text) {
        Some(captures) => match captures.get(1) {
            Some(group) => group.as_str().to_lowercase().trim().to_string(),
            None => return "table".to_string(),
        },
        None => return "table".to_string(),
    };

    VALID_VISUALIZATIONS
        .iter()
        .find(|viz| section.contains(&viz.to_lowercase()))
        .map(|viz| viz.to_string())
        .unwrap_or_else(|| "table".to_string())
}

/// Reads the explanation section, with a stock fallback when absent.
pub fn extract_explanation(text: &str) -> String {
    match explanation_regex().captures(text) {
        Some(captures) => match captures.get(1) {
            Some(group) => group.as_str().trim().to_string(),
            None => "No explanation provided".to_string(),
        },
        None => "No explanation provided".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPLY: &str = "explanation: Counts signups per month.\nquery: SELECT month, COUNT(*) FROM signups GROUP BY month\nvisualization: bar";

    #[test]
    fn sql_is_extracted_from_sectioned_reply() {
        assert_eq!(
            extract_sql(REPLY),
            "SELECT month, COUNT(*) FROM signups GROUP BY month\nvisualization: bar"
        );
    }

    #[test]
    fn quoted_query_is_unwrapped() {
        let text = r#"Query: "SELECT id FROM users LIMIT 5""#;
        assert_eq!(extract_sql(text), "SELECT id FROM users LIMIT 5");
    }

    #[test]
    fn declined_query_is_empty() {
        assert_eq!(extract_sql("query: N/A\nexplanation: nothing matches"), "");
        assert_eq!(extract_sql("Query:   n/a"), "");
    }

    #[test]
    fn reply_without_keywords_is_empty() {
        assert_eq!(extract_sql("no statement in here"), "");
    }

    #[test]
    fn sql_stops_at_blank_line_and_drops_fences() {
        let text = "```\nSELECT 1\n```\n\ntrailing prose";
        assert_eq!(extract_sql(text), "SELECT 1");
    }

    #[test]
    fn earliest_keyword_wins() {
        let text = "DESCRIBE t; SELECT 1";
        assert_eq!(extract_sql(text), "DESCRIBE t; SELECT 1");
    }

    #[test]
    fn visualization_parses_known_types() {
        assert_eq!(extract_visualization("visualization: pie"), "pie");
        assert_eq!(
            extract_visualization("Visualization: stackedArea chart"),
            "area"
        );
        assert_eq!(extract_visualization("visualization: multibar"), "bar");
        assert_eq!(extract_visualization("visualization: heatmap"), "table");
        assert_eq!(extract_visualization("no section at all"), "table");
    }

    #[test]
    fn visualization_stops_before_other_sections() {
        let text = "visualization: line\nexplanation: pie would be wrong";
        assert_eq!(extract_visualization(text), "line");
    }

    #[test]
    fn explanation_stops_before_other_sections() {
        assert_eq!(extract_explanation(REPLY), "Counts signups per month.");
        assert_eq!(extract_explanation("bare text"), "No explanation provided");
    }
}
