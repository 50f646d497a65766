//! Prompt templates for SQL generation, one per supported dialect.

use crate::error::AppError;

/// Dialect-specific phrasing substituted into the shared instruction text.
#[derive(Debug)]
pub struct DialectPrompt {
    intro: &'static str,
    limit_clause: &'static str,
    identifier_instructions: &'static str,
    dialect: &'static str,
}

const POSTGRES_PROMPT: DialectPrompt = DialectPrompt {
    intro: "You are a PostgreSQL expert.",
    limit_clause: "using the LIMIT clause as per PostgreSQL",
    identifier_instructions: r#". Wrap each column name in double quotes (") to denote them as delimited identifiers"#,
    dialect: "PostgreSQL",
};

const MYSQL_PROMPT: DialectPrompt = DialectPrompt {
    intro: "You are a MySQL expert.",
    limit_clause: "using the LIMIT clause as per MySQL",
    identifier_instructions: ". Wrap each column name in backticks (`) to denote them as delimited identifiers",
    dialect: "MySQL",
};

const MSSQL_PROMPT: DialectPrompt = DialectPrompt {
    intro: "You are an MS SQL expert.",
    limit_clause: "using the TOP clause as per MS SQL",
    identifier_instructions: ". Wrap each column name in square brackets ([]) to denote them as delimited identifiers",
    dialect: "MS SQL",
};

const VISUALIZATION_GUIDE: &str = r#"Choose the most appropriate visualization type from:
- table: for raw data, detailed information, or multiple columns
- bar: for comparing single values across categories
- multiBar: for comparing multiple values across categories
- line: for showing trends over time or sequence
- pie: for showing parts of a whole (percentages)
- area: for showing cumulative totals over time
- stackedArea: for showing multiple cumulative totals over time"#;

const COMMON_INSTRUCTIONS: &str = r#"Given an input question, create a syntactically correct {dialect} query to run. Unless the user specifies in the question a specific number of examples to obtain, always limit your query to at most {top_k} results {limit_clause}. You can order the results to return the most informative data in the database.

Never query for all columns from a table; you must query only the columns that are needed to answer the question{identifier_instructions}.

Pay attention to use only the column names that you can see in the schema description. If the required tables or columns are not present in the schema, make reasonable assumptions or use placeholder names, and mention any assumptions in the explanation.

**Important Guidelines**:

- **Output Format**: Your final answer **must** be in the following format and **must not include any additional text outside this format**:

```
explanation: [your explanation here]
query: [your SQL query here empty if no query can be made]
visualization: [suggested visualization type]
```

- **Explanation Section**: Include any feedback, notes, or assumptions in the `explanation` section. Do **not** include any text outside the specified format.

{visualization_guide}

Only use the tables listed below:

{table_info}

Question: {input}"#;

/// System prompt for the forced chart tool call.
pub const VISUALIZATION_SYSTEM_PROMPT: &str = r#"You are a data visualization assistant. You receive the rows returned by a SQL query together with the question that produced them. Call the generate_graph_data tool to describe the best chart for that data. Pick the chart type that answers the question most directly, give the chart a short title and description, and list every plotted series in chartConfig with a human readable label. Use the column names from the data as keys, and set xAxisKey to the column holding the category or time axis. Prefer pie when values are parts of a whole and line or area when the data is a trend over time."#;

/// Looks up the prompt for a stored engine name. The name travels as free
/// text on connection records, so unknown values surface here.
pub fn dialect_prompt(engine: &str) -> Result<&'static DialectPrompt, AppError> {
    match engine {
        "postgres" => Ok(&POSTGRES_PROMPT),
        "mysql" => Ok(&MYSQL_PROMPT),
        "mssql" => Ok(&MSSQL_PROMPT),
        other => Err(AppError::generation(format!(
            "Unsupported SQL dialect: {other}"
        ))),
    }
}

impl DialectPrompt {
    /// Fills the shared template. The question is substituted last so user
    /// text cannot expand the other placeholders.
    pub fn render(&self, table_info: &str, input: &str, top_k: u32) -> String {
        let body = COMMON_INSTRUCTIONS
            .replace("{dialect}", self.dialect)
            .replace("{limit_clause}", self.limit_clause)
            .replace("{identifier_instructions}", self.identifier_instructions)
            .replace("{visualization_guide}", VISUALIZATION_GUIDE)
            .replace("{top_k}", &top_k.to_string())
            .replace("{table_info}", table_info)
            .replace("{input}", input);
        format!("{}\n\n{}", self.intro, body)
    }
}
