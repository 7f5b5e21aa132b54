//! Natural-language-to-SQL translation against a schema registry.
//!
//! The registry maps a schema name to the tables ingested under it
//! ([`crate::sheet`]); translation scope is always one schema. The chat
//! collaborator generates SQLite SQL from a schema description, and the
//! generated query is grounded against the registry *before* execution:
//! every identifier must resolve to a known table, column, alias, or SQL
//! keyword, and only a single SELECT statement is accepted. Grounding
//! failures are [`TranslationError`]; runtime failures of a grounded query
//! are [`ExecutionError`] carrying the offending SQL.

use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, SqlitePool, TypeInfo, ValueRef};
use std::collections::HashSet;
use tracing::{debug, info};

use crate::error::{ExecutionError, RouterError, TranslationError};
use crate::llm::ChatProvider;
use crate::models::{ColumnDef, SchemaDef, TableDef};

/// Result of one translated and executed question.
#[derive(Debug, Clone)]
pub struct TabularResult {
    /// The generated SQL, returned for auditability.
    pub sql: String,
    /// Result rows as JSON objects keyed by column name.
    pub rows: Vec<serde_json::Value>,
    pub row_count: usize,
}

// ============ Schema registry ============

/// Load a schema and its table definitions from the registry.
pub async fn load_schema(pool: &SqlitePool, name: &str) -> Result<Option<SchemaDef>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT table_name, physical_name, columns_json, row_count FROM tabular_tables \
         WHERE schema_name = ? ORDER BY table_name",
    )
    .bind(name)
    .fetch_all(pool)
    .await?;

    if rows.is_empty() {
        return Ok(None);
    }

    let mut tables = Vec::with_capacity(rows.len());
    for row in &rows {
        let columns_json: String = row.get("columns_json");
        let columns: Vec<ColumnDef> = serde_json::from_str(&columns_json).unwrap_or_default();
        tables.push(TableDef {
            schema: name.to_string(),
            name: row.get("table_name"),
            physical_name: row.get("physical_name"),
            columns,
            row_count: row.get("row_count"),
        });
    }

    Ok(Some(SchemaDef {
        name: name.to_string(),
        tables,
    }))
}

/// List all schema names with their table counts.
pub async fn list_schemas(pool: &SqlitePool) -> Result<Vec<(String, i64)>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT schema_name, COUNT(*) AS table_count FROM tabular_tables \
         GROUP BY schema_name ORDER BY schema_name",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| (row.get("schema_name"), row.get("table_count")))
        .collect())
}

// ============ Translation + execution ============

/// Translate a question into SQL against `schema`, ground it, execute it,
/// and return the rows plus the query text.
pub async fn translate_and_execute(
    pool: &SqlitePool,
    chat: &dyn ChatProvider,
    schema: &SchemaDef,
    question: &str,
) -> Result<TabularResult, RouterError> {
    if schema.tables.is_empty() {
        return Err(TranslationError::new(format!(
            "schema '{}' has no tables",
            schema.name
        ))
        .into());
    }

    let schema_text = schema_description(pool, schema).await?;
    let prompt = sql_generation_prompt(&schema_text, question);

    let raw = chat.complete(&prompt).await.map_err(RouterError::Collaborator)?;
    let sql = strip_fences(&raw);
    debug!(sql = %sql, "generated SQL");

    if let Some(reason) = sql.strip_prefix("ERROR:") {
        return Err(TranslationError::new(reason.trim().to_string()).into());
    }

    validate_grounding(&sql, schema)?;

    let rows = match sqlx::query(&sql).fetch_all(pool).await {
        Ok(rows) => rows,
        Err(e) => {
            return Err(ExecutionError {
                query: sql,
                reason: e.to_string(),
            }
            .into())
        }
    };

    let mut decoded = Vec::with_capacity(rows.len());
    for row in &rows {
        match decode_row(row) {
            Ok(value) => decoded.push(value),
            Err(e) => {
                return Err(ExecutionError {
                    query: sql,
                    reason: format!("failed to decode result row: {}", e),
                }
                .into())
            }
        }
    }

    info!(
        schema = %schema.name,
        rows = decoded.len(),
        "executed translated query"
    );

    let row_count = decoded.len();
    Ok(TabularResult {
        sql,
        rows: decoded,
        row_count,
    })
}

/// Describe the schema for the SQL-generation prompt: typed columns, row
/// counts, and up to two sample rows per table.
async fn schema_description(pool: &SqlitePool, schema: &SchemaDef) -> Result<String, sqlx::Error> {
    let mut out = Vec::new();
    for table in &schema.tables {
        let col_desc: Vec<String> = table
            .columns
            .iter()
            .map(|c| format!("{} ({})", c.name, c.column_type.as_sql()))
            .collect();

        out.push(format!("Table: {}", table.physical_name));
        out.push(format!("Columns: {}", col_desc.join(", ")));
        out.push(format!("Row count: {}", table.row_count));

        let sample = sqlx::query(&format!(
            "SELECT * FROM \"{}\" LIMIT 2",
            table.physical_name
        ))
        .fetch_all(pool)
        .await?;
        if !sample.is_empty() {
            let mut rendered = Vec::new();
            for row in &sample {
                if let Ok(value) = decode_row(row) {
                    rendered.push(value.to_string());
                }
            }
            out.push(format!("Sample data: [{}]", rendered.join(" | ")));
        }

        out.push(String::new());
    }
    Ok(out.join("\n"))
}

/// Prompt instructing the model to emit a single SQLite SELECT, or an
/// `ERROR:` line when the question cannot be answered from the schema.
fn sql_generation_prompt(schema_text: &str, question: &str) -> String {
    format!(
        "You are an expert SQL developer. Convert this natural language query to a valid \
         SQLite SQL query.\n\n\
         Database Schema:\n{schema_text}\n\
         Natural Language Query: {question}\n\n\
         Rules:\n\
         1. Return ONLY the SQL query, nothing else.\n\
         2. Use valid SQLite syntax and a single SELECT statement.\n\
         3. Use double quotes for table and column names, and exactly the table names listed above.\n\
         4. Make sure to handle JOINs appropriately if needed.\n\
         5. If the query cannot be answered from the schema, return \"ERROR: \" followed by a brief explanation.\n\n\
         SQL Query:"
    )
}

/// Strip markdown code fences from a model reply.
fn strip_fences(reply: &str) -> String {
    let mut s = reply.trim();
    if let Some(rest) = s.strip_prefix("```sql") {
        s = rest;
    } else if let Some(rest) = s.strip_prefix("```") {
        s = rest;
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest;
    }
    s.trim().to_string()
}

// ============ Grounding validation ============

#[derive(Debug, Clone, PartialEq)]
enum SqlToken {
    Ident(String),
    Punct(char),
}

/// SQL keywords and builtin function names allowed to appear as bare
/// identifiers in a generated query.
const SQL_KEYWORDS: &[&str] = &[
    "SELECT", "FROM", "WHERE", "GROUP", "BY", "ORDER", "HAVING", "LIMIT", "OFFSET", "JOIN",
    "INNER", "LEFT", "RIGHT", "FULL", "OUTER", "CROSS", "ON", "USING", "AS", "AND", "OR", "NOT",
    "IN", "IS", "NULL", "LIKE", "GLOB", "BETWEEN", "CASE", "WHEN", "THEN", "ELSE", "END",
    "DISTINCT", "ALL", "UNION", "EXCEPT", "INTERSECT", "EXISTS", "ASC", "DESC", "WITH", "COUNT",
    "SUM", "AVG", "MIN", "MAX", "TOTAL", "GROUP_CONCAT", "ROUND", "ABS", "LENGTH", "LOWER",
    "UPPER", "SUBSTR", "TRIM", "LTRIM", "RTRIM", "REPLACE", "COALESCE", "IFNULL", "NULLIF",
    "CAST", "INTEGER", "REAL", "TEXT", "NUMERIC", "DATE", "TIME", "DATETIME", "STRFTIME",
    "JULIANDAY", "CURRENT_DATE", "CURRENT_TIME", "CURRENT_TIMESTAMP", "TRUE", "FALSE",
];

fn is_keyword(token: &str) -> bool {
    let upper = token.to_ascii_uppercase();
    SQL_KEYWORDS.contains(&upper.as_str())
}

/// Reject a generated query unless every identifier resolves to a known
/// table, column, alias, or keyword, and the statement is a single SELECT.
pub fn validate_grounding(sql: &str, schema: &SchemaDef) -> Result<(), TranslationError> {
    let tokens = tokenize_sql(sql)?;

    if tokens.is_empty() {
        return Err(TranslationError::new("generated query is empty"));
    }

    match &tokens[0] {
        SqlToken::Ident(first)
            if first.eq_ignore_ascii_case("select") || first.eq_ignore_ascii_case("with") => {}
        _ => {
            return Err(TranslationError::new(
                "only SELECT queries can be executed",
            ))
        }
    }

    let tables: HashSet<String> = schema
        .tables
        .iter()
        .map(|t| t.physical_name.to_lowercase())
        .collect();
    let columns: HashSet<String> = schema
        .tables
        .iter()
        .flat_map(|t| t.columns.iter().map(|c| c.name.to_lowercase()))
        .collect();

    // First pass: collect aliases. An identifier is an alias when it
    // directly follows AS, or directly follows a known table name.
    let mut aliases: HashSet<String> = HashSet::new();
    for window in tokens.windows(2) {
        if let (SqlToken::Ident(a), SqlToken::Ident(b)) = (&window[0], &window[1]) {
            let a_lower = a.to_lowercase();
            let b_lower = b.to_lowercase();
            if a.eq_ignore_ascii_case("as") && !is_keyword(b) {
                aliases.insert(b_lower);
            } else if tables.contains(&a_lower) && !is_keyword(b) {
                aliases.insert(b_lower);
            }
        }
    }

    // Second pass: every identifier must be grounded.
    for token in &tokens {
        if let SqlToken::Ident(ident) = token {
            if is_keyword(ident) {
                continue;
            }
            let lower = ident.to_lowercase();
            if tables.contains(&lower) || columns.contains(&lower) || aliases.contains(&lower) {
                continue;
            }
            return Err(TranslationError::new(format!(
                "query references unknown identifier '{}'",
                ident
            )));
        }
    }

    Ok(())
}

/// Split SQL into identifier and punctuation tokens, skipping literals and
/// comments. A second statement after `;` is rejected.
fn tokenize_sql(sql: &str) -> Result<Vec<SqlToken>, TranslationError> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0usize;
    let n = chars.len();

    while i < n {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
        } else if c == '-' && i + 1 < n && chars[i + 1] == '-' {
            while i < n && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '/' && i + 1 < n && chars[i + 1] == '*' {
            i += 2;
            while i + 1 < n && !(chars[i] == '*' && chars[i + 1] == '/') {
                i += 1;
            }
            i = (i + 2).min(n);
        } else if c == '\'' {
            // String literal; '' escapes a quote.
            i += 1;
            loop {
                if i >= n {
                    return Err(TranslationError::new("unterminated string literal"));
                }
                if chars[i] == '\'' {
                    if i + 1 < n && chars[i + 1] == '\'' {
                        i += 2;
                        continue;
                    }
                    i += 1;
                    break;
                }
                i += 1;
            }
        } else if c == '"' {
            // Quoted identifier.
            i += 1;
            let start = i;
            while i < n && chars[i] != '"' {
                i += 1;
            }
            if i >= n {
                return Err(TranslationError::new("unterminated quoted identifier"));
            }
            tokens.push(SqlToken::Ident(chars[start..i].iter().collect()));
            i += 1;
        } else if c.is_ascii_digit() {
            // Numeric literal.
            while i < n && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                i += 1;
            }
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < n && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(SqlToken::Ident(chars[start..i].iter().collect()));
        } else if c == ';' {
            if chars[i + 1..].iter().any(|c| !c.is_whitespace()) {
                return Err(TranslationError::new(
                    "multiple SQL statements are not allowed",
                ));
            }
            i = n;
        } else {
            tokens.push(SqlToken::Punct(c));
            i += 1;
        }
    }

    Ok(tokens)
}

// ============ Row decoding ============

/// Decode a dynamically-typed result row into a JSON object keyed by
/// column name.
pub fn decode_row(row: &SqliteRow) -> Result<serde_json::Value, sqlx::Error> {
    let mut object = serde_json::Map::new();
    for column in row.columns() {
        let i = column.ordinal();
        let raw = row.try_get_raw(i)?;
        let value = if raw.is_null() {
            serde_json::Value::Null
        } else {
            match raw.type_info().name() {
                "INTEGER" => serde_json::Value::from(row.try_get::<i64, _>(i)?),
                "REAL" => serde_json::Value::from(row.try_get::<f64, _>(i)?),
                _ => serde_json::Value::from(row.try_get::<String, _>(i)?),
            }
        };
        object.insert(column.name().to_string(), value);
    }
    Ok(serde_json::Value::Object(object))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ColumnDef, ColumnType};

    fn sales_schema() -> SchemaDef {
        SchemaDef {
            name: "demo".to_string(),
            tables: vec![TableDef {
                schema: "demo".to_string(),
                name: "sales".to_string(),
                physical_name: "demo__sales".to_string(),
                columns: vec![
                    ColumnDef {
                        name: "region".to_string(),
                        column_type: ColumnType::Text,
                    },
                    ColumnDef {
                        name: "amount".to_string(),
                        column_type: ColumnType::Integer,
                    },
                ],
                row_count: 2,
            }],
        }
    }

    #[test]
    fn test_grounded_query_passes() {
        let schema = sales_schema();
        validate_grounding("SELECT region, SUM(amount) FROM demo__sales GROUP BY region", &schema)
            .unwrap();
    }

    #[test]
    fn test_quoted_identifiers_pass() {
        let schema = sales_schema();
        validate_grounding(
            "SELECT \"region\" FROM \"demo__sales\" WHERE \"amount\" > 10",
            &schema,
        )
        .unwrap();
    }

    #[test]
    fn test_unknown_table_rejected() {
        let schema = sales_schema();
        let err = validate_grounding("SELECT * FROM inventory", &schema).unwrap_err();
        assert!(err.reason.contains("inventory"));
    }

    #[test]
    fn test_unknown_column_rejected() {
        let schema = sales_schema();
        let err =
            validate_grounding("SELECT price FROM demo__sales", &schema).unwrap_err();
        assert!(err.reason.contains("price"));
    }

    #[test]
    fn test_table_alias_allowed() {
        let schema = sales_schema();
        validate_grounding(
            "SELECT s.region FROM demo__sales s WHERE s.amount > 100",
            &schema,
        )
        .unwrap();
    }

    #[test]
    fn test_as_alias_allowed() {
        let schema = sales_schema();
        validate_grounding(
            "SELECT SUM(amount) AS total FROM demo__sales ORDER BY total DESC",
            &schema,
        )
        .unwrap();
    }

    #[test]
    fn test_non_select_rejected() {
        let schema = sales_schema();
        let err = validate_grounding("DELETE FROM demo__sales", &schema).unwrap_err();
        assert!(err.reason.contains("SELECT"));
    }

    #[test]
    fn test_multiple_statements_rejected() {
        let schema = sales_schema();
        let err = validate_grounding(
            "SELECT region FROM demo__sales; DROP TABLE demo__sales",
            &schema,
        )
        .unwrap_err();
        assert!(err.reason.contains("multiple"));
    }

    #[test]
    fn test_trailing_semicolon_allowed() {
        let schema = sales_schema();
        validate_grounding("SELECT region FROM demo__sales;", &schema).unwrap();
    }

    #[test]
    fn test_string_literals_are_not_identifiers() {
        let schema = sales_schema();
        validate_grounding(
            "SELECT amount FROM demo__sales WHERE region = 'nonexistent_place'",
            &schema,
        )
        .unwrap();
    }

    #[test]
    fn test_strip_fences() {
        assert_eq!(strip_fences("```sql\nSELECT 1\n```"), "SELECT 1");
        assert_eq!(strip_fences("```\nSELECT 1\n```"), "SELECT 1");
        assert_eq!(strip_fences("  SELECT 1  "), "SELECT 1");
    }
}
