// Query-to-SQL translation, per database dialect.
//
// Statements are assembled through a SqlBuilder that owns the bind list,
// so placeholder numbering stays correct on PostgreSQL. Composition of
// search conditions is an explicit AND of accumulated predicates.

use serde_json::Value as JsonValue;
use sqlx::any::AnyRow;

use crate::errors::{Result, TreeError};
use crate::queries::{Operator, Query};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    pub fn from_uri(uri: &str) -> Result<Self> {
        if uri.starts_with("sqlite") {
            Ok(Dialect::Sqlite)
        } else if uri.starts_with("postgres") {
            Ok(Dialect::Postgres)
        } else {
            Err(TreeError::Config(format!(
                "unsupported database URI {uri:?}; expected sqlite: or postgres:"
            )))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Text(String),
    Int(i64),
    Real(f64),
}

/// Incremental SQL assembly with dialect-correct placeholders.
#[derive(Debug)]
pub struct SqlBuilder {
    dialect: Dialect,
    sql: String,
    binds: Vec<BindValue>,
}

impl SqlBuilder {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            sql: String::new(),
            binds: Vec::new(),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn push(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    fn placeholder(&mut self) -> String {
        match self.dialect {
            Dialect::Sqlite => "?".to_string(),
            Dialect::Postgres => format!("${}", self.binds.len()),
        }
    }

    /// Append a placeholder and record its value.
    pub fn bind(&mut self, value: BindValue) -> &mut Self {
        self.binds.push(value);
        let placeholder = self.placeholder();
        self.sql.push_str(&placeholder);
        self
    }

    /// Append a placeholder for a JSON document; PostgreSQL JSONB columns
    /// need an explicit cast on the bound text.
    pub fn bind_json(&mut self, text: String) -> &mut Self {
        match self.dialect {
            Dialect::Sqlite => {
                self.bind(BindValue::Text(text));
            }
            Dialect::Postgres => {
                self.binds.push(BindValue::Text(text));
                let placeholder = self.placeholder();
                self.sql.push_str("CAST(");
                self.sql.push_str(&placeholder);
                self.sql.push_str(" AS JSONB)");
            }
        }
        self
    }

    pub fn finish(self) -> (String, Vec<BindValue>) {
        (self.sql, self.binds)
    }
}

fn bind_one<'q>(
    query: sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>,
    value: &BindValue,
) -> sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>> {
    match value {
        BindValue::Text(s) => query.bind(s.clone()),
        BindValue::Int(i) => query.bind(*i),
        BindValue::Real(f) => query.bind(*f),
    }
}

pub async fn fetch_all<'e, E>(
    executor: E,
    sql: &str,
    binds: &[BindValue],
) -> Result<Vec<AnyRow>>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let mut query = sqlx::query(sql);
    for value in binds {
        query = bind_one(query, value);
    }
    Ok(query.fetch_all(executor).await?)
}

pub async fn fetch_optional<'e, E>(
    executor: E,
    sql: &str,
    binds: &[BindValue],
) -> Result<Option<AnyRow>>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let mut query = sqlx::query(sql);
    for value in binds {
        query = bind_one(query, value);
    }
    Ok(query.fetch_optional(executor).await?)
}

pub async fn execute<'e, E>(
    executor: E,
    sql: &str,
    binds: &[BindValue],
) -> Result<sqlx::any::AnyQueryResult>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let mut query = sqlx::query(sql);
    for value in binds {
        query = bind_one(query, value);
    }
    Ok(query.execute(executor).await?)
}

/// Validate a dotted metadata key and return its segments. Keys are
/// interpolated into JSON path expressions, so the character set is
/// restricted.
fn key_segments(key: &str) -> Result<Vec<&str>> {
    let segments: Vec<&str> = key.split('.').collect();
    for segment in &segments {
        if segment.is_empty()
            || !segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(TreeError::Unprocessable(format!(
                "invalid metadata key {key:?}"
            )));
        }
    }
    Ok(segments)
}

fn sqlite_json_path(segments: &[&str]) -> String {
    let mut path = String::from("$");
    for segment in segments {
        path.push_str(&format!(".\"{segment}\""));
    }
    path
}

fn pg_path_literal(segments: &[&str]) -> String {
    format!("{{{}}}", segments.join(","))
}

/// `json_extract(metadata, '$.a.b')` / `metadata #>> '{a,b}'`.
fn extract_text_expr(dialect: Dialect, column: &str, segments: &[&str]) -> String {
    match dialect {
        Dialect::Sqlite => format!("json_extract({column}, '{}')", sqlite_json_path(segments)),
        Dialect::Postgres => format!("{column} #>> '{}'", pg_path_literal(segments)),
    }
}

fn extract_json_expr(dialect: Dialect, column: &str, segments: &[&str]) -> String {
    match dialect {
        Dialect::Sqlite => format!("json_extract({column}, '{}')", sqlite_json_path(segments)),
        Dialect::Postgres => format!("{column} #> '{}'", pg_path_literal(segments)),
    }
}

/// Nested-object literal for the PostgreSQL containment translation of Eq:
/// key path ["a","b"] and value v become {"a": {"b": v}}.
fn key_array_to_json(segments: &[&str], value: &JsonValue) -> JsonValue {
    let mut current = value.clone();
    for segment in segments.iter().rev() {
        current = serde_json::json!({ *segment: current });
    }
    current
}

fn scalar_bind(value: &JsonValue) -> Result<BindValue> {
    match value {
        JsonValue::String(s) => Ok(BindValue::Text(s.clone())),
        JsonValue::Bool(b) => Ok(BindValue::Int(i64::from(*b))),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(BindValue::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(BindValue::Real(f))
            } else {
                Err(TreeError::Unprocessable(format!(
                    "unrepresentable number {n}"
                )))
            }
        }
        other => Err(TreeError::Unprocessable(format!(
            "scalar operand required, got {other}"
        ))),
    }
}

/// Typed extraction for SQLite, coercing the JSON value to the operand's
/// storage class so that an expression index remains applicable.
fn sqlite_typed_extract(segments: &[&str], value: &JsonValue) -> String {
    let raw = format!("json_extract(metadata, '{}')", sqlite_json_path(segments));
    match value {
        JsonValue::String(_) => raw,
        JsonValue::Bool(_) => format!("CAST({raw} AS INTEGER)"),
        JsonValue::Number(n) if n.is_i64() => format!("CAST({raw} AS INTEGER)"),
        JsonValue::Number(_) => format!("CAST({raw} AS REAL)"),
        _ => raw,
    }
}

fn pg_typed_extract(segments: &[&str], value: &JsonValue) -> String {
    let raw = extract_text_expr(Dialect::Postgres, "metadata", segments);
    match value {
        JsonValue::Number(_) => format!("CAST({raw} AS DOUBLE PRECISION)"),
        _ => raw,
    }
}

/// Render one query as a parenthesized SQL condition on the `nodes` table.
pub fn append_condition(builder: &mut SqlBuilder, query: &Query) -> Result<()> {
    let dialect = builder.dialect();
    match query {
        Query::Eq { key, value } => {
            let segments = key_segments(key)?;
            match dialect {
                Dialect::Sqlite => {
                    builder.push("(");
                    builder.push(&sqlite_typed_extract(&segments, value));
                    builder.push(" = ");
                    builder.bind(scalar_bind(value)?);
                    builder.push(")");
                }
                Dialect::Postgres => {
                    // The GIN-indexed containment operator, fed a nested
                    // JSON object materializing the key path.
                    let literal = key_array_to_json(&segments, value);
                    builder.push("(metadata @> ");
                    builder.bind_json(literal.to_string());
                    builder.push(")");
                }
            }
        }
        Query::NotEq { key, value } => {
            let segments = key_segments(key)?;
            match dialect {
                Dialect::Sqlite => {
                    builder.push("(");
                    builder.push(&sqlite_typed_extract(&segments, value));
                    builder.push(" != ");
                    builder.bind(scalar_bind(value)?);
                    builder.push(")");
                }
                Dialect::Postgres => {
                    builder.push("(");
                    builder.push(&extract_json_expr(dialect, "metadata", &segments));
                    builder.push(" <> ");
                    builder.bind_json(value.to_string());
                    builder.push(")");
                }
            }
        }
        Query::Comparison {
            operator,
            key,
            value,
        } => {
            let segments = key_segments(key)?;
            let expr = match dialect {
                Dialect::Sqlite => sqlite_typed_extract(&segments, value),
                Dialect::Postgres => pg_typed_extract(&segments, value),
            };
            builder.push("(");
            builder.push(&expr);
            builder.push(" ");
            builder.push(operator.sql());
            builder.push(" ");
            builder.bind(scalar_bind(value)?);
            builder.push(")");
        }
        Query::Contains { key, value } => {
            let segments = key_segments(key)?;
            match dialect {
                Dialect::Sqlite => {
                    // Array membership or substring, whichever the stored
                    // value supports.
                    builder.push("(EXISTS (SELECT 1 FROM json_each(metadata, '");
                    builder.push(&sqlite_json_path(&segments));
                    builder.push("') WHERE json_each.value = ");
                    builder.bind(scalar_bind(value)?);
                    builder.push(") OR instr(");
                    builder.push(&extract_text_expr(dialect, "metadata", &segments));
                    builder.push(", ");
                    builder.bind(BindValue::Text(
                        value
                            .as_str()
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| value.to_string()),
                    ));
                    builder.push(") > 0)");
                }
                Dialect::Postgres => {
                    builder.push("(");
                    builder.push(&extract_json_expr(dialect, "metadata", &segments));
                    builder.push(" @> ");
                    builder.bind_json(value.to_string());
                    builder.push(" OR ");
                    builder.push(&extract_text_expr(dialect, "metadata", &segments));
                    builder.push(" LIKE ");
                    let needle = value
                        .as_str()
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| value.to_string());
                    builder.bind(BindValue::Text(format!("%{needle}%")));
                    builder.push(")");
                }
            }
        }
        Query::In { key, values } => {
            append_in_condition(builder, key, values, false)?;
        }
        Query::NotIn { key, values } => {
            append_in_condition(builder, key, values, true)?;
        }
        Query::KeysFilter { keys } => {
            if keys.is_empty() {
                builder.push("(1 = 0)");
            } else {
                builder.push("(\"key\" IN (");
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        builder.push(", ");
                    }
                    builder.bind(BindValue::Text(key.clone()));
                }
                builder.push("))");
            }
        }
        Query::StructureFamily { value } => {
            builder.push("(structure_family = ");
            builder.bind(BindValue::Text(value.as_str().to_string()));
            builder.push(")");
        }
        Query::FullText { text } => match dialect {
            Dialect::Sqlite => {
                // Quote each word so user text cannot inject MATCH syntax.
                let sanitized = text
                    .split_whitespace()
                    .map(|word| format!("\"{}\"", word.replace('"', "")))
                    .collect::<Vec<_>>()
                    .join(" ");
                builder.push(
                    "(id IN (SELECT rowid FROM metadata_fts WHERE metadata_fts MATCH ",
                );
                builder.bind(BindValue::Text(sanitized));
                builder.push("))");
            }
            Dialect::Postgres => {
                builder.push(
                    "(to_tsvector('simple', metadata::text) @@ plainto_tsquery('simple', ",
                );
                builder.bind(BindValue::Text(text.clone()));
                builder.push("))");
            }
        },
        Query::Regex {
            key,
            pattern,
            case_sensitive,
        } => {
            let segments = key_segments(key)?;
            match dialect {
                Dialect::Sqlite => {
                    return Err(TreeError::UnsupportedQueryType("regex"));
                }
                Dialect::Postgres => {
                    builder.push("(");
                    builder.push(&extract_text_expr(dialect, "metadata", &segments));
                    builder.push(if *case_sensitive { " ~ " } else { " ~* " });
                    builder.bind(BindValue::Text(pattern.clone()));
                    builder.push(")");
                }
            }
        }
        Query::AccessBlobFilter { user_id, tags } => {
            append_access_blob_condition(builder, user_id, tags);
        }
    }
    Ok(())
}

fn append_in_condition(
    builder: &mut SqlBuilder,
    key: &str,
    values: &[JsonValue],
    negate: bool,
) -> Result<()> {
    let segments = key_segments(key)?;
    let dialect = builder.dialect();
    if values.is_empty() {
        // IN () matches nothing; NOT IN () matches any present value.
        if negate {
            builder.push("(");
            builder.push(&extract_json_expr(dialect, "metadata", &segments));
            builder.push(" IS NOT NULL)");
        } else {
            builder.push("(1 = 0)");
        }
        return Ok(());
    }
    match dialect {
        Dialect::Sqlite => {
            let expr = sqlite_typed_extract(&segments, &values[0]);
            builder.push("(");
            if negate {
                builder.push(&expr);
                builder.push(" IS NOT NULL AND ");
            }
            builder.push(&expr);
            if negate {
                builder.push(" NOT IN (");
            } else {
                builder.push(" IN (");
            }
            for (i, value) in values.iter().enumerate() {
                if i > 0 {
                    builder.push(", ");
                }
                builder.bind(scalar_bind(value)?);
            }
            builder.push("))");
        }
        Dialect::Postgres => {
            let expr = extract_json_expr(dialect, "metadata", &segments);
            builder.push("(");
            if negate {
                builder.push(&expr);
                builder.push(" IS NOT NULL AND NOT (");
            }
            for (i, value) in values.iter().enumerate() {
                if i > 0 {
                    builder.push(" OR ");
                }
                builder.push(&expr);
                builder.push(" = ");
                builder.bind_json(value.to_string());
            }
            if negate {
                builder.push(")");
            }
            builder.push(")");
        }
    }
    Ok(())
}

fn append_access_blob_condition(builder: &mut SqlBuilder, user_id: &str, tags: &[String]) {
    if user_id.is_empty() && tags.is_empty() {
        // Results cannot possibly match; emit constant false so the engine
        // does no work.
        builder.push("(1 = 0)");
        return;
    }
    let dialect = builder.dialect();
    builder.push("(");
    let mut need_or = false;
    if !tags.is_empty() {
        match dialect {
            Dialect::Sqlite => {
                // Guard against NULL access_blob; json_each requires
                // well-formed JSON input.
                builder.push(
                    "(access_blob IS NOT NULL AND EXISTS \
                     (SELECT 1 FROM json_each(access_blob, '$.\"tags\"') \
                     WHERE json_each.value IN (",
                );
                for (i, tag) in tags.iter().enumerate() {
                    if i > 0 {
                        builder.push(", ");
                    }
                    builder.bind(BindValue::Text(tag.clone()));
                }
                builder.push(")))");
            }
            Dialect::Postgres => {
                builder.push("access_blob->'tags' ?| ARRAY[");
                for (i, tag) in tags.iter().enumerate() {
                    if i > 0 {
                        builder.push(", ");
                    }
                    builder.bind(BindValue::Text(tag.clone()));
                }
                builder.push("]::text[]");
            }
        }
        need_or = true;
    }
    if !user_id.is_empty() {
        if need_or {
            builder.push(" OR ");
        }
        match dialect {
            Dialect::Sqlite => {
                builder.push("json_extract(access_blob, '$.\"user\"') = ");
            }
            Dialect::Postgres => {
                builder.push("access_blob->>'user' = ");
            }
        }
        builder.bind(BindValue::Text(user_id.to_string()));
    }
    builder.push(")");
}

/// Append `AND <condition>` for each accumulated query.
pub fn append_conditions(builder: &mut SqlBuilder, queries: &[Query]) -> Result<()> {
    for query in queries {
        builder.push(" AND ");
        append_condition(builder, query)?;
    }
    Ok(())
}

/// ORDER BY clause for the current sorting, always terminated by the
/// deterministic (time_created, id) tiebreaker so cursors stay stable.
pub fn order_by_clause(dialect: Dialect, sorting: &[(String, i8)]) -> Result<String> {
    let mut clauses: Vec<String> = Vec::new();
    let mut default_direction = 1i8;
    for (key, direction) in sorting {
        if key.is_empty() {
            default_direction = *direction;
            continue;
        }
        let expr = if key == "id" {
            "\"key\"".to_string()
        } else {
            let key = key.strip_prefix("metadata.").unwrap_or(key);
            let segments = key_segments(key)?;
            extract_json_expr(dialect, "metadata", &segments)
        };
        clauses.push(format!(
            "{expr} {}",
            if *direction == -1 { "DESC" } else { "ASC" }
        ));
    }
    let tiebreak_direction = if default_direction == -1 { "DESC" } else { "ASC" };
    clauses.push(format!("time_created {tiebreak_direction}"));
    clauses.push(format!("id {tiebreak_direction}"));
    Ok(format!(" ORDER BY {}", clauses.join(", ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn render(dialect: Dialect, query: &Query) -> (String, Vec<BindValue>) {
        let mut builder = SqlBuilder::new(dialect);
        append_condition(&mut builder, query).unwrap();
        builder.finish()
    }

    #[test]
    fn test_eq_sqlite_coerces_to_literal_type() {
        let (sql, binds) = render(
            Dialect::Sqlite,
            &Query::Eq {
                key: "sample.count".into(),
                value: json!(3),
            },
        );
        assert_eq!(
            sql,
            "(CAST(json_extract(metadata, '$.\"sample\".\"count\"') AS INTEGER) = ?)"
        );
        assert_eq!(binds, vec![BindValue::Int(3)]);
    }

    #[test]
    fn test_eq_postgres_uses_containment() {
        let (sql, binds) = render(
            Dialect::Postgres,
            &Query::Eq {
                key: "a.b".into(),
                value: json!("x"),
            },
        );
        assert_eq!(sql, "(metadata @> CAST($1 AS JSONB))");
        assert_eq!(
            binds,
            vec![BindValue::Text("{\"a\":{\"b\":\"x\"}}".to_string())]
        );
    }

    #[test]
    fn test_comparison_placeholder_numbering() {
        let mut builder = SqlBuilder::new(Dialect::Postgres);
        builder.push("SELECT 1 WHERE x = ");
        builder.bind(BindValue::Int(1));
        append_conditions(
            &mut builder,
            &[Query::Comparison {
                operator: Operator::Gt,
                key: "n".into(),
                value: json!(5),
            }],
        )
        .unwrap();
        let (sql, binds) = builder.finish();
        assert!(sql.contains("$1"));
        assert!(sql.contains("$2"), "second placeholder must be $2: {sql}");
        assert_eq!(binds.len(), 2);
    }

    #[test]
    fn test_regex_unsupported_on_sqlite() {
        let mut builder = SqlBuilder::new(Dialect::Sqlite);
        let err = append_condition(
            &mut builder,
            &Query::Regex {
                key: "a".into(),
                pattern: "x+".into(),
                case_sensitive: true,
            },
        )
        .unwrap_err();
        assert!(matches!(err, TreeError::UnsupportedQueryType("regex")));
    }

    #[test]
    fn test_access_blob_filter_shortcircuits_when_empty() {
        let (sql, binds) = render(
            Dialect::Sqlite,
            &Query::AccessBlobFilter {
                user_id: String::new(),
                tags: vec![],
            },
        );
        assert_eq!(sql, "(1 = 0)");
        assert!(binds.is_empty());
    }

    #[test]
    fn test_access_blob_filter_postgres_shape() {
        let (sql, binds) = render(
            Dialect::Postgres,
            &Query::AccessBlobFilter {
                user_id: "alice".into(),
                tags: vec!["t1".into(), "t2".into()],
            },
        );
        assert_eq!(
            sql,
            "(access_blob->'tags' ?| ARRAY[$1, $2]::text[] OR access_blob->>'user' = $3)"
        );
        assert_eq!(binds.len(), 3);
    }

    #[test]
    fn test_invalid_metadata_key_rejected() {
        let mut builder = SqlBuilder::new(Dialect::Sqlite);
        assert!(append_condition(
            &mut builder,
            &Query::Eq {
                key: "bad'key".into(),
                value: json!(1),
            },
        )
        .is_err());
    }

    #[test]
    fn test_order_by_always_has_tiebreaker() {
        let clause = order_by_clause(Dialect::Sqlite, &[]).unwrap();
        assert_eq!(clause, " ORDER BY time_created ASC, id ASC");

        let clause =
            order_by_clause(Dialect::Sqlite, &[("".to_string(), -1)]).unwrap();
        assert_eq!(clause, " ORDER BY time_created DESC, id DESC");

        let clause = order_by_clause(
            Dialect::Postgres,
            &[("id".to_string(), 1), ("color".to_string(), -1)],
        )
        .unwrap();
        assert_eq!(
            clause,
            " ORDER BY \"key\" ASC, metadata #> '{color}' DESC, time_created ASC, id ASC"
        );
    }

    #[test]
    fn test_keys_filter_empty_is_constant_false() {
        let (sql, _) = render(Dialect::Sqlite, &Query::KeysFilter { keys: vec![] });
        assert_eq!(sql, "(1 = 0)");
    }
}
