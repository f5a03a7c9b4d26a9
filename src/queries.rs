// The query algebra over node metadata, keys, and structure family.
//
// Queries are plain data values. Translation to SQL lives in
// catalog::translate; evaluation against in-memory containers lives here.
// Successive searches conjoin: a.search(q1).search(q2) must produce the
// same result set as searching for (q1 AND q2), for every mix of SQL
// pushdown and in-memory evaluation.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::structures::StructureFamily;

/// Comparison operator for ordered metadata values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Lt,
    Le,
    Gt,
    Ge,
}

impl Operator {
    pub fn sql(&self) -> &'static str {
        match self {
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
        }
    }
}

/// A composable metadata query. `key` fields are dotted paths into the
/// node metadata, e.g. "sample.temperature".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Query {
    Eq {
        key: String,
        value: JsonValue,
    },
    NotEq {
        key: String,
        value: JsonValue,
    },
    Comparison {
        operator: Operator,
        key: String,
        value: JsonValue,
    },
    /// Substring match on a string value, or membership when the stored
    /// value is a list.
    Contains {
        key: String,
        value: JsonValue,
    },
    In {
        key: String,
        values: Vec<JsonValue>,
    },
    NotIn {
        key: String,
        values: Vec<JsonValue>,
    },
    /// Restrict to an explicit set of child keys.
    KeysFilter {
        keys: Vec<String>,
    },
    StructureFamily {
        value: StructureFamily,
    },
    /// Whole-word match over all metadata string values.
    FullText {
        text: String,
    },
    Regex {
        key: String,
        pattern: String,
        #[serde(default)]
        case_sensitive: bool,
    },
    /// Matches nodes whose access_blob user equals `user_id`, or whose
    /// access_blob tags intersect `tags`. Emitted by the access policy;
    /// conjoined with user-supplied filters for search pushdown.
    AccessBlobFilter {
        user_id: String,
        tags: Vec<String>,
    },
}

/// Look up a dotted path in a metadata document.
pub fn metadata_path<'a>(metadata: &'a JsonValue, key: &str) -> Option<&'a JsonValue> {
    let mut current = metadata;
    for segment in key.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn compare_ordered(left: &JsonValue, op: Operator, right: &JsonValue) -> bool {
    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        return match op {
            Operator::Lt => l < r,
            Operator::Le => l <= r,
            Operator::Gt => l > r,
            Operator::Ge => l >= r,
        };
    }
    if let (Some(l), Some(r)) = (left.as_str(), right.as_str()) {
        return match op {
            Operator::Lt => l < r,
            Operator::Le => l <= r,
            Operator::Gt => l > r,
            Operator::Ge => l >= r,
        };
    }
    false
}

fn fulltext_matches(metadata: &JsonValue, text: &str) -> bool {
    let needle = text.to_lowercase();
    fn walk(value: &JsonValue, needle: &str) -> bool {
        match value {
            JsonValue::String(s) => s
                .to_lowercase()
                .split(|c: char| !c.is_alphanumeric())
                .any(|word| word == needle),
            JsonValue::Array(items) => items.iter().any(|v| walk(v, needle)),
            JsonValue::Object(map) => map.values().any(|v| walk(v, needle)),
            _ => false,
        }
    }
    walk(metadata, &needle)
}

/// Evaluate a query against one node's attributes. This is the in-memory
/// counterpart to the SQL translation and must agree with it.
pub fn matches(
    query: &Query,
    key: &str,
    structure_family: StructureFamily,
    metadata: &JsonValue,
    access_blob: Option<&JsonValue>,
) -> bool {
    match query {
        Query::Eq { key: path, value } => {
            metadata_path(metadata, path).is_some_and(|v| v == value)
        }
        Query::NotEq { key: path, value } => {
            metadata_path(metadata, path).is_some_and(|v| v != value)
        }
        Query::Comparison {
            operator,
            key: path,
            value,
        } => metadata_path(metadata, path)
            .is_some_and(|v| compare_ordered(v, *operator, value)),
        Query::Contains { key: path, value } => {
            metadata_path(metadata, path).is_some_and(|stored| match stored {
                JsonValue::String(s) => value
                    .as_str()
                    .is_some_and(|needle| s.contains(needle)),
                JsonValue::Array(items) => items.contains(value),
                _ => false,
            })
        }
        Query::In { key: path, values } => {
            metadata_path(metadata, path).is_some_and(|v| values.contains(v))
        }
        Query::NotIn { key: path, values } => {
            metadata_path(metadata, path).is_some_and(|v| !values.contains(v))
        }
        Query::KeysFilter { keys } => keys.iter().any(|k| k == key),
        Query::StructureFamily { value } => structure_family == *value,
        Query::FullText { text } => fulltext_matches(metadata, text),
        Query::Regex {
            key: path,
            pattern,
            case_sensitive,
        } => {
            let Some(stored) = metadata_path(metadata, path).and_then(|v| v.as_str()) else {
                return false;
            };
            let built = if *case_sensitive {
                regex::Regex::new(pattern)
            } else {
                regex::RegexBuilder::new(pattern).case_insensitive(true).build()
            };
            match built {
                Ok(re) => re.is_match(stored),
                Err(_) => false,
            }
        }
        Query::AccessBlobFilter { user_id, tags } => {
            let Some(blob) = access_blob else {
                return false;
            };
            if !user_id.is_empty()
                && blob.get("user").and_then(|v| v.as_str()) == Some(user_id.as_str())
            {
                return true;
            }
            blob.get("tags")
                .and_then(|v| v.as_array())
                .is_some_and(|node_tags| {
                    node_tags
                        .iter()
                        .filter_map(|t| t.as_str())
                        .any(|t| tags.iter().any(|wanted| wanted == t))
                })
        }
    }
}
