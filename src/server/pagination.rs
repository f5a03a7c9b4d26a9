// JSON:API style pagination: page[offset] / page[limit] parameters and
// self/first/last/next/prev links plus meta.count.

use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;

use crate::errors::{Result, TreeError};

pub const DEFAULT_LIMIT: i64 = 100;
pub const MAX_LIMIT: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: i64,
    pub limit: i64,
}

impl Page {
    /// Parse page[offset] / page[limit] from the raw query parameters.
    pub fn from_query(params: &HashMap<String, String>) -> Result<Self> {
        let offset = match params.get("page[offset]") {
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                TreeError::Unprocessable(format!("invalid page[offset] {raw:?}"))
            })?,
            None => 0,
        };
        let limit = match params.get("page[limit]") {
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                TreeError::Unprocessable(format!("invalid page[limit] {raw:?}"))
            })?,
            None => DEFAULT_LIMIT,
        };
        if offset < 0 {
            return Err(TreeError::Unprocessable(
                "page[offset] must be non-negative".into(),
            ));
        }
        if limit <= 0 || limit > MAX_LIMIT {
            return Err(TreeError::Unprocessable(format!(
                "page[limit] must be between 1 and {MAX_LIMIT}"
            )));
        }
        Ok(Self { offset, limit })
    }
}

fn page_url(base: &str, offset: i64, limit: i64) -> String {
    format!("{base}?page[offset]={offset}&page[limit]={limit}")
}

/// Links for the current window over `count` total items. `next` and
/// `prev` are null when inapplicable.
pub fn links(base: &str, page: Page, count: i64) -> JsonValue {
    let Page { offset, limit } = page;
    let last_offset = if count <= 0 {
        0
    } else {
        ((count - 1) / limit) * limit
    };
    let next = if offset + limit < count {
        JsonValue::String(page_url(base, offset + limit, limit))
    } else {
        JsonValue::Null
    };
    let prev = if offset > 0 {
        JsonValue::String(page_url(base, (offset - limit).max(0), limit))
    } else {
        JsonValue::Null
    };
    json!({
        "self": page_url(base, offset, limit),
        "first": page_url(base, 0, limit),
        "last": page_url(base, last_offset, limit),
        "next": next,
        "prev": prev,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let page = Page::from_query(&params(&[])).unwrap();
        assert_eq!(page, Page { offset: 0, limit: DEFAULT_LIMIT });
    }

    #[test]
    fn test_parsing_and_validation() {
        let page =
            Page::from_query(&params(&[("page[offset]", "20"), ("page[limit]", "10")])).unwrap();
        assert_eq!(page, Page { offset: 20, limit: 10 });
        assert!(Page::from_query(&params(&[("page[offset]", "-1")])).is_err());
        assert!(Page::from_query(&params(&[("page[limit]", "0")])).is_err());
        assert!(Page::from_query(&params(&[("page[limit]", "99999")])).is_err());
        assert!(Page::from_query(&params(&[("page[limit]", "x")])).is_err());
    }

    #[test]
    fn test_links_middle_page() {
        let result = links("/api/v1/search/a", Page { offset: 10, limit: 10 }, 35);
        assert_eq!(
            result["self"],
            "/api/v1/search/a?page[offset]=10&page[limit]=10"
        );
        assert_eq!(
            result["next"],
            "/api/v1/search/a?page[offset]=20&page[limit]=10"
        );
        assert_eq!(
            result["prev"],
            "/api/v1/search/a?page[offset]=0&page[limit]=10"
        );
        assert_eq!(
            result["last"],
            "/api/v1/search/a?page[offset]=30&page[limit]=10"
        );
    }

    #[test]
    fn test_links_boundaries() {
        let first = links("/x", Page { offset: 0, limit: 10 }, 5);
        assert_eq!(first["next"], JsonValue::Null);
        assert_eq!(first["prev"], JsonValue::Null);
        assert_eq!(first["last"], "/x?page[offset]=0&page[limit]=10");

        let empty = links("/x", Page { offset: 0, limit: 10 }, 0);
        assert_eq!(empty["next"], JsonValue::Null);
        assert_eq!(empty["last"], "/x?page[offset]=0&page[limit]=10");
    }
}
