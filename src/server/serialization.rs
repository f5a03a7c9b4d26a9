// Content negotiation: per-structure-family media type registries and the
// encoders behind them.

use bytes::Bytes;
use serde_json::Value as JsonValue;
use std::collections::HashMap;

use crate::errors::{Result, TreeError};
use crate::structures::StructureFamily;

pub const JSON: &str = "application/json";
pub const MSGPACK: &str = "application/x-msgpack";
pub const OCTET_STREAM: &str = "application/octet-stream";
pub const CSV: &str = "text/csv";

/// What a handler hands to the encoder.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Structured documents: metadata, search pages.
    Document(JsonValue),
    /// Table rows as JSON objects.
    Rows(Vec<JsonValue>),
    /// Raw array bytes.
    Binary(Bytes),
}

/// Media types supported per structure family, in server preference
/// order. The first entry is the default for `*/*`.
pub struct SerializationRegistry {
    by_family: HashMap<StructureFamily, Vec<String>>,
    document_types: Vec<String>,
}

impl Default for SerializationRegistry {
    fn default() -> Self {
        let mut by_family = HashMap::new();
        for family in [
            StructureFamily::Array,
            StructureFamily::Sparse,
        ] {
            by_family.insert(
                family,
                vec![OCTET_STREAM.to_string(), JSON.to_string()],
            );
        }
        by_family.insert(
            StructureFamily::Table,
            vec![JSON.to_string(), MSGPACK.to_string(), CSV.to_string()],
        );
        for family in [
            StructureFamily::Container,
            StructureFamily::Composite,
            StructureFamily::Awkward,
        ] {
            by_family.insert(family, vec![JSON.to_string(), MSGPACK.to_string()]);
        }
        Self {
            by_family,
            document_types: vec![JSON.to_string(), MSGPACK.to_string()],
        }
    }
}

impl SerializationRegistry {
    pub fn supported(&self, family: StructureFamily) -> &[String] {
        self.by_family
            .get(&family)
            .map(|types| types.as_slice())
            .unwrap_or(&[])
    }

    pub fn document_types(&self) -> &[String] {
        &self.document_types
    }
}

/// One parsed entry of an Accept header.
#[derive(Debug, PartialEq)]
struct AcceptEntry {
    media_type: String,
    quality: f64,
    order: usize,
}

fn parse_accept(header: &str) -> Vec<AcceptEntry> {
    let mut entries: Vec<AcceptEntry> = header
        .split(',')
        .enumerate()
        .filter_map(|(order, item)| {
            let parsed: mime::Mime = item.trim().parse().ok()?;
            let quality = parsed
                .get_param("q")
                .and_then(|value| value.as_str().parse().ok())
                .unwrap_or(1.0);
            Some(AcceptEntry {
                media_type: format!("{}/{}", parsed.type_(), parsed.subtype()),
                quality,
                order,
            })
        })
        .collect();
    entries.sort_by(|a, b| {
        b.quality
            .partial_cmp(&a.quality)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.order.cmp(&b.order))
    });
    entries
}

fn accept_matches(pattern: &str, media_type: &str) -> bool {
    if pattern == "*/*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        return media_type
            .split('/')
            .next()
            .is_some_and(|main| main == prefix);
    }
    pattern == media_type
}

/// Pick the best supported media type for the client's Accept header.
/// An absent header means "anything". Returns 406 with the supported list
/// when nothing matches.
pub fn negotiate(accept: Option<&str>, supported: &[String]) -> Result<String> {
    if supported.is_empty() {
        return Err(TreeError::NotAcceptable(vec![]));
    }
    let Some(accept) = accept else {
        return Ok(supported[0].clone());
    };
    for entry in parse_accept(accept) {
        if entry.quality <= 0.0 {
            continue;
        }
        for candidate in supported {
            if accept_matches(&entry.media_type, candidate) {
                return Ok(candidate.clone());
            }
        }
    }
    Err(TreeError::NotAcceptable(supported.to_vec()))
}

fn rows_to_csv(rows: &[JsonValue]) -> Result<Bytes> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        if let Some(object) = row.as_object() {
            for key in object.keys() {
                if !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
        }
    }
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&columns).map_err(anyhow::Error::from)?;
    for row in rows {
        let record: Vec<String> = columns
            .iter()
            .map(|column| match row.get(column) {
                Some(JsonValue::String(s)) => s.clone(),
                Some(JsonValue::Null) | None => String::new(),
                Some(other) => other.to_string(),
            })
            .collect();
        writer.write_record(&record).map_err(anyhow::Error::from)?;
    }
    let inner = writer.into_inner().map_err(anyhow::Error::from)?;
    Ok(Bytes::from(inner))
}

/// Encode a payload as the (already negotiated) media type.
pub fn encode(media_type: &str, payload: &Payload) -> Result<Bytes> {
    match (media_type, payload) {
        (JSON, Payload::Document(document)) => Ok(Bytes::from(
            serde_json::to_vec(document).map_err(anyhow::Error::from)?,
        )),
        (JSON, Payload::Rows(rows)) => Ok(Bytes::from(
            serde_json::to_vec(rows).map_err(anyhow::Error::from)?,
        )),
        (MSGPACK, Payload::Document(document)) => Ok(Bytes::from(
            rmp_serde::to_vec_named(document).map_err(anyhow::Error::from)?,
        )),
        (MSGPACK, Payload::Rows(rows)) => Ok(Bytes::from(
            rmp_serde::to_vec_named(rows).map_err(anyhow::Error::from)?,
        )),
        (CSV, Payload::Rows(rows)) => rows_to_csv(rows),
        (OCTET_STREAM, Payload::Binary(bytes)) => Ok(bytes.clone()),
        // Raw bytes can also travel as a JSON array of numbers, mostly for
        // debugging convenience.
        (JSON, Payload::Binary(bytes)) => Ok(Bytes::from(
            serde_json::to_vec(&bytes.to_vec()).map_err(anyhow::Error::from)?,
        )),
        (other, _) => Err(TreeError::UnsupportedMediaType(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn supported() -> Vec<String> {
        vec![JSON.to_string(), MSGPACK.to_string(), CSV.to_string()]
    }

    #[test]
    fn test_negotiate_prefers_client_order_and_quality() {
        let accept = "text/csv;q=0.5, application/x-msgpack";
        assert_eq!(
            negotiate(Some(accept), &supported()).unwrap(),
            MSGPACK.to_string()
        );
        assert_eq!(
            negotiate(Some("text/csv, application/json"), &supported()).unwrap(),
            CSV.to_string()
        );
    }

    #[test]
    fn test_negotiate_wildcards_and_default() {
        assert_eq!(negotiate(None, &supported()).unwrap(), JSON.to_string());
        assert_eq!(
            negotiate(Some("*/*"), &supported()).unwrap(),
            JSON.to_string()
        );
        assert_eq!(
            negotiate(Some("text/*"), &supported()).unwrap(),
            CSV.to_string()
        );
    }

    #[test]
    fn test_negotiate_failure_lists_supported_types() {
        let err = negotiate(Some("image/png"), &supported()).unwrap_err();
        match err {
            TreeError::NotAcceptable(types) => {
                assert_eq!(types, supported());
            }
            other => panic!("expected NotAcceptable, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_quality_is_unacceptable() {
        assert!(negotiate(Some("application/json;q=0"), &[JSON.to_string()]).is_err());
    }

    #[test]
    fn test_encode_rows_as_csv() {
        let rows = vec![
            json!({"a": 1, "b": "x"}),
            json!({"a": 2, "b": "y,z"}),
        ];
        let bytes = encode(CSV, &Payload::Rows(rows)).unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.starts_with("a,b\n"));
        assert!(text.contains("2,\"y,z\""));
    }

    #[test]
    fn test_encode_document_round_trips_msgpack() {
        let document = json!({"k": [1, 2, 3]});
        let bytes = encode(MSGPACK, &Payload::Document(document.clone())).unwrap();
        let back: JsonValue = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, document);
    }

    #[test]
    fn test_binary_only_for_octet_stream() {
        let payload = Payload::Binary(Bytes::from_static(&[1, 2]));
        assert!(encode(OCTET_STREAM, &payload).is_ok());
        assert!(encode(CSV, &payload).is_err());
    }

    #[test]
    fn test_registry_defaults() {
        let registry = SerializationRegistry::default();
        assert_eq!(
            registry.supported(StructureFamily::Array)[0],
            OCTET_STREAM
        );
        assert!(registry
            .supported(StructureFamily::Table)
            .contains(&CSV.to_string()));
    }
}
