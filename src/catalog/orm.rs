// Row types for the catalog tables and their decoding from dynamic rows.
//
// The catalog speaks to SQLite and PostgreSQL through the sqlx Any driver,
// so all values cross the boundary as i64 / f64 / String; JSON columns are
// (de)serialized here.

use serde_json::Value as JsonValue;
use sqlx::any::AnyRow;
use sqlx::Row;

use crate::errors::{Result, TreeError};
use crate::structures::{Spec, Structure, StructureFamily};

pub const MANAGEMENT_EXTERNAL: &str = "external";
pub const MANAGEMENT_WRITABLE: &str = "writable";

#[derive(Debug, Clone, PartialEq)]
pub struct NodeRow {
    pub id: i64,
    pub key: String,
    pub ancestors: Vec<String>,
    pub structure_family: StructureFamily,
    pub metadata: JsonValue,
    pub specs: Vec<Spec>,
    pub access_blob: Option<JsonValue>,
    pub time_created: i64,
    pub time_updated: i64,
}

impl NodeRow {
    /// The synthetic root of the tree. Its state comes from server
    /// configuration, not from the database.
    pub fn root(metadata: JsonValue, specs: Vec<Spec>) -> Self {
        Self {
            id: 0,
            key: String::new(),
            ancestors: Vec::new(),
            structure_family: StructureFamily::Container,
            metadata,
            specs,
            access_blob: None,
            time_created: 0,
            time_updated: 0,
        }
    }

    pub fn is_root(&self) -> bool {
        self.key.is_empty() && self.ancestors.is_empty()
    }

    /// Path segments from the root down to (and including) this node.
    pub fn segments(&self) -> Vec<String> {
        if self.is_root() {
            return Vec::new();
        }
        let mut segments = self.ancestors.clone();
        segments.push(self.key.clone());
        segments
    }

    pub fn path(&self) -> String {
        format!("/{}", self.segments().join("/"))
    }

    pub fn from_row(row: &AnyRow) -> Result<Self> {
        let ancestors: String = row.try_get("ancestors")?;
        let metadata: String = row.try_get("metadata")?;
        let specs: String = row.try_get("specs")?;
        let access_blob: Option<String> = row.try_get("access_blob")?;
        let family: String = row.try_get("structure_family")?;
        Ok(Self {
            id: row.try_get("id")?,
            key: row.try_get("key")?,
            ancestors: decode_json_column(&ancestors, "ancestors")?,
            structure_family: StructureFamily::parse(&family)?,
            metadata: decode_json_column(&metadata, "metadata")?,
            specs: decode_json_column(&specs, "specs")?,
            access_blob: access_blob
                .map(|blob| decode_json_column(&blob, "access_blob"))
                .transpose()?,
            time_created: row.try_get("time_created")?,
            time_updated: row.try_get("time_updated")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DataSourceRow {
    pub id: i64,
    pub node_id: i64,
    pub mimetype: String,
    pub structure: Structure,
    pub parameters: JsonValue,
    pub management: String,
    pub assets: Vec<AssetRow>,
}

impl DataSourceRow {
    pub fn is_external(&self) -> bool {
        self.management == MANAGEMENT_EXTERNAL
    }

    pub fn from_row(row: &AnyRow) -> Result<Self> {
        let structure: Option<String> = row.try_get("structure")?;
        let parameters: String = row.try_get("parameters")?;
        Ok(Self {
            id: row.try_get("id")?,
            node_id: row.try_get("node_id")?,
            mimetype: row.try_get("mimetype")?,
            structure: match structure {
                Some(text) => decode_json_column(&text, "structure")?,
                None => Structure::Node,
            },
            parameters: decode_json_column(&parameters, "parameters")?,
            management: row.try_get("management")?,
            assets: Vec::new(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct AssetRow {
    pub id: i64,
    pub data_source_id: i64,
    pub data_uri: String,
    pub is_directory: bool,
}

impl AssetRow {
    pub fn from_row(row: &AnyRow) -> Result<Self> {
        let is_directory: i64 = row.try_get("is_directory")?;
        Ok(Self {
            id: row.try_get("id")?,
            data_source_id: row.try_get("data_source_id")?,
            data_uri: row.try_get("data_uri")?,
            is_directory: is_directory != 0,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RevisionRow {
    pub id: i64,
    pub node_id: i64,
    pub revision_number: i64,
    pub metadata: JsonValue,
    pub specs: Vec<Spec>,
    pub time_created: i64,
}

impl RevisionRow {
    pub fn from_row(row: &AnyRow) -> Result<Self> {
        let metadata: String = row.try_get("metadata")?;
        let specs: String = row.try_get("specs")?;
        Ok(Self {
            id: row.try_get("id")?,
            node_id: row.try_get("node_id")?,
            revision_number: row.try_get("revision_number")?,
            metadata: decode_json_column(&metadata, "metadata")?,
            specs: decode_json_column(&specs, "specs")?,
            time_created: row.try_get("time_created")?,
        })
    }
}

fn decode_json_column<T: serde::de::DeserializeOwned>(text: &str, column: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| {
        TreeError::Internal(anyhow::anyhow!("corrupt {column} column in catalog: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_root_segments_and_path() {
        let root = NodeRow::root(json!({}), vec![]);
        assert!(root.is_root());
        assert!(root.segments().is_empty());
        assert_eq!(root.path(), "/");
    }

    #[test]
    fn test_segments_include_key() {
        let node = NodeRow {
            id: 7,
            key: "c".into(),
            ancestors: vec!["a".into(), "b".into()],
            structure_family: StructureFamily::Array,
            metadata: json!({}),
            specs: vec![],
            access_blob: None,
            time_created: 0,
            time_updated: 0,
        };
        assert_eq!(node.segments(), vec!["a", "b", "c"]);
        assert_eq!(node.path(), "/a/b/c");
    }
}
