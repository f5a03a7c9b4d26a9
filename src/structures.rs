// Canonical descriptions of array, table, and container shape.
//
// A Structure travels with a DataSource: it tells the server (and the
// client) how the underlying storage is laid out without requiring the
// format-specific adapter to be constructed first.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::TreeError;

/// The family of a node, which determines the adapter interface it exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructureFamily {
    Container,
    Array,
    Table,
    Awkward,
    Sparse,
    Composite,
}

impl StructureFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            StructureFamily::Container => "container",
            StructureFamily::Array => "array",
            StructureFamily::Table => "table",
            StructureFamily::Awkward => "awkward",
            StructureFamily::Sparse => "sparse",
            StructureFamily::Composite => "composite",
        }
    }

    pub fn parse(s: &str) -> Result<Self, TreeError> {
        match s {
            "container" => Ok(StructureFamily::Container),
            "array" => Ok(StructureFamily::Array),
            "table" => Ok(StructureFamily::Table),
            "awkward" => Ok(StructureFamily::Awkward),
            "sparse" => Ok(StructureFamily::Sparse),
            "composite" => Ok(StructureFamily::Composite),
            other => Err(TreeError::Unprocessable(format!(
                "unknown structure family {other:?}"
            ))),
        }
    }

    /// Container-like families hold child nodes and no data source.
    /// Composite is treated as container-like for lookup and search.
    pub fn is_container_like(&self) -> bool {
        matches!(self, StructureFamily::Container | StructureFamily::Composite)
    }
}

impl fmt::Display for StructureFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Element type of an array, by size and kind. Mirrors a numpy-style dtype
/// without depending on any array library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
}

impl DataType {
    /// Size in bytes of one element.
    pub fn itemsize(&self) -> usize {
        match self {
            DataType::Int8 | DataType::Uint8 => 1,
            DataType::Int16 | DataType::Uint16 => 2,
            DataType::Int32 | DataType::Uint32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::Uint64 | DataType::Float64 => 8,
        }
    }
}

/// Shape, chunking, and element type of an array.
///
/// `chunks[d]` lists the chunk extents along dimension `d`; their sum must
/// equal `shape[d]`. The number of blocks along `d` is `chunks[d].len()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayStructure {
    pub shape: Vec<u64>,
    pub chunks: Vec<Vec<u64>>,
    pub data_type: DataType,
}

impl ArrayStructure {
    /// A single-chunk structure covering the whole shape.
    pub fn unchunked(shape: Vec<u64>, data_type: DataType) -> Self {
        let chunks = shape.iter().map(|extent| vec![*extent]).collect();
        Self {
            shape,
            chunks,
            data_type,
        }
    }

    pub fn validate(&self) -> Result<(), TreeError> {
        if self.shape.len() != self.chunks.len() {
            return Err(TreeError::Unprocessable(format!(
                "chunks rank {} does not match shape rank {}",
                self.chunks.len(),
                self.shape.len()
            )));
        }
        for (dim, (extent, chunk_extents)) in
            self.shape.iter().zip(self.chunks.iter()).enumerate()
        {
            let total: u64 = chunk_extents.iter().sum();
            if total != *extent {
                return Err(TreeError::Unprocessable(format!(
                    "chunks along dimension {dim} sum to {total}, expected {extent}"
                )));
            }
        }
        Ok(())
    }

    /// Number of blocks along each dimension.
    pub fn block_counts(&self) -> Vec<usize> {
        self.chunks.iter().map(|c| c.len()).collect()
    }

    /// Shape of the block at the given per-dimension index, or None when
    /// the index is out of range in any dimension.
    pub fn block_shape(&self, block: &[usize]) -> Option<Vec<u64>> {
        if block.len() != self.chunks.len() {
            return None;
        }
        let mut shape = Vec::with_capacity(block.len());
        for (index, chunk_extents) in block.iter().zip(self.chunks.iter()) {
            shape.push(*chunk_extents.get(*index)?);
        }
        Some(shape)
    }

    /// Total number of elements in one block.
    pub fn block_len(&self, block: &[usize]) -> Option<u64> {
        self.block_shape(block).map(|s| s.iter().product())
    }
}

/// Column names and partition count of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableStructure {
    pub columns: Vec<String>,
    pub npartitions: usize,
}

impl TableStructure {
    pub fn validate(&self) -> Result<(), TreeError> {
        if self.columns.is_empty() {
            return Err(TreeError::Unprocessable(
                "table must have at least one column".into(),
            ));
        }
        if self.npartitions == 0 {
            return Err(TreeError::Unprocessable(
                "table must have at least one partition".into(),
            ));
        }
        Ok(())
    }
}

/// Family-specific structure descriptor carried by a DataSource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum Structure {
    Array(ArrayStructure),
    Table(TableStructure),
    /// Container-like and deferred families carry no descriptor.
    Node,
}

impl Structure {
    pub fn as_array(&self) -> Option<&ArrayStructure> {
        match self {
            Structure::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&TableStructure> {
        match self {
            Structure::Table(t) => Some(t),
            _ => None,
        }
    }
}

/// A named conformance tag, e.g. `{"name": "xdi", "version": "1.0"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unchunked_structure_round_trip() {
        let s = ArrayStructure::unchunked(vec![4, 6], DataType::Float64);
        assert!(s.validate().is_ok());
        assert_eq!(s.block_counts(), vec![1, 1]);
        assert_eq!(s.block_shape(&[0, 0]), Some(vec![4, 6]));
        assert_eq!(s.block_shape(&[1, 0]), None);
    }

    #[test]
    fn test_chunked_block_shapes() {
        let s = ArrayStructure {
            shape: vec![4, 6],
            chunks: vec![vec![2, 2], vec![3, 3]],
            data_type: DataType::Int32,
        };
        assert!(s.validate().is_ok());
        assert_eq!(s.block_counts(), vec![2, 2]);
        assert_eq!(s.block_shape(&[1, 1]), Some(vec![2, 3]));
        assert_eq!(s.block_len(&[0, 0]), Some(6));
        // Out of range in the second dimension.
        assert_eq!(s.block_shape(&[0, 2]), None);
    }

    #[test]
    fn test_invalid_chunks_rejected() {
        let s = ArrayStructure {
            shape: vec![5],
            chunks: vec![vec![2, 2]],
            data_type: DataType::Uint8,
        };
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_structure_family_parse() {
        assert_eq!(
            StructureFamily::parse("array").unwrap(),
            StructureFamily::Array
        );
        assert!(StructureFamily::parse("arr").is_err());
        assert!(StructureFamily::Composite.is_container_like());
        assert!(!StructureFamily::Table.is_container_like());
    }

    #[test]
    fn test_structure_serde_tagging() {
        let s = Structure::Array(ArrayStructure::unchunked(vec![3], DataType::Int64));
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["family"], "array");
        let back: Structure = serde_json::from_value(json).unwrap();
        assert_eq!(back, s);
    }
}
