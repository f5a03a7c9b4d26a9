// The Adapter contract: the polymorphic interface between the tree and
// storage backends.
//
// The structure family determines which interface a node exposes, so the
// adapter is a sealed sum over family-specific traits rather than one wide
// trait full of unimplemented methods. Awkward and sparse map onto the
// array interface; composite maps onto the container interface.

pub mod array;
pub mod container;
pub mod table;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value as JsonValue;
use std::ops::Range;
use std::sync::Arc;

use crate::errors::Result;
use crate::queries::Query;
use crate::structures::{Spec, Structure, StructureFamily};

pub use array::BlocksAdapter;
pub use container::MapAdapter;
pub use table::{CsvTableAdapter, JsonLinesTableAdapter};

/// One storage location produced by storage initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub data_uri: String,
    pub is_directory: bool,
}

/// Attributes shared by every adapter regardless of family.
pub trait AdapterCore: Send + Sync {
    fn structure_family(&self) -> StructureFamily;
    fn metadata(&self) -> JsonValue;
    fn structure(&self) -> Structure;
    fn specs(&self) -> Vec<Spec> {
        Vec::new()
    }
}

/// Sort direction paired with a key; direction is 1 or -1.
pub type Sorting = Vec<(String, i8)>;

#[async_trait]
pub trait ContainerAdapter: AdapterCore {
    async fn len(&self) -> Result<u64>;

    async fn keys_range(&self, offset: usize, limit: usize) -> Result<Vec<String>>;

    async fn items_range(&self, offset: usize, limit: usize)
        -> Result<Vec<(String, Adapter)>>;

    /// Fetch one direct child by key segment.
    async fn get(&self, segment: &str) -> Result<Option<Adapter>>;

    /// Walk a path of segments down from this container.
    async fn lookup(&self, segments: &[String]) -> Result<Option<Adapter>> {
        let mut current = Adapter::Container(self.as_container_arc());
        for segment in segments {
            let container = match &current {
                Adapter::Container(c) => Arc::clone(c),
                _ => return Ok(None),
            };
            match container.get(segment).await? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Narrow the view; successive searches conjoin.
    fn search(&self, query: Query) -> Result<Adapter>;

    /// Reorder the view.
    fn sort(&self, sorting: Sorting) -> Result<Adapter>;

    /// Clone-as-Arc escape hatch used by the default `lookup`.
    fn as_container_arc(&self) -> Arc<dyn ContainerAdapter>;
}

#[async_trait]
pub trait ArrayAdapter: AdapterCore {
    /// Read the full array (optionally sliced) as C-order raw bytes.
    async fn read(&self, slice: Option<&[Range<u64>]>) -> Result<Bytes>;

    /// Read one chunk by per-dimension block index.
    async fn read_block(&self, block: &[usize], slice: Option<&[Range<u64>]>)
        -> Result<Bytes>;

    async fn write(&self, data: Bytes) -> Result<()>;

    async fn write_block(&self, block: &[usize], data: Bytes) -> Result<()>;
}

#[async_trait]
pub trait TableAdapter: AdapterCore {
    /// Read all partitions, optionally restricted to named columns. Rows
    /// are JSON objects keyed by column.
    async fn read(&self, columns: Option<&[String]>) -> Result<Vec<JsonValue>>;

    async fn read_partition(
        &self,
        partition: usize,
        columns: Option<&[String]>,
    ) -> Result<Vec<JsonValue>>;

    async fn write(&self, rows: &[JsonValue]) -> Result<()>;

    async fn write_partition(&self, partition: usize, rows: &[JsonValue]) -> Result<()>;
}

/// An in-process adapter, dispatched by structure family.
#[derive(Clone)]
pub enum Adapter {
    Container(Arc<dyn ContainerAdapter>),
    Array(Arc<dyn ArrayAdapter>),
    Table(Arc<dyn TableAdapter>),
}

impl Adapter {
    pub fn structure_family(&self) -> StructureFamily {
        match self {
            Adapter::Container(a) => a.structure_family(),
            Adapter::Array(a) => a.structure_family(),
            Adapter::Table(a) => a.structure_family(),
        }
    }

    pub fn metadata(&self) -> JsonValue {
        match self {
            Adapter::Container(a) => a.metadata(),
            Adapter::Array(a) => a.metadata(),
            Adapter::Table(a) => a.metadata(),
        }
    }

    pub fn structure(&self) -> Structure {
        match self {
            Adapter::Container(a) => a.structure(),
            Adapter::Array(a) => a.structure(),
            Adapter::Table(a) => a.structure(),
        }
    }

    pub fn specs(&self) -> Vec<Spec> {
        match self {
            Adapter::Container(a) => a.specs(),
            Adapter::Array(a) => a.specs(),
            Adapter::Table(a) => a.specs(),
        }
    }

    pub fn as_container(&self) -> Option<&Arc<dyn ContainerAdapter>> {
        match self {
            Adapter::Container(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Arc<dyn ArrayAdapter>> {
        match self {
            Adapter::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&Arc<dyn TableAdapter>> {
        match self {
            Adapter::Table(a) => Some(a),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<Adapter {}>", self.structure_family())
    }
}
