// MIME-type dispatch for adapter construction.
//
// The registry maps a mimetype to a lazily-realized constructor. Builders
// run at most once per key, guarded by a per-key initialization cell, so
// registering an expensive constructor costs nothing until the first
// dataset of that type is actually served.

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde_json::Value as JsonValue;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use url::Url;

use crate::adapters::{
    array::BLOCKS_MIMETYPE,
    table::{CSV_MIMETYPE, JSONLINES_MIMETYPE},
    Adapter, Asset, BlocksAdapter, CsvTableAdapter, JsonLinesTableAdapter,
};
use crate::errors::{Result, TreeError};
use crate::structures::{Spec, Structure, StructureFamily};

/// Everything an adapter constructor receives.
#[derive(Debug, Clone)]
pub struct AdapterInit {
    pub paths: Vec<PathBuf>,
    pub structure: Structure,
    pub metadata: JsonValue,
    pub specs: Vec<Spec>,
    pub parameters: JsonValue,
    pub writable: bool,
}

pub type AdapterFactory = Arc<dyn Fn(AdapterInit) -> Result<Adapter> + Send + Sync>;
pub type FactoryBuilder = Box<dyn Fn() -> AdapterFactory + Send + Sync>;
pub type InitStorageFn = Arc<dyn Fn(&Path, &Structure) -> Result<Vec<Asset>> + Send + Sync>;

struct LazyFactory {
    builder: FactoryBuilder,
    cell: OnceCell<AdapterFactory>,
}

/// Registry of adapter constructors and storage initializers by mimetype.
/// Populated at startup; read-mostly afterwards.
pub struct AdapterRegistry {
    factories: DashMap<String, Arc<LazyFactory>>,
    init_storage: DashMap<String, InitStorageFn>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl AdapterRegistry {
    pub fn empty() -> Self {
        Self {
            factories: DashMap::new(),
            init_storage: DashMap::new(),
        }
    }

    /// The built-in adapters: chunked binary arrays, JSON-lines tables,
    /// and CSV tables.
    pub fn with_defaults() -> Self {
        let registry = Self::empty();
        registry.register(BLOCKS_MIMETYPE, || {
            Arc::new(|init: AdapterInit| {
                let directory = single_path(&init.paths)?;
                let structure = init
                    .structure
                    .as_array()
                    .cloned()
                    .ok_or_else(|| {
                        TreeError::Unprocessable("array structure required".into())
                    })?;
                Ok(Adapter::Array(Arc::new(BlocksAdapter::new(
                    directory,
                    structure,
                    init.metadata,
                    init.specs,
                    init.writable,
                )?)))
            })
        });
        registry.register(JSONLINES_MIMETYPE, || {
            Arc::new(|init: AdapterInit| {
                let directory = single_path(&init.paths)?;
                let structure = init
                    .structure
                    .as_table()
                    .cloned()
                    .ok_or_else(|| {
                        TreeError::Unprocessable("table structure required".into())
                    })?;
                Ok(Adapter::Table(Arc::new(JsonLinesTableAdapter::new(
                    directory,
                    structure,
                    init.metadata,
                    init.specs,
                    init.writable,
                )?)))
            })
        });
        registry.register(CSV_MIMETYPE, || {
            Arc::new(|init: AdapterInit| {
                let path = single_path(&init.paths)?;
                let structure = init
                    .structure
                    .as_table()
                    .cloned()
                    .ok_or_else(|| {
                        TreeError::Unprocessable("table structure required".into())
                    })?;
                Ok(Adapter::Table(Arc::new(CsvTableAdapter::new(
                    path,
                    structure,
                    init.metadata,
                    init.specs,
                    init.writable,
                )?)))
            })
        });

        registry.register_init_storage(BLOCKS_MIMETYPE, |path, structure| {
            let structure = structure.as_array().ok_or_else(|| {
                TreeError::Unprocessable("array structure required".into())
            })?;
            BlocksAdapter::init_storage(path, structure)
        });
        registry.register_init_storage(JSONLINES_MIMETYPE, |path, structure| {
            let structure = structure.as_table().ok_or_else(|| {
                TreeError::Unprocessable("table structure required".into())
            })?;
            JsonLinesTableAdapter::init_storage(path, structure)
        });
        registry.register_init_storage(CSV_MIMETYPE, |path, structure| {
            let structure = structure.as_table().ok_or_else(|| {
                TreeError::Unprocessable("table structure required".into())
            })?;
            CsvTableAdapter::init_storage(&path.join("data.csv"), structure)
        });
        registry
    }

    pub fn register(
        &self,
        mimetype: impl Into<String>,
        builder: impl Fn() -> AdapterFactory + Send + Sync + 'static,
    ) {
        self.factories.insert(
            mimetype.into(),
            Arc::new(LazyFactory {
                builder: Box::new(builder),
                cell: OnceCell::new(),
            }),
        );
    }

    pub fn register_init_storage(
        &self,
        mimetype: impl Into<String>,
        f: impl Fn(&Path, &Structure) -> Result<Vec<Asset>> + Send + Sync + 'static,
    ) {
        self.init_storage.insert(mimetype.into(), Arc::new(f));
    }

    /// Realize (memoized) and return the constructor for a mimetype.
    pub fn get(&self, mimetype: &str) -> Option<AdapterFactory> {
        let entry = self.factories.get(mimetype)?;
        let lazy = Arc::clone(entry.value());
        drop(entry);
        Some(lazy.cell.get_or_init(|| (lazy.builder)()).clone())
    }

    pub fn init_storage_for(&self, mimetype: &str) -> Option<InitStorageFn> {
        self.init_storage.get(mimetype).map(|f| f.value().clone())
    }

    /// Mimetype used when the server itself creates storage for a family.
    pub fn default_creation_mimetype(family: StructureFamily) -> Option<&'static str> {
        match family {
            StructureFamily::Array | StructureFamily::Sparse => Some(BLOCKS_MIMETYPE),
            StructureFamily::Table => Some(JSONLINES_MIMETYPE),
            _ => None,
        }
    }
}

fn single_path(paths: &[PathBuf]) -> Result<PathBuf> {
    match paths {
        [one] => Ok(one.clone()),
        other => Err(TreeError::Unprocessable(format!(
            "expected exactly one asset path, got {}",
            other.len()
        ))),
    }
}

/// Resolve a `file://` data URI to a local path, refusing anything that
/// could escape via relative components.
pub fn safe_path(data_uri: &str) -> Result<PathBuf> {
    let url = Url::parse(data_uri)
        .map_err(|e| TreeError::Unprocessable(format!("bad data URI {data_uri:?}: {e}")))?;
    if url.scheme() != "file" {
        return Err(TreeError::Unprocessable(format!(
            "only file:// data URIs are supported, not {:?}",
            url.scheme()
        )));
    }
    let path = url.to_file_path().map_err(|_| {
        TreeError::Unprocessable(format!("data URI {data_uri:?} has no local path"))
    })?;
    for component in path.components() {
        if matches!(component, Component::ParentDir) {
            return Err(TreeError::Unprocessable(format!(
                "data URI {data_uri:?} contains a parent-directory component"
            )));
        }
    }
    Ok(path)
}

/// True when `path` lies inside one of the given storage roots. Used to
/// refuse serving assets outside the configured readable storage.
pub fn within_any_root(path: &Path, roots: &[PathBuf]) -> bool {
    roots.iter().any(|root| path.starts_with(root))
}

// quote_plus-style escaping for path segments placed in storage paths.
const SEGMENT_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'/')
    .add(b'\\')
    .add(b'%')
    .add(b'?')
    .add(b'#')
    .add(b'.')
    .add(b':');

pub fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT_ESCAPE).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structures::{ArrayStructure, DataType};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[test]
    fn test_builder_runs_once_per_key() {
        static BUILDS: AtomicUsize = AtomicUsize::new(0);
        let registry = AdapterRegistry::empty();
        registry.register("x/y", || {
            BUILDS.fetch_add(1, Ordering::SeqCst);
            Arc::new(|_| Err(TreeError::Unprocessable("unused".into())))
        });
        assert!(registry.get("x/y").is_some());
        assert!(registry.get("x/y").is_some());
        assert_eq!(BUILDS.load(Ordering::SeqCst), 1);
        assert!(registry.get("missing/type").is_none());
    }

    #[tokio::test]
    async fn test_default_registry_constructs_blocks_adapter() {
        let dir = TempDir::new().unwrap();
        let structure = ArrayStructure::unchunked(vec![4], DataType::Uint8);
        let registry = AdapterRegistry::with_defaults();
        let init = registry.init_storage_for(BLOCKS_MIMETYPE).unwrap();
        let assets = init(dir.path(), &Structure::Array(structure.clone())).unwrap();
        assert_eq!(assets.len(), 1);
        assert!(assets[0].is_directory);

        let factory = registry.get(BLOCKS_MIMETYPE).unwrap();
        let adapter = factory(AdapterInit {
            paths: vec![dir.path().to_path_buf()],
            structure: Structure::Array(structure),
            metadata: serde_json::json!({}),
            specs: vec![],
            parameters: serde_json::json!({}),
            writable: true,
        })
        .unwrap();
        assert_eq!(adapter.structure_family(), StructureFamily::Array);
    }

    #[test]
    fn test_safe_path_rejects_escapes() {
        assert!(safe_path("file://localhost/data/a/b").is_ok());
        assert!(safe_path("https://example.com/x").is_err());
        assert!(safe_path("file://localhost/data/%2e%2e/secret").is_err());
    }

    #[test]
    fn test_within_any_root() {
        let roots = vec![PathBuf::from("/data"), PathBuf::from("/mnt/share")];
        assert!(within_any_root(Path::new("/data/x/y"), &roots));
        assert!(!within_any_root(Path::new("/etc/passwd"), &roots));
    }

    #[test]
    fn test_encode_segment() {
        assert_eq!(encode_segment("plain"), "plain");
        assert_eq!(encode_segment("a/b"), "a%2Fb");
        assert_eq!(encode_segment("has space"), "has%20space");
    }
}
