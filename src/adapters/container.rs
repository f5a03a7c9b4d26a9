// In-memory container adapter.
//
// Serves three roles: the delegation target when a lookup walks *inside* a
// file-backed dataset, the backing for directory-style datasets small
// enough to hold in memory, and the workhorse of the test suite. Search
// and sort return narrowed views; the underlying children map is shared.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{Adapter, AdapterCore, ContainerAdapter, Sorting};
use crate::errors::Result;
use crate::queries::{matches, metadata_path, Query};
use crate::structures::{Spec, Structure, StructureFamily};

pub struct MapAdapter {
    children: Arc<BTreeMap<String, Adapter>>,
    metadata: JsonValue,
    specs: Vec<Spec>,
    queries: Vec<Query>,
    sorting: Sorting,
}

impl MapAdapter {
    pub fn new(children: BTreeMap<String, Adapter>, metadata: JsonValue) -> Self {
        Self {
            children: Arc::new(children),
            metadata,
            specs: Vec::new(),
            queries: Vec::new(),
            sorting: Vec::new(),
        }
    }

    pub fn with_specs(mut self, specs: Vec<Spec>) -> Self {
        self.specs = specs;
        self
    }

    fn new_view(&self, queries: Vec<Query>, sorting: Sorting) -> Self {
        Self {
            children: Arc::clone(&self.children),
            metadata: self.metadata.clone(),
            specs: self.specs.clone(),
            queries,
            sorting,
        }
    }

    /// Children surviving the accumulated queries, in the current order.
    fn visible(&self) -> Vec<(&String, &Adapter)> {
        let mut items: Vec<(&String, &Adapter)> = self
            .children
            .iter()
            .filter(|(key, child)| {
                self.queries.iter().all(|q| {
                    matches(q, key, child.structure_family(), &child.metadata(), None)
                })
            })
            .collect();
        if !self.sorting.is_empty() {
            let sorting = self.sorting.clone();
            items.sort_by(|(ak, av), (bk, bv)| {
                compare_items(&sorting, ak, av, bk, bv)
            });
        }
        items
    }
}

fn compare_values(a: Option<&JsonValue>, b: Option<&JsonValue>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        // Missing values sort last, like SQL NULLs.
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => {
            if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            } else if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
                x.cmp(y)
            } else {
                Ordering::Equal
            }
        }
    }
}

fn compare_items(
    sorting: &Sorting,
    a_key: &str,
    a: &Adapter,
    b_key: &str,
    b: &Adapter,
) -> Ordering {
    let mut default_direction: i8 = 1;
    for (key, direction) in sorting {
        let ordering = match key.as_str() {
            "" => {
                default_direction = *direction;
                continue;
            }
            "id" => a_key.cmp(b_key),
            path => {
                let path = path.strip_prefix("metadata.").unwrap_or(path);
                let a_md = a.metadata();
                let b_md = b.metadata();
                compare_values(metadata_path(&a_md, path), metadata_path(&b_md, path))
            }
        };
        let ordering = if *direction == -1 {
            ordering.reverse()
        } else {
            ordering
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    // Deterministic tiebreaker on the key.
    let tiebreak = a_key.cmp(b_key);
    if default_direction == -1 {
        tiebreak.reverse()
    } else {
        tiebreak
    }
}

impl AdapterCore for MapAdapter {
    fn structure_family(&self) -> StructureFamily {
        StructureFamily::Container
    }

    fn metadata(&self) -> JsonValue {
        self.metadata.clone()
    }

    fn structure(&self) -> Structure {
        Structure::Node
    }

    fn specs(&self) -> Vec<Spec> {
        self.specs.clone()
    }
}

#[async_trait]
impl ContainerAdapter for MapAdapter {
    async fn len(&self) -> Result<u64> {
        Ok(self.visible().len() as u64)
    }

    async fn keys_range(&self, offset: usize, limit: usize) -> Result<Vec<String>> {
        Ok(self
            .visible()
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn items_range(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(String, Adapter)>> {
        Ok(self
            .visible()
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(key, child)| (key.clone(), child.clone()))
            .collect())
    }

    async fn get(&self, segment: &str) -> Result<Option<Adapter>> {
        Ok(self.children.get(segment).cloned())
    }

    fn search(&self, query: Query) -> Result<Adapter> {
        let mut queries = self.queries.clone();
        queries.push(query);
        Ok(Adapter::Container(Arc::new(
            self.new_view(queries, self.sorting.clone()),
        )))
    }

    fn sort(&self, sorting: Sorting) -> Result<Adapter> {
        Ok(Adapter::Container(Arc::new(
            self.new_view(self.queries.clone(), sorting),
        )))
    }

    fn as_container_arc(&self) -> Arc<dyn ContainerAdapter> {
        Arc::new(self.new_view(self.queries.clone(), self.sorting.clone()))
    }
}
