// The catalog store: a node tree persisted in SQLite or PostgreSQL.
//
// CatalogNode is a *view* of one node plus accumulated search conditions
// and sorting; search() and sort() return new views. Conditions on
// database-backed containers are pushed down to SQL; conditions on
// file-backed nodes are replayed through the constructed adapter.

pub mod migrations;
pub mod orm;
pub mod translate;

use serde_json::Value as JsonValue;
use sqlx::any::AnyRow;
use sqlx::{AnyPool, Row};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::adapters::{Adapter, Asset, ContainerAdapter, Sorting};
use crate::dispatch::{encode_segment, safe_path, within_any_root, AdapterInit, AdapterRegistry};
use crate::errors::{Result, TreeError};
use crate::queries::Query;
use crate::structures::{Spec, Structure, StructureFamily};

use orm::{AssetRow, DataSourceRow, NodeRow, RevisionRow, MANAGEMENT_EXTERNAL};
use translate::{
    append_conditions, execute, fetch_all, fetch_optional, order_by_clause, BindValue, Dialect,
    SqlBuilder,
};

/// Columns of the nodes table, with JSON columns cast to text so the
/// dynamic driver can decode them uniformly on both backends.
fn node_columns(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Sqlite => {
            "id, \"key\", ancestors, structure_family, metadata, specs, \
             access_blob, time_created, time_updated"
        }
        Dialect::Postgres => {
            "id, \"key\", ancestors::text AS ancestors, structure_family, \
             metadata::text AS metadata, specs::text AS specs, \
             access_blob::text AS access_blob, time_created, time_updated"
        }
    }
}

fn data_source_columns(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Sqlite => "id, node_id, mimetype, structure, parameters, management",
        Dialect::Postgres => {
            "id, node_id, mimetype, structure::text AS structure, \
             parameters::text AS parameters, management"
        }
    }
}

fn revision_columns(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Sqlite => "id, node_id, revision_number, metadata, specs, time_created",
        Dialect::Postgres => {
            "id, node_id, revision_number, metadata::text AS metadata, \
             specs::text AS specs, time_created"
        }
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Shared handles for every catalog view: the pool, the storage roots, and
/// the adapter dispatch registry.
pub struct CatalogContext {
    pub pool: AnyPool,
    pub dialect: Dialect,
    pub writable_storage: Option<PathBuf>,
    pub readable_storage: Vec<PathBuf>,
    pub registry: Arc<AdapterRegistry>,
}

impl CatalogContext {
    pub async fn connect(
        uri: &str,
        writable_storage: Option<PathBuf>,
        mut readable_storage: Vec<PathBuf>,
        registry: Arc<AdapterRegistry>,
        init_if_not_exists: bool,
    ) -> Result<Arc<Self>> {
        sqlx::any::install_default_drivers();
        let dialect = Dialect::from_uri(uri)?;
        let in_memory = uri.contains(":memory:");
        let pool = sqlx::any::AnyPoolOptions::new()
            // A transient in-memory SQLite database exists per connection;
            // a pool larger than one would see different databases.
            .max_connections(if in_memory { 1 } else { 8 })
            .connect(uri)
            .await?;
        if dialect == Dialect::Sqlite {
            sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
        }
        if in_memory {
            // Transient database: nothing to migrate, always initialize.
            migrations::initialize_database(&pool, dialect).await?;
        } else {
            migrations::check_catalog_database(&pool, dialect, init_if_not_exists).await?;
        }
        if let Some(writable) = &writable_storage {
            // Writable storage is implicitly readable.
            if !readable_storage.contains(writable) {
                readable_storage.push(writable.clone());
            }
        }
        Ok(Arc::new(Self {
            pool,
            dialect,
            writable_storage,
            readable_storage,
            registry,
        }))
    }

    /// Transient in-memory catalog, used by tests and demos.
    pub async fn in_memory(
        writable_storage: Option<PathBuf>,
        registry: Arc<AdapterRegistry>,
    ) -> Result<Arc<Self>> {
        Self::connect("sqlite::memory:", writable_storage, Vec::new(), registry, true).await
    }

    fn builder(&self) -> SqlBuilder {
        SqlBuilder::new(self.dialect)
    }
}

/// What a path lookup resolves to: a database-backed node, or an adapter
/// reached by walking inside a file-backed dataset.
#[derive(Clone)]
pub enum TreeEntry {
    Catalog(CatalogNode),
    /// Reached by walking inside a file-backed dataset; carries the access
    /// blob of the indexed node that owns the file.
    External {
        adapter: Adapter,
        access_blob: Option<JsonValue>,
    },
}

impl TreeEntry {
    pub fn structure_family(&self) -> StructureFamily {
        match self {
            TreeEntry::Catalog(node) => node.structure_family(),
            TreeEntry::External { adapter, .. } => adapter.structure_family(),
        }
    }

    pub fn metadata(&self) -> JsonValue {
        match self {
            TreeEntry::Catalog(node) => node.metadata().clone(),
            TreeEntry::External { adapter, .. } => adapter.metadata(),
        }
    }

    pub fn specs(&self) -> Vec<Spec> {
        match self {
            TreeEntry::Catalog(node) => node.node().specs.clone(),
            TreeEntry::External { adapter, .. } => adapter.specs(),
        }
    }

    pub fn access_blob(&self) -> Option<&JsonValue> {
        match self {
            TreeEntry::Catalog(node) => node.access_blob(),
            TreeEntry::External { access_blob, .. } => access_blob.as_ref(),
        }
    }
}

/// A description of storage for a node being created.
#[derive(Debug, Clone)]
pub struct DataSourceRequest {
    pub management: String,
    /// Required for external sources; ignored for writable ones, which use
    /// the family's default creation mimetype.
    pub mimetype: Option<String>,
    pub structure: Structure,
    pub parameters: JsonValue,
    /// Preexisting locations; only meaningful for external management.
    pub assets: Vec<Asset>,
}

#[derive(Debug, Clone)]
pub struct CreateNodeRequest {
    pub key: Option<String>,
    pub structure_family: StructureFamily,
    pub metadata: JsonValue,
    pub specs: Vec<Spec>,
    pub access_blob: Option<JsonValue>,
    pub data_sources: Vec<DataSourceRequest>,
}

#[derive(Clone)]
pub struct CatalogNode {
    context: Arc<CatalogContext>,
    node: NodeRow,
    data_sources: Vec<DataSourceRow>,
    /// Conditions pushed down to SQL when listing or searching children.
    queries: Vec<Query>,
    /// Conditions replayed through the file adapter of a data-source node.
    adapter_queries: Vec<Query>,
    sorting: Sorting,
}

impl CatalogNode {
    pub fn root(context: Arc<CatalogContext>, metadata: JsonValue, specs: Vec<Spec>) -> Self {
        Self {
            context,
            node: NodeRow::root(metadata, specs),
            data_sources: Vec::new(),
            queries: Vec::new(),
            adapter_queries: Vec::new(),
            sorting: Vec::new(),
        }
    }

    async fn from_node_row(context: Arc<CatalogContext>, node: NodeRow) -> Result<Self> {
        let data_sources = load_data_sources(&context, node.id).await?;
        Ok(Self {
            context,
            node,
            data_sources,
            queries: Vec::new(),
            adapter_queries: Vec::new(),
            sorting: Vec::new(),
        })
    }

    pub fn node(&self) -> &NodeRow {
        &self.node
    }

    pub fn context(&self) -> &Arc<CatalogContext> {
        &self.context
    }

    pub fn structure_family(&self) -> StructureFamily {
        self.node.structure_family
    }

    pub fn metadata(&self) -> &JsonValue {
        &self.node.metadata
    }

    pub fn access_blob(&self) -> Option<&JsonValue> {
        self.node.access_blob.as_ref()
    }

    pub fn segments(&self) -> Vec<String> {
        self.node.segments()
    }

    pub fn data_sources(&self) -> &[DataSourceRow] {
        &self.data_sources
    }

    pub fn structure(&self) -> Option<Structure> {
        self.data_sources.first().map(|ds| ds.structure.clone())
    }

    /// Narrow the view with one more query; successive searches conjoin.
    pub fn search(&self, query: Query) -> Self {
        let mut view = self.clone();
        if view.data_sources.is_empty() {
            view.queries.push(query);
        } else {
            view.adapter_queries.push(query);
        }
        view
    }

    pub fn sort(&self, sorting: Sorting) -> Self {
        let mut view = self.clone();
        view.sorting = sorting;
        view
    }

    fn select_children(&self, columns: &str) -> Result<SqlBuilder> {
        let mut builder = self.context.builder();
        builder.push("SELECT ");
        builder.push(columns);
        builder.push(" FROM nodes WHERE ancestors = ");
        builder.bind_json(serde_json::to_string(&self.segments()).map_err(anyhow::Error::from)?);
        append_conditions(&mut builder, &self.queries)?;
        Ok(builder)
    }

    pub async fn len(&self) -> Result<i64> {
        let builder = self.select_children("COUNT(*) AS n")?;
        let (sql, binds) = builder.finish();
        let row = fetch_optional(&self.context.pool, &sql, &binds)
            .await?
            .ok_or_else(|| TreeError::Internal(anyhow::anyhow!("COUNT returned no rows")))?;
        Ok(row.try_get::<i64, _>("n")?)
    }

    pub async fn keys_range(&self, offset: i64, limit: i64) -> Result<Vec<String>> {
        let mut builder = self.select_children("\"key\"")?;
        builder.push(&order_by_clause(self.context.dialect, &self.sorting)?);
        builder.push(" LIMIT ");
        builder.bind(BindValue::Int(limit));
        builder.push(" OFFSET ");
        builder.bind(BindValue::Int(offset));
        let (sql, binds) = builder.finish();
        let rows = fetch_all(&self.context.pool, &sql, &binds).await?;
        rows.iter()
            .map(|row| Ok(row.try_get::<String, _>("key")?))
            .collect()
    }

    pub async fn items_range(
        &self,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<(String, CatalogNode)>> {
        let mut builder = self.select_children(node_columns(self.context.dialect))?;
        builder.push(&order_by_clause(self.context.dialect, &self.sorting)?);
        builder.push(" LIMIT ");
        builder.bind(BindValue::Int(limit));
        builder.push(" OFFSET ");
        builder.bind(BindValue::Int(offset));
        let (sql, binds) = builder.finish();
        let rows = fetch_all(&self.context.pool, &sql, &binds).await?;
        let nodes = rows
            .iter()
            .map(NodeRow::from_row)
            .collect::<Result<Vec<_>>>()?;
        // Hydrate data sources concurrently; the pool bounds parallelism.
        futures::future::try_join_all(nodes.into_iter().map(|node| {
            let context = Arc::clone(&self.context);
            async move {
                let key = node.key.clone();
                Ok((key, CatalogNode::from_node_row(context, node).await?))
            }
        }))
        .await
    }

    async fn fetch_child(
        &self,
        relative_ancestors: &[String],
        key: &str,
    ) -> Result<Option<CatalogNode>> {
        let mut ancestors = self.segments();
        ancestors.extend_from_slice(relative_ancestors);
        let mut builder = self.context.builder();
        builder.push("SELECT ");
        builder.push(node_columns(self.context.dialect));
        builder.push(" FROM nodes WHERE ancestors = ");
        builder.bind_json(serde_json::to_string(&ancestors).map_err(anyhow::Error::from)?);
        builder.push(" AND \"key\" = ");
        builder.bind(BindValue::Text(key.to_string()));
        append_conditions(&mut builder, &self.queries)?;
        let (sql, binds) = builder.finish();
        let Some(row) = fetch_optional(&self.context.pool, &sql, &binds).await? else {
            return Ok(None);
        };
        let node = NodeRow::from_row(&row)?;
        Ok(Some(
            CatalogNode::from_node_row(Arc::clone(&self.context), node).await?,
        ))
    }

    /// Resolve a path of segments relative to this node.
    ///
    /// A miss on the direct path falls back to walking *into* a
    /// file-backed prefix: the longest indexed prefix with a data source
    /// resolves the remaining segments through its own adapter.
    pub async fn lookup(&self, segments: &[String]) -> Result<Option<TreeEntry>> {
        if segments.is_empty() {
            return Ok(Some(TreeEntry::Catalog(self.clone())));
        }
        let (ancestors, key) = segments.split_at(segments.len() - 1);
        if let Some(node) = self.fetch_child(ancestors, &key[0]).await? {
            return Ok(Some(TreeEntry::Catalog(node)));
        }
        for prefix_len in 0..segments.len() {
            let prefix_node = if prefix_len == 0 {
                self.clone()
            } else {
                let (parents, key) = segments[..prefix_len].split_at(prefix_len - 1);
                match self.fetch_child(parents, &key[0]).await? {
                    Some(node) => node,
                    None => continue,
                }
            };
            if prefix_node.data_sources.is_empty() {
                continue;
            }
            let mut adapter = prefix_node.get_adapter().await?;
            let mut resolved = true;
            for segment in &segments[prefix_len..] {
                let next = match &adapter {
                    Adapter::Container(container) => container.get(segment).await?,
                    _ => None,
                };
                match next {
                    Some(next) => adapter = next,
                    None => {
                        resolved = false;
                        break;
                    }
                }
            }
            if resolved {
                return Ok(Some(TreeEntry::External {
                    adapter,
                    access_blob: prefix_node.node.access_blob.clone(),
                }));
            }
        }
        Ok(None)
    }

    /// Construct the in-process adapter for this node's data source,
    /// enforcing that every asset lies under a configured storage root.
    pub async fn get_adapter(&self) -> Result<Adapter> {
        let data_source = match self.data_sources.as_slice() {
            [one] => one,
            [] => {
                return Err(TreeError::Internal(anyhow::anyhow!(
                    "node {} has no data source",
                    self.node.path()
                )))
            }
            _ => {
                return Err(TreeError::Internal(anyhow::anyhow!(
                    "multiple data sources are not supported"
                )))
            }
        };
        let factory = self
            .context
            .registry
            .get(&data_source.mimetype)
            .ok_or_else(|| {
                TreeError::Internal(anyhow::anyhow!(
                    "server configuration has no adapter for mimetype {:?}",
                    data_source.mimetype
                ))
            })?;
        let mut paths = Vec::with_capacity(data_source.assets.len());
        for asset in &data_source.assets {
            let path = safe_path(&asset.data_uri)?;
            // Protect against serving files outside the storage roots.
            if !within_any_root(&path, &self.context.readable_storage) {
                return Err(TreeError::Forbidden(format!(
                    "refusing to serve {} because it is outside the readable storage \
                     area for this server",
                    asset.data_uri
                )));
            }
            paths.push(path);
        }
        let init = AdapterInit {
            paths,
            structure: data_source.structure.clone(),
            metadata: self.node.metadata.clone(),
            specs: self.node.specs.clone(),
            parameters: data_source.parameters.clone(),
            writable: !data_source.is_external(),
        };
        let adapter = tokio::task::spawn_blocking(move || factory(init))
            .await
            .map_err(anyhow::Error::from)??;
        let mut adapter = adapter;
        for query in &self.adapter_queries {
            adapter = match adapter {
                Adapter::Container(container) => container.search(query.clone())?,
                other => other,
            };
        }
        Ok(adapter)
    }

    /// Create a child node, atomically keyed on (ancestors, key).
    pub async fn create_node(&self, request: CreateNodeRequest) -> Result<(String, CatalogNode)> {
        let family = request.structure_family;
        if family.is_container_like() && !request.data_sources.is_empty() {
            return Err(TreeError::Unprocessable(
                "container nodes cannot carry data sources".into(),
            ));
        }
        if !family.is_container_like() && request.data_sources.len() != 1 {
            return Err(TreeError::Unprocessable(
                "non-container nodes require exactly one data source".into(),
            ));
        }
        let key = match request.key {
            Some(key) => {
                if key.is_empty() || key.contains('/') {
                    return Err(TreeError::Unprocessable(format!("invalid key {key:?}")));
                }
                key
            }
            None => Uuid::new_v4().to_string(),
        };
        let ancestors = self.segments();
        let timestamp = now();

        let mut tx = self.context.pool.begin().await?;

        let mut builder = self.context.builder();
        builder.push(
            "INSERT INTO nodes (\"key\", ancestors, structure_family, metadata, specs, \
             access_blob, time_created, time_updated) VALUES (",
        );
        builder.bind(BindValue::Text(key.clone()));
        builder.push(", ");
        builder.bind_json(serde_json::to_string(&ancestors).map_err(anyhow::Error::from)?);
        builder.push(", ");
        builder.bind(BindValue::Text(family.as_str().to_string()));
        builder.push(", ");
        builder.bind_json(request.metadata.to_string());
        builder.push(", ");
        builder.bind_json(serde_json::to_string(&request.specs).map_err(anyhow::Error::from)?);
        builder.push(", ");
        match &request.access_blob {
            Some(blob) => {
                builder.bind_json(blob.to_string());
            }
            None => {
                builder.push("NULL");
            }
        }
        builder.push(", ");
        builder.bind(BindValue::Int(timestamp));
        builder.push(", ");
        builder.bind(BindValue::Int(timestamp));
        builder.push(") RETURNING id");
        let (sql, binds) = builder.finish();
        let node_id = match fetch_optional(&mut *tx, &sql, &binds).await {
            Ok(Some(row)) => row.try_get::<i64, _>("id")?,
            Ok(None) => {
                return Err(TreeError::Internal(anyhow::anyhow!(
                    "INSERT returned no id"
                )))
            }
            Err(TreeError::Database(err)) if is_unique_violation(&err) => {
                let mut path_segments = ancestors.clone();
                path_segments.push(key);
                return Err(TreeError::Collision(format!(
                    "/{}",
                    path_segments.join("/")
                )));
            }
            Err(other) => return Err(other),
        };

        let mut node_segments = ancestors.clone();
        node_segments.push(key.clone());

        for data_source in &request.data_sources {
            let (mimetype, assets) = if data_source.management == MANAGEMENT_EXTERNAL {
                let mimetype = data_source.mimetype.clone().ok_or_else(|| {
                    TreeError::Unprocessable(
                        "external data sources must declare a mimetype".into(),
                    )
                })?;
                for asset in &data_source.assets {
                    let path = safe_path(&asset.data_uri)?;
                    if !within_any_root(&path, &self.context.readable_storage) {
                        return Err(TreeError::Unprocessable(format!(
                            "asset {} is outside the readable storage area",
                            asset.data_uri
                        )));
                    }
                }
                (mimetype, data_source.assets.clone())
            } else {
                let mimetype = AdapterRegistry::default_creation_mimetype(family)
                    .ok_or_else(|| {
                        TreeError::Unprocessable(format!(
                            "no writable storage format for family {family}"
                        ))
                    })?
                    .to_string();
                let writable_root = self.context.writable_storage.clone().ok_or_else(|| {
                    TreeError::Unprocessable(
                        "this server has no writable storage configured".into(),
                    )
                })?;
                let mut directory = writable_root;
                for segment in &node_segments {
                    directory = directory.join(encode_segment(segment));
                }
                let init_storage =
                    self.context.registry.init_storage_for(&mimetype).ok_or_else(|| {
                        TreeError::Internal(anyhow::anyhow!(
                            "no storage initializer for mimetype {mimetype:?}"
                        ))
                    })?;
                let structure = data_source.structure.clone();
                let assets = tokio::task::spawn_blocking(move || {
                    init_storage(&directory, &structure)
                })
                .await
                .map_err(anyhow::Error::from)??;
                (mimetype, assets)
            };

            let mut builder = self.context.builder();
            builder.push(
                "INSERT INTO data_sources (node_id, mimetype, structure, parameters, \
                 management) VALUES (",
            );
            builder.bind(BindValue::Int(node_id));
            builder.push(", ");
            builder.bind(BindValue::Text(mimetype));
            builder.push(", ");
            match &data_source.structure {
                Structure::Node => {
                    builder.push("NULL");
                }
                structure => {
                    builder.bind_json(
                        serde_json::to_string(structure).map_err(anyhow::Error::from)?,
                    );
                }
            }
            builder.push(", ");
            builder.bind_json(data_source.parameters.to_string());
            builder.push(", ");
            builder.bind(BindValue::Text(data_source.management.clone()));
            builder.push(") RETURNING id");
            let (sql, binds) = builder.finish();
            let data_source_id = fetch_optional(&mut *tx, &sql, &binds)
                .await?
                .ok_or_else(|| TreeError::Internal(anyhow::anyhow!("INSERT returned no id")))?
                .try_get::<i64, _>("id")?;

            for asset in assets {
                let mut builder = self.context.builder();
                builder.push(
                    "INSERT INTO assets (data_source_id, data_uri, is_directory) VALUES (",
                );
                builder.bind(BindValue::Int(data_source_id));
                builder.push(", ");
                builder.bind(BindValue::Text(asset.data_uri.clone()));
                builder.push(", ");
                builder.bind(BindValue::Int(i64::from(asset.is_directory)));
                builder.push(")");
                let (sql, binds) = builder.finish();
                execute(&mut *tx, &sql, &binds).await?;
            }
        }

        tx.commit().await?;
        debug!(path = %format!("/{}", node_segments.join("/")), "created node");

        let created = self
            .fetch_child(&[], &node_segments[node_segments.len() - 1])
            .await?
            .ok_or_else(|| TreeError::Internal(anyhow::anyhow!("created node vanished")))?;
        Ok((node_segments[node_segments.len() - 1].clone(), created))
    }

    /// Delete this node. Refuses when children exist. Internally managed
    /// assets are removed from disk in the same logical operation.
    pub async fn delete(&self) -> Result<()> {
        if self.node.is_root() {
            return Err(TreeError::Unprocessable("cannot delete the root".into()));
        }
        let child_count = self.len_unfiltered().await?;
        if child_count > 0 {
            return Err(TreeError::Conflict(
                "cannot delete container that is not empty; delete contents first".into(),
            ));
        }
        for data_source in &self.data_sources {
            if !data_source.is_external() {
                for asset in &data_source.assets {
                    delete_asset(&asset.data_uri, asset.is_directory).await?;
                }
            }
        }
        let mut tx = self.context.pool.begin().await?;
        let mut builder = self.context.builder();
        builder.push(
            "DELETE FROM assets WHERE data_source_id IN \
             (SELECT id FROM data_sources WHERE node_id = ",
        );
        builder.bind(BindValue::Int(self.node.id));
        builder.push(")");
        let (sql, binds) = builder.finish();
        execute(&mut *tx, &sql, &binds).await?;

        let mut builder = self.context.builder();
        builder.push("DELETE FROM data_sources WHERE node_id = ");
        builder.bind(BindValue::Int(self.node.id));
        let (sql, binds) = builder.finish();
        execute(&mut *tx, &sql, &binds).await?;

        let mut builder = self.context.builder();
        builder.push("DELETE FROM nodes WHERE id = ");
        builder.bind(BindValue::Int(self.node.id));
        let (sql, binds) = builder.finish();
        let result = execute(&mut *tx, &sql, &binds).await?;
        if result.rows_affected() == 0 {
            return Err(TreeError::NotFound(format!("no node {}", self.node.path())));
        }
        if result.rows_affected() != 1 {
            // Abort the transaction rather than persist a surprise.
            return Err(TreeError::Internal(anyhow::anyhow!(
                "deletion would affect {} rows; rolling back",
                result.rows_affected()
            )));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn len_unfiltered(&self) -> Result<i64> {
        let mut builder = self.context.builder();
        builder.push("SELECT COUNT(*) AS n FROM nodes WHERE ancestors = ");
        builder.bind_json(serde_json::to_string(&self.segments()).map_err(anyhow::Error::from)?);
        let (sql, binds) = builder.finish();
        let row = fetch_optional(&self.context.pool, &sql, &binds)
            .await?
            .ok_or_else(|| TreeError::Internal(anyhow::anyhow!("COUNT returned no rows")))?;
        Ok(row.try_get::<i64, _>("n")?)
    }

    fn append_subtree_condition(&self, builder: &mut SqlBuilder, prefix: &str) {
        let segments = self.segments();
        builder.push("(");
        if segments.is_empty() {
            builder.push("1 = 1");
        } else {
            builder.push("(");
            for (generation, segment) in segments.iter().enumerate() {
                if generation > 0 {
                    builder.push(" AND ");
                }
                match self.context.dialect {
                    Dialect::Sqlite => {
                        builder.push(&format!(
                            "json_extract({prefix}ancestors, '$[{generation}]') = "
                        ));
                    }
                    Dialect::Postgres => {
                        builder.push(&format!("{prefix}ancestors->>{generation} = "));
                    }
                }
                builder.bind(BindValue::Text(segment.clone()));
            }
            builder.push(") OR ");
            builder.push(&format!("{prefix}id = "));
            builder.bind(BindValue::Int(self.node.id));
        }
        builder.push(")");
    }

    /// Delete this node and every node beneath it.
    ///
    /// With `external_only` (the default posture), the operation errors if
    /// any internally managed assets would be removed. Returns the number
    /// of rows deleted across nodes, data sources, and assets.
    pub async fn delete_tree(&self, external_only: bool) -> Result<u64> {
        let mut builder = self.context.builder();
        builder.push(
            "SELECT assets.data_uri AS data_uri, assets.is_directory AS is_directory \
             FROM assets \
             JOIN data_sources ON assets.data_source_id = data_sources.id \
             JOIN nodes ON data_sources.node_id = nodes.id \
             WHERE data_sources.management != ",
        );
        builder.bind(BindValue::Text(MANAGEMENT_EXTERNAL.to_string()));
        builder.push(" AND ");
        self.append_subtree_condition(&mut builder, "nodes.");
        let (sql, binds) = builder.finish();
        let internal_assets = fetch_all(&self.context.pool, &sql, &binds).await?;

        if external_only && !internal_assets.is_empty() {
            return Err(TreeError::WouldDeleteData);
        }

        // Row counts, gathered before deletion so the caller sees the full
        // cost of the operation.
        let data_source_count = self.count_in_subtree(
            "SELECT COUNT(*) AS n FROM data_sources \
             JOIN nodes ON data_sources.node_id = nodes.id WHERE ",
        )
        .await?;
        let asset_count = self.count_in_subtree(
            "SELECT COUNT(*) AS n FROM assets \
             JOIN data_sources ON assets.data_source_id = data_sources.id \
             JOIN nodes ON data_sources.node_id = nodes.id WHERE ",
        )
        .await?;

        if !external_only {
            for row in &internal_assets {
                let data_uri: String = row.try_get("data_uri")?;
                let is_directory: i64 = row.try_get("is_directory")?;
                delete_asset(&data_uri, is_directory != 0).await?;
            }
        }

        let mut tx = self.context.pool.begin().await?;
        let mut builder = self.context.builder();
        builder.push(
            "DELETE FROM assets WHERE data_source_id IN \
             (SELECT data_sources.id FROM data_sources \
             JOIN nodes ON data_sources.node_id = nodes.id WHERE ",
        );
        self.append_subtree_condition(&mut builder, "nodes.");
        builder.push(")");
        let (sql, binds) = builder.finish();
        execute(&mut *tx, &sql, &binds).await?;

        let mut builder = self.context.builder();
        builder.push(
            "DELETE FROM data_sources WHERE node_id IN (SELECT id FROM nodes WHERE ",
        );
        self.append_subtree_condition(&mut builder, "");
        builder.push(")");
        let (sql, binds) = builder.finish();
        execute(&mut *tx, &sql, &binds).await?;

        let mut builder = self.context.builder();
        builder.push("DELETE FROM nodes WHERE ");
        self.append_subtree_condition(&mut builder, "");
        let (sql, binds) = builder.finish();
        let node_result = execute(&mut *tx, &sql, &binds).await?;
        tx.commit().await?;

        Ok(node_result.rows_affected() + data_source_count as u64 + asset_count as u64)
    }

    async fn count_in_subtree(&self, select_prefix: &str) -> Result<i64> {
        let mut builder = self.context.builder();
        builder.push(select_prefix);
        self.append_subtree_condition(&mut builder, "nodes.");
        let (sql, binds) = builder.finish();
        let row = fetch_optional(&self.context.pool, &sql, &binds)
            .await?
            .ok_or_else(|| TreeError::Internal(anyhow::anyhow!("COUNT returned no rows")))?;
        Ok(row.try_get::<i64, _>("n")?)
    }

    /// Update metadata and/or specs, snapshotting the previous state into
    /// a new numbered revision in the same transaction.
    pub async fn update_metadata(
        &self,
        metadata: Option<JsonValue>,
        specs: Option<Vec<Spec>>,
    ) -> Result<()> {
        if self.node.is_root() {
            return Err(TreeError::Unprocessable(
                "the root's metadata comes from server configuration".into(),
            ));
        }
        let mut tx = self.context.pool.begin().await?;

        // Snapshot the row as currently stored, not as this view loaded
        // it; a concurrent update must not be lost from the history.
        let mut builder = self.context.builder();
        builder.push("SELECT ");
        builder.push(node_columns(self.context.dialect));
        builder.push(" FROM nodes WHERE id = ");
        builder.bind(BindValue::Int(self.node.id));
        let (sql, binds) = builder.finish();
        let current = fetch_optional(&mut *tx, &sql, &binds)
            .await?
            .ok_or_else(|| TreeError::NotFound(format!("no node {}", self.node.path())))?;
        let current = NodeRow::from_row(&current)?;

        let mut builder = self.context.builder();
        builder.push(
            "SELECT COALESCE(MAX(revision_number), 0) AS latest FROM revisions \
             WHERE node_id = ",
        );
        builder.bind(BindValue::Int(self.node.id));
        let (sql, binds) = builder.finish();
        let latest: i64 = fetch_optional(&mut *tx, &sql, &binds)
            .await?
            .map(|row| row.try_get("latest"))
            .transpose()?
            .unwrap_or(0);

        let mut builder = self.context.builder();
        builder.push(
            "INSERT INTO revisions (node_id, revision_number, metadata, specs, \
             time_created) VALUES (",
        );
        builder.bind(BindValue::Int(self.node.id));
        builder.push(", ");
        builder.bind(BindValue::Int(latest + 1));
        builder.push(", ");
        builder.bind_json(current.metadata.to_string());
        builder.push(", ");
        builder.bind_json(serde_json::to_string(&current.specs).map_err(anyhow::Error::from)?);
        builder.push(", ");
        builder.bind(BindValue::Int(now()));
        builder.push(")");
        let (sql, binds) = builder.finish();
        execute(&mut *tx, &sql, &binds).await?;

        let mut builder = self.context.builder();
        builder.push("UPDATE nodes SET time_updated = ");
        builder.bind(BindValue::Int(now()));
        if let Some(metadata) = &metadata {
            builder.push(", metadata = ");
            builder.bind_json(metadata.to_string());
        }
        if let Some(specs) = &specs {
            builder.push(", specs = ");
            builder.bind_json(serde_json::to_string(specs).map_err(anyhow::Error::from)?);
        }
        builder.push(" WHERE id = ");
        builder.bind(BindValue::Int(self.node.id));
        let (sql, binds) = builder.finish();
        execute(&mut *tx, &sql, &binds).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Replace the access blob. Concurrent writers race; the row holds the
    /// last write.
    pub async fn update_access_blob(&self, access_blob: &JsonValue) -> Result<()> {
        let mut builder = self.context.builder();
        builder.push("UPDATE nodes SET access_blob = ");
        builder.bind_json(access_blob.to_string());
        builder.push(", time_updated = ");
        builder.bind(BindValue::Int(now()));
        builder.push(" WHERE id = ");
        builder.bind(BindValue::Int(self.node.id));
        let (sql, binds) = builder.finish();
        execute(&self.context.pool, &sql, &binds).await?;
        Ok(())
    }

    pub async fn revisions(&self, offset: i64, limit: i64) -> Result<Vec<RevisionRow>> {
        let mut builder = self.context.builder();
        builder.push(
            &format!(
                "SELECT {} FROM revisions WHERE node_id = ",
                revision_columns(self.context.dialect)
            ),
        );
        builder.bind(BindValue::Int(self.node.id));
        builder.push(" ORDER BY revision_number ASC LIMIT ");
        builder.bind(BindValue::Int(limit));
        builder.push(" OFFSET ");
        builder.bind(BindValue::Int(offset));
        let (sql, binds) = builder.finish();
        let rows = fetch_all(&self.context.pool, &sql, &binds).await?;
        rows.iter().map(RevisionRow::from_row).collect()
    }

    pub async fn delete_revision(&self, number: i64) -> Result<()> {
        let mut builder = self.context.builder();
        builder.push("DELETE FROM revisions WHERE node_id = ");
        builder.bind(BindValue::Int(self.node.id));
        builder.push(" AND revision_number = ");
        builder.bind(BindValue::Int(number));
        let (sql, binds) = builder.finish();
        let result = execute(&self.context.pool, &sql, &binds).await?;
        if result.rows_affected() == 0 {
            return Err(TreeError::NotFound(format!(
                "no revision {number} for node {}",
                self.node.path()
            )));
        }
        Ok(())
    }

    /// Faceted aggregation of distinct values under the current
    /// conditions.
    pub async fn distinct(
        &self,
        metadata_keys: &[String],
        structure_families: bool,
        specs: bool,
        counts: bool,
    ) -> Result<JsonValue> {
        let mut out = serde_json::Map::new();
        if !metadata_keys.is_empty() {
            let mut per_key = serde_json::Map::new();
            for key in metadata_keys {
                let expr = metadata_text_expr(self.context.dialect, key)?;
                let values = self.distinct_over(&expr, counts).await?;
                per_key.insert(key.clone(), values);
            }
            out.insert("metadata".into(), JsonValue::Object(per_key));
        }
        if structure_families {
            let values = self.distinct_over("structure_family", counts).await?;
            out.insert("structure_families".into(), values);
        }
        if specs {
            let expr = match self.context.dialect {
                Dialect::Sqlite => "specs",
                Dialect::Postgres => "specs::text",
            };
            let values = self.distinct_over(expr, counts).await?;
            out.insert("specs".into(), values);
        }
        Ok(JsonValue::Object(out))
    }

    async fn distinct_over(&self, expr: &str, counts: bool) -> Result<JsonValue> {
        let columns = if counts {
            format!("{expr} AS v, COUNT(*) AS n")
        } else {
            format!("{expr} AS v")
        };
        let mut builder = self.select_children(&columns)?;
        builder.push(" GROUP BY 1");
        let (sql, binds) = builder.finish();
        let rows = fetch_all(&self.context.pool, &sql, &binds).await?;
        let mut values = Vec::with_capacity(rows.len());
        for row in &rows {
            let value = any_column_to_json(row, "v");
            let mut item = serde_json::Map::new();
            item.insert("value".into(), value);
            if counts {
                item.insert("count".into(), row.try_get::<i64, _>("n")?.into());
            }
            values.push(JsonValue::Object(item));
        }
        Ok(JsonValue::Array(values))
    }
}

fn metadata_text_expr(dialect: Dialect, key: &str) -> Result<String> {
    // Reuse the validated translation path by rendering through a throwaway
    // builder; the expression carries no binds.
    let mut builder = SqlBuilder::new(dialect);
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
    match dialect {
        Dialect::Sqlite => {
            let path: Vec<String> = segments.iter().map(|s| format!("\"{s}\"")).collect();
            builder.push(&format!("json_extract(metadata, '$.{}')", path.join(".")));
        }
        Dialect::Postgres => {
            builder.push(&format!("metadata #>> '{{{}}}'", segments.join(",")));
        }
    }
    Ok(builder.finish().0)
}

/// Decode a dynamically-typed column into a JSON value.
fn any_column_to_json(row: &AnyRow, column: &str) -> JsonValue {
    if let Ok(value) = row.try_get::<i64, _>(column) {
        return value.into();
    }
    if let Ok(value) = row.try_get::<f64, _>(column) {
        return value.into();
    }
    if let Ok(value) = row.try_get::<Option<String>, _>(column) {
        return match value {
            Some(text) => serde_json::from_str(&text).unwrap_or(JsonValue::String(text)),
            None => JsonValue::Null,
        };
    }
    JsonValue::Null
}

async fn load_data_sources(
    context: &Arc<CatalogContext>,
    node_id: i64,
) -> Result<Vec<DataSourceRow>> {
    let mut builder = context.builder();
    builder.push(
        &format!(
            "SELECT {} FROM data_sources WHERE node_id = ",
            data_source_columns(context.dialect)
        ),
    );
    builder.bind(BindValue::Int(node_id));
    let (sql, binds) = builder.finish();
    let rows = fetch_all(&context.pool, &sql, &binds).await?;
    let mut data_sources = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut data_source = DataSourceRow::from_row(row)?;
        let mut builder = context.builder();
        builder.push(
            "SELECT id, data_source_id, data_uri, is_directory FROM assets \
             WHERE data_source_id = ",
        );
        builder.bind(BindValue::Int(data_source.id));
        let (sql, binds) = builder.finish();
        let asset_rows = fetch_all(&context.pool, &sql, &binds).await?;
        data_source.assets = asset_rows
            .iter()
            .map(AssetRow::from_row)
            .collect::<Result<Vec<_>>>()?;
        data_sources.push(data_source);
    }
    Ok(data_sources)
}

async fn delete_asset(data_uri: &str, is_directory: bool) -> Result<()> {
    let path = safe_path(data_uri)?;
    tokio::task::spawn_blocking(move || -> Result<()> {
        if is_directory {
            std::fs::remove_dir_all(&path).map_err(anyhow::Error::from)?;
        } else {
            std::fs::remove_file(&path).map_err(anyhow::Error::from)?;
        }
        Ok(())
    })
    .await
    .map_err(anyhow::Error::from)??;
    Ok(())
}
