// Route handlers for the tree: metadata, search, chunked array and table
// reads/writes, node mutation, revisions, and faceted distinct.

use axum::body::Bytes;
use axum::extract::{Extension, Path, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use sha2::Digest;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::ops::Range;
use std::time::Instant;

use super::extract::RequestPrincipal;
use super::{pagination, serialization, AppState};
use crate::access::{PolicyFilters, PolicyPrincipal};
use crate::adapters::{AdapterCore, ArrayAdapter, ContainerAdapter, TableAdapter};
use crate::catalog::orm::{MANAGEMENT_EXTERNAL, MANAGEMENT_WRITABLE};
use crate::catalog::{CreateNodeRequest, DataSourceRequest, TreeEntry};
use crate::errors::{Result, TreeError};
use crate::queries::Query;
use crate::scopes;
use crate::structures::{Spec, Structure, StructureFamily};

pub fn split_segments(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| segment.to_string())
        .collect()
}

fn parse_query_pairs(query: &Option<String>) -> Vec<(String, String)> {
    match query {
        Some(raw) => url::form_urlencoded::parse(raw.as_bytes())
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect(),
        None => Vec::new(),
    }
}

pub(super) fn principal_parts(
    state: &AppState,
    rp: &RequestPrincipal,
) -> Result<(PolicyPrincipal, BTreeSet<String>)> {
    match &rp.0 {
        Some(context) => Ok((context.policy_principal(), context.scopes.clone())),
        None => {
            if state.auth.config.providers.is_empty() {
                // Single-user mode: no authentication is configured, so
                // the bare server is fully usable from localhost.
                Ok((PolicyPrincipal::Public, scopes::all_scopes()))
            } else if state.allow_anonymous {
                Ok((PolicyPrincipal::Public, scopes::public_scopes()))
            } else {
                Err(TreeError::AuthRequired)
            }
        }
    }
}

/// Check that the credential and the policy both grant every required
/// scope on this access blob.
async fn authorize(
    state: &AppState,
    access_blob: Option<&JsonValue>,
    rp: &RequestPrincipal,
    required: &[&str],
) -> Result<(PolicyPrincipal, BTreeSet<String>)> {
    let (principal, authn_scopes) = principal_parts(state, rp)?;
    let allowed = state
        .policy
        .allowed_scopes(access_blob, &principal, &authn_scopes)
        .await;
    for scope in required {
        if !authn_scopes.contains(*scope) || !allowed.contains(*scope) {
            return Err(TreeError::Forbidden(format!("missing scope {scope}")));
        }
    }
    Ok((principal, authn_scopes))
}

async fn resolve_entry(state: &AppState, path: &str) -> Result<TreeEntry> {
    let segments = split_segments(path);
    state
        .root
        .lookup(&segments)
        .await?
        .ok_or_else(|| TreeError::NotFound(format!("no such entry /{}", segments.join("/"))))
}

fn negotiated_document(
    state: &AppState,
    headers: &HeaderMap,
    document: JsonValue,
) -> Result<Response> {
    let accept = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok());
    let media_type =
        serialization::negotiate(accept, state.serialization.document_types())?;
    let body = serialization::encode(&media_type, &serialization::Payload::Document(document))?;
    Ok(([(header::CONTENT_TYPE, media_type)], body).into_response())
}

fn entry_attributes(entry: &TreeEntry) -> JsonValue {
    let structure = match entry {
        TreeEntry::Catalog(node) => node.structure(),
        TreeEntry::External { adapter, .. } => Some(adapter.structure()),
    };
    json!({
        "structure_family": entry.structure_family(),
        "metadata": entry.metadata(),
        "specs": entry.specs(),
        "structure": structure,
        "access_blob": match entry {
            TreeEntry::Catalog(node) => node.access_blob().cloned(),
            TreeEntry::External { access_blob, .. } => access_blob.clone(),
        },
    })
}

// ---------------------------------------------------------------------
// Discovery

pub async fn service_index() -> Json<JsonValue> {
    Json(json!({
        "api_version": 1,
        "routes": [
            "/api/v1/metadata/{path}",
            "/api/v1/search/{path}",
            "/api/v1/distinct/{path}",
            "/api/v1/revisions/{path}",
            "/api/v1/array/block/{path}?block=i,j",
            "/api/v1/array/full/{path}",
            "/api/v1/table/partition/{path}?partition=n",
            "/api/v1/table/full/{path}",
            "/api/v1/auth/provider/{provider}/token",
            "/api/v1/auth/session/refresh",
            "/api/v1/auth/session/revoke",
            "/api/v1/auth/whoami",
            "/api/v1/auth/apikey",
        ],
    }))
}

// ---------------------------------------------------------------------
// Metadata

async fn node_metadata_impl(
    state: AppState,
    rp: RequestPrincipal,
    headers: HeaderMap,
    path: String,
) -> Result<Response> {
    let entry = resolve_entry(&state, &path).await?;
    authorize(&state, entry.access_blob(), &rp, &[scopes::READ_METADATA]).await?;
    let segments = split_segments(&path);
    let document = json!({
        "data": {
            "id": segments.last().cloned().unwrap_or_default(),
            "attributes": entry_attributes(&entry),
        },
    });
    negotiated_document(&state, &headers, document)
}

pub async fn node_metadata_root(
    State(state): State<AppState>,
    Extension(rp): Extension<RequestPrincipal>,
    headers: HeaderMap,
) -> Result<Response> {
    node_metadata_impl(state, rp, headers, String::new()).await
}

pub async fn node_metadata(
    State(state): State<AppState>,
    Extension(rp): Extension<RequestPrincipal>,
    headers: HeaderMap,
    Path(path): Path<String>,
) -> Result<Response> {
    node_metadata_impl(state, rp, headers, path).await
}

// ---------------------------------------------------------------------
// Node creation / mutation / deletion

#[derive(Debug, Deserialize)]
pub struct AssetBody {
    pub data_uri: String,
    #[serde(default)]
    pub is_directory: bool,
}

#[derive(Debug, Deserialize)]
pub struct DataSourceBody {
    #[serde(default)]
    pub management: Option<String>,
    #[serde(default)]
    pub mimetype: Option<String>,
    pub structure: Structure,
    #[serde(default)]
    pub parameters: Option<JsonValue>,
    #[serde(default)]
    pub assets: Vec<AssetBody>,
}

#[derive(Debug, Deserialize)]
pub struct CreateNodeBody {
    #[serde(default)]
    pub key: Option<String>,
    pub structure_family: StructureFamily,
    #[serde(default)]
    pub metadata: Option<JsonValue>,
    #[serde(default)]
    pub specs: Option<Vec<Spec>>,
    #[serde(default)]
    pub access_blob: Option<JsonValue>,
    #[serde(default)]
    pub data_sources: Vec<DataSourceBody>,
}

async fn create_node_impl(
    state: AppState,
    rp: RequestPrincipal,
    path: String,
    body: CreateNodeBody,
) -> Result<Response> {
    let entry = resolve_entry(&state, &path).await?;
    let TreeEntry::Catalog(parent) = entry else {
        return Err(TreeError::Unprocessable(
            "cannot create nodes inside a file-backed dataset".into(),
        ));
    };
    if !parent.structure_family().is_container_like() {
        return Err(TreeError::Unprocessable(
            "parent is not a container".into(),
        ));
    }
    let has_external = body
        .data_sources
        .iter()
        .any(|ds| ds.management.as_deref() == Some(MANAGEMENT_EXTERNAL));
    let mut required = vec![scopes::CREATE, scopes::WRITE_METADATA];
    if has_external {
        required.push(scopes::REGISTER);
    }
    let (principal, authn_scopes) =
        authorize(&state, parent.access_blob(), &rp, &required).await?;

    let (_, access_blob) = state
        .policy
        .init_node(&principal, &authn_scopes, body.access_blob.as_ref())
        .await?;
    let access_blob = match access_blob {
        JsonValue::Null => None,
        other => Some(other),
    };

    let data_sources = body
        .data_sources
        .into_iter()
        .map(|ds| DataSourceRequest {
            management: ds
                .management
                .unwrap_or_else(|| MANAGEMENT_WRITABLE.to_string()),
            mimetype: ds.mimetype,
            structure: ds.structure,
            parameters: ds.parameters.unwrap_or_else(|| json!({})),
            assets: ds
                .assets
                .into_iter()
                .map(|asset| crate::adapters::Asset {
                    data_uri: asset.data_uri,
                    is_directory: asset.is_directory,
                })
                .collect(),
        })
        .collect();

    let (key, node) = parent
        .create_node(CreateNodeRequest {
            key: body.key,
            structure_family: body.structure_family,
            metadata: body.metadata.unwrap_or_else(|| json!({})),
            specs: body.specs.unwrap_or_default(),
            access_blob,
            data_sources,
        })
        .await?;

    let document = json!({
        "data": {
            "id": key,
            "attributes": {
                "structure_family": node.structure_family(),
                "metadata": node.metadata(),
                "specs": node.node().specs,
                "structure": node.structure(),
                "access_blob": node.access_blob(),
            },
        },
    });
    Ok((StatusCode::CREATED, Json(document)).into_response())
}

pub async fn create_node_root(
    State(state): State<AppState>,
    Extension(rp): Extension<RequestPrincipal>,
    Json(body): Json<CreateNodeBody>,
) -> Result<Response> {
    create_node_impl(state, rp, String::new(), body).await
}

pub async fn create_node(
    State(state): State<AppState>,
    Extension(rp): Extension<RequestPrincipal>,
    Path(path): Path<String>,
    Json(body): Json<CreateNodeBody>,
) -> Result<Response> {
    create_node_impl(state, rp, path, body).await
}

#[derive(Debug, Deserialize)]
pub struct PatchNodeBody {
    #[serde(default)]
    pub metadata: Option<JsonValue>,
    #[serde(default)]
    pub specs: Option<Vec<Spec>>,
    #[serde(default)]
    pub access_blob: Option<JsonValue>,
}

pub async fn patch_node(
    State(state): State<AppState>,
    Extension(rp): Extension<RequestPrincipal>,
    Path(path): Path<String>,
    Json(body): Json<PatchNodeBody>,
) -> Result<Response> {
    let entry = resolve_entry(&state, &path).await?;
    let TreeEntry::Catalog(node) = entry else {
        return Err(TreeError::Unprocessable(
            "cannot modify entries inside a file-backed dataset".into(),
        ));
    };
    let (principal, authn_scopes) =
        authorize(&state, node.access_blob(), &rp, &[scopes::WRITE_METADATA]).await?;

    if body.metadata.is_some() || body.specs.is_some() {
        node.update_metadata(body.metadata.clone(), body.specs.clone())
            .await?;
    }
    if let Some(access_blob) = &body.access_blob {
        let (_, final_blob) = state
            .policy
            .modify_node(node.access_blob(), &principal, &authn_scopes, access_blob)
            .await?;
        node.update_access_blob(&final_blob).await?;
    }
    Ok(Json(json!({"ok": true})).into_response())
}

#[derive(Debug, Deserialize)]
pub struct DeleteParams {
    #[serde(default)]
    pub tree: Option<bool>,
    #[serde(default)]
    pub external_only: Option<bool>,
}

pub async fn delete_node(
    State(state): State<AppState>,
    Extension(rp): Extension<RequestPrincipal>,
    Path(path): Path<String>,
    axum::extract::Query(params): axum::extract::Query<DeleteParams>,
) -> Result<Response> {
    let entry = resolve_entry(&state, &path).await?;
    let TreeEntry::Catalog(node) = entry else {
        return Err(TreeError::Unprocessable(
            "cannot delete entries inside a file-backed dataset".into(),
        ));
    };
    authorize(&state, node.access_blob(), &rp, &[scopes::WRITE_DATA]).await?;
    if params.tree.unwrap_or(false) {
        let deleted = node.delete_tree(params.external_only.unwrap_or(true)).await?;
        Ok(Json(json!({"deleted": deleted})).into_response())
    } else {
        node.delete().await?;
        Ok(Json(json!({"deleted": 1})).into_response())
    }
}

// ---------------------------------------------------------------------
// Search

fn parse_sorting(raw: &str) -> Vec<(String, i8)> {
    raw.split(',')
        .filter(|part| !part.is_empty())
        .map(|part| match part.strip_prefix('-') {
            Some(key) => (key.to_string(), -1),
            None => (part.to_string(), 1),
        })
        .collect()
}

async fn search_impl(
    state: AppState,
    rp: RequestPrincipal,
    headers: HeaderMap,
    path: String,
    raw_query: Option<String>,
) -> Result<Response> {
    let pairs = parse_query_pairs(&raw_query);
    let params: HashMap<String, String> = pairs.iter().cloned().collect();
    let page = pagination::Page::from_query(&params)?;

    let mut user_queries = Vec::new();
    for (key, value) in &pairs {
        if key == "filter" {
            let query: Query = serde_json::from_str(value).map_err(|e| {
                TreeError::Unprocessable(format!("invalid filter {value:?}: {e}"))
            })?;
            user_queries.push(query);
        }
    }
    let sorting = params
        .get("sort")
        .map(|raw| parse_sorting(raw))
        .unwrap_or_default();

    let entry = resolve_entry(&state, &path).await?;
    let (principal, authn_scopes) =
        authorize(&state, entry.access_blob(), &rp, &[scopes::READ_METADATA]).await?;

    // The policy narrows results to what the principal may read.
    let read_scopes = BTreeSet::from([scopes::READ_METADATA.to_string()]);
    let policy_queries = match state
        .policy
        .filters(&principal, &authn_scopes, &read_scopes)
        .await
    {
        PolicyFilters::Queries(queries) => queries,
        PolicyFilters::NoAccess => {
            return Err(TreeError::Forbidden(
                "requested scopes cannot be satisfied".into(),
            ))
        }
    };

    let base = if path.is_empty() {
        "/api/v1/search".to_string()
    } else {
        format!("/api/v1/search/{path}")
    };

    let (count, entries) = match entry {
        TreeEntry::Catalog(node) => {
            if !node.structure_family().is_container_like() {
                return Err(TreeError::Unprocessable("not a container".into()));
            }
            let mut view = node;
            for query in user_queries {
                view = view.search(query);
            }
            for query in policy_queries {
                view = view.search(query);
            }
            if !sorting.is_empty() {
                view = view.sort(sorting);
            }
            let count = view.len().await?;
            let items = view.items_range(page.offset, page.limit).await?;
            let entries: Vec<JsonValue> = items
                .into_iter()
                .map(|(key, child)| {
                    json!({
                        "id": key,
                        "attributes": {
                            "structure_family": child.structure_family(),
                            "metadata": child.metadata(),
                            "specs": child.node().specs,
                            "structure": child.structure(),
                            "access_blob": child.access_blob(),
                        },
                    })
                })
                .collect();
            (count, entries)
        }
        TreeEntry::External { adapter, .. } => {
            let mut container = adapter
                .as_container()
                .ok_or_else(|| TreeError::Unprocessable("not a container".into()))?
                .clone();
            for query in user_queries {
                let narrowed = container.search(query)?;
                container = narrowed
                    .as_container()
                    .ok_or_else(|| TreeError::Unprocessable("not a container".into()))?
                    .clone();
            }
            if !sorting.is_empty() {
                let sorted = container.sort(sorting)?;
                container = sorted
                    .as_container()
                    .ok_or_else(|| TreeError::Unprocessable("not a container".into()))?
                    .clone();
            }
            let count = container.len().await? as i64;
            let items = container
                .items_range(page.offset.max(0) as usize, page.limit.max(0) as usize)
                .await?;
            let entries: Vec<JsonValue> = items
                .into_iter()
                .map(|(key, child)| {
                    json!({
                        "id": key,
                        "attributes": {
                            "structure_family": child.structure_family(),
                            "metadata": child.metadata(),
                            "specs": child.specs(),
                            "structure": child.structure(),
                        },
                    })
                })
                .collect();
            (count, entries)
        }
    };

    let document = json!({
        "data": entries,
        "links": pagination::links(&base, page, count),
        "meta": {"count": count},
    });
    negotiated_document(&state, &headers, document)
}

pub async fn search_root(
    State(state): State<AppState>,
    Extension(rp): Extension<RequestPrincipal>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
) -> Result<Response> {
    search_impl(state, rp, headers, String::new(), raw_query).await
}

pub async fn search(
    State(state): State<AppState>,
    Extension(rp): Extension<RequestPrincipal>,
    headers: HeaderMap,
    Path(path): Path<String>,
    RawQuery(raw_query): RawQuery,
) -> Result<Response> {
    search_impl(state, rp, headers, path, raw_query).await
}

// ---------------------------------------------------------------------
// Distinct

async fn distinct_impl(
    state: AppState,
    rp: RequestPrincipal,
    path: String,
    raw_query: Option<String>,
) -> Result<Response> {
    let pairs = parse_query_pairs(&raw_query);
    let params: HashMap<String, String> = pairs.iter().cloned().collect();
    let entry = resolve_entry(&state, &path).await?;
    authorize(&state, entry.access_blob(), &rp, &[scopes::READ_METADATA]).await?;
    let TreeEntry::Catalog(node) = entry else {
        return Err(TreeError::Unprocessable(
            "distinct is only supported on catalog containers".into(),
        ));
    };
    let metadata_keys: Vec<String> = pairs
        .iter()
        .filter(|(key, _)| key == "metadata")
        .map(|(_, value)| value.clone())
        .collect();
    let counts = params.get("counts").map(|v| v == "true").unwrap_or(false);
    let structure_families = params
        .get("structure_families")
        .map(|v| v == "true")
        .unwrap_or(false);
    let specs = params.get("specs").map(|v| v == "true").unwrap_or(false);
    let result = node
        .distinct(&metadata_keys, structure_families, specs, counts)
        .await?;
    Ok(Json(result).into_response())
}

pub async fn distinct_root(
    State(state): State<AppState>,
    Extension(rp): Extension<RequestPrincipal>,
    RawQuery(raw_query): RawQuery,
) -> Result<Response> {
    distinct_impl(state, rp, String::new(), raw_query).await
}

pub async fn distinct(
    State(state): State<AppState>,
    Extension(rp): Extension<RequestPrincipal>,
    Path(path): Path<String>,
    RawQuery(raw_query): RawQuery,
) -> Result<Response> {
    distinct_impl(state, rp, path, raw_query).await
}

// ---------------------------------------------------------------------
// Revisions

pub async fn revisions(
    State(state): State<AppState>,
    Extension(rp): Extension<RequestPrincipal>,
    Path(path): Path<String>,
    axum::extract::Query(params): axum::extract::Query<HashMap<String, String>>,
) -> Result<Response> {
    let entry = resolve_entry(&state, &path).await?;
    authorize(&state, entry.access_blob(), &rp, &[scopes::READ_METADATA]).await?;
    let TreeEntry::Catalog(node) = entry else {
        return Err(TreeError::NotFound("no revisions for this entry".into()));
    };
    let page = pagination::Page::from_query(&params)?;
    let revisions = node.revisions(page.offset, page.limit).await?;
    let data: Vec<JsonValue> = revisions
        .iter()
        .map(|revision| {
            json!({
                "revision_number": revision.revision_number,
                "metadata": revision.metadata,
                "specs": revision.specs,
                "time_created": revision.time_created,
            })
        })
        .collect();
    Ok(Json(json!({"data": data})).into_response())
}

pub async fn delete_revision(
    State(state): State<AppState>,
    Extension(rp): Extension<RequestPrincipal>,
    Path(path): Path<String>,
    axum::extract::Query(params): axum::extract::Query<HashMap<String, String>>,
) -> Result<Response> {
    let entry = resolve_entry(&state, &path).await?;
    authorize(&state, entry.access_blob(), &rp, &[scopes::WRITE_METADATA]).await?;
    let TreeEntry::Catalog(node) = entry else {
        return Err(TreeError::NotFound("no revisions for this entry".into()));
    };
    let number: i64 = params
        .get("number")
        .ok_or_else(|| TreeError::Unprocessable("missing number parameter".into()))?
        .parse()
        .map_err(|_| TreeError::Unprocessable("invalid number parameter".into()))?;
    node.delete_revision(number).await?;
    Ok(Json(json!({"ok": true})).into_response())
}

// ---------------------------------------------------------------------
// Arrays

fn parse_block(raw: &str) -> Result<Vec<usize>> {
    raw.split(',')
        .map(|part| {
            part.trim()
                .parse::<usize>()
                .map_err(|_| TreeError::Unprocessable(format!("invalid block index {raw:?}")))
        })
        .collect()
}

fn parse_slice(raw: &str) -> Result<Vec<Range<u64>>> {
    raw.split(',')
        .map(|part| {
            let (start, end) = part.split_once(':').ok_or_else(|| {
                TreeError::Unprocessable(format!("invalid slice {raw:?}"))
            })?;
            let start: u64 = start.trim().parse().map_err(|_| {
                TreeError::Unprocessable(format!("invalid slice {raw:?}"))
            })?;
            let end: u64 = end.trim().parse().map_err(|_| {
                TreeError::Unprocessable(format!("invalid slice {raw:?}"))
            })?;
            Ok(start..end)
        })
        .collect()
}

async fn entry_array_adapter(entry: &TreeEntry) -> Result<Arc<dyn ArrayAdapter>> {
    let adapter = match entry {
        TreeEntry::Catalog(node) => {
            if node.data_sources().is_empty() {
                return Err(TreeError::Unprocessable("not an array".into()));
            }
            node.get_adapter().await?
        }
        TreeEntry::External { adapter, .. } => adapter.clone(),
    };
    adapter
        .as_array()
        .cloned()
        .ok_or_else(|| TreeError::Unprocessable("not an array".into()))
}

fn etag_for(body: &[u8]) -> String {
    format!("\"{}\"", hex::encode(sha2::Sha256::digest(body)))
}

fn if_none_match_hits(headers: &HeaderMap, etag: &str) -> bool {
    headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            value
                .split(',')
                .any(|candidate| candidate.trim() == etag || candidate.trim() == "*")
        })
        .unwrap_or(false)
}

fn array_response(
    state: &AppState,
    headers: &HeaderMap,
    family: StructureFamily,
    body: Bytes,
) -> Result<Response> {
    let accept = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok());
    let media_type = serialization::negotiate(accept, state.serialization.supported(family))?;
    let encoded =
        serialization::encode(&media_type, &serialization::Payload::Binary(body))?;
    let etag = etag_for(&encoded);
    if if_none_match_hits(headers, &etag) {
        return Ok(StatusCode::NOT_MODIFIED.into_response());
    }
    Ok((
        [
            (header::CONTENT_TYPE, media_type),
            (header::ETAG, etag),
        ],
        encoded,
    )
        .into_response())
}

/// Drop every cached read for this array path.
fn invalidate_array_cache(state: &AppState, path: &str, adapter: &Arc<dyn ArrayAdapter>) {
    let Some(cache) = &state.cache else {
        return;
    };
    cache.discard(&format!("array:{path}:full"));
    if let Structure::Array(structure) = adapter.structure() {
        let counts = structure.block_counts();
        let mut blocks = vec![Vec::new()];
        for count in counts {
            let mut next = Vec::new();
            for prefix in &blocks {
                for index in 0..count {
                    let mut block: Vec<usize> = prefix.clone();
                    block.push(index);
                    next.push(block);
                }
            }
            blocks = next;
        }
        for block in blocks {
            let joined = block
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(",");
            cache.discard(&format!("array:{path}:block:{joined}"));
        }
    }
}

pub async fn array_block_get(
    State(state): State<AppState>,
    Extension(rp): Extension<RequestPrincipal>,
    headers: HeaderMap,
    Path(path): Path<String>,
    axum::extract::Query(params): axum::extract::Query<HashMap<String, String>>,
) -> Result<Response> {
    let entry = resolve_entry(&state, &path).await?;
    authorize(&state, entry.access_blob(), &rp, &[scopes::READ_DATA]).await?;
    let adapter = entry_array_adapter(&entry).await?;
    let block_raw = params
        .get("block")
        .ok_or_else(|| TreeError::Unprocessable("missing block parameter".into()))?;
    let block = parse_block(block_raw)?;
    let slice = params.get("slice").map(|raw| parse_slice(raw)).transpose()?;

    let cache_key = format!(
        "array:{path}:block:{}",
        block
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(",")
    );
    let cacheable = slice.is_none();
    if cacheable {
        if let Some(cache) = &state.cache {
            if let Some(cached) = cache.get(&cache_key) {
                return array_response(&state, &headers, entry.structure_family(), cached);
            }
        }
    }
    let start = Instant::now();
    let body = adapter.read_block(&block, slice.as_deref()).await?;
    if cacheable {
        if let Some(cache) = &state.cache {
            cache.put(&cache_key, body.clone(), start.elapsed().as_secs_f64());
        }
    }
    array_response(&state, &headers, entry.structure_family(), body)
}

pub async fn array_full_get(
    State(state): State<AppState>,
    Extension(rp): Extension<RequestPrincipal>,
    headers: HeaderMap,
    Path(path): Path<String>,
    axum::extract::Query(params): axum::extract::Query<HashMap<String, String>>,
) -> Result<Response> {
    let entry = resolve_entry(&state, &path).await?;
    authorize(&state, entry.access_blob(), &rp, &[scopes::READ_DATA]).await?;
    let adapter = entry_array_adapter(&entry).await?;
    let slice = params.get("slice").map(|raw| parse_slice(raw)).transpose()?;

    let cache_key = format!("array:{path}:full");
    let cacheable = slice.is_none();
    if cacheable {
        if let Some(cache) = &state.cache {
            if let Some(cached) = cache.get(&cache_key) {
                return array_response(&state, &headers, entry.structure_family(), cached);
            }
        }
    }
    let start = Instant::now();
    let body = adapter.read(slice.as_deref()).await?;
    if cacheable {
        if let Some(cache) = &state.cache {
            cache.put(&cache_key, body.clone(), start.elapsed().as_secs_f64());
        }
    }
    array_response(&state, &headers, entry.structure_family(), body)
}

pub async fn array_block_put(
    State(state): State<AppState>,
    Extension(rp): Extension<RequestPrincipal>,
    Path(path): Path<String>,
    axum::extract::Query(params): axum::extract::Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Response> {
    let entry = resolve_entry(&state, &path).await?;
    authorize(&state, entry.access_blob(), &rp, &[scopes::WRITE_DATA]).await?;
    let adapter = entry_array_adapter(&entry).await?;
    let block_raw = params
        .get("block")
        .ok_or_else(|| TreeError::Unprocessable("missing block parameter".into()))?;
    let block = parse_block(block_raw)?;
    adapter.write_block(&block, body).await?;
    invalidate_array_cache(&state, &path, &adapter);
    Ok(Json(json!({"ok": true})).into_response())
}

pub async fn array_full_put(
    State(state): State<AppState>,
    Extension(rp): Extension<RequestPrincipal>,
    Path(path): Path<String>,
    body: Bytes,
) -> Result<Response> {
    let entry = resolve_entry(&state, &path).await?;
    authorize(&state, entry.access_blob(), &rp, &[scopes::WRITE_DATA]).await?;
    let adapter = entry_array_adapter(&entry).await?;
    adapter.write(body).await?;
    invalidate_array_cache(&state, &path, &adapter);
    Ok(Json(json!({"ok": true})).into_response())
}

// ---------------------------------------------------------------------
// Tables

async fn entry_table_adapter(
    entry: &TreeEntry,
) -> Result<Arc<dyn TableAdapter>> {
    let adapter = match entry {
        TreeEntry::Catalog(node) => {
            if node.data_sources().is_empty() {
                return Err(TreeError::Unprocessable("not a table".into()));
            }
            node.get_adapter().await?
        }
        TreeEntry::External { adapter, .. } => adapter.clone(),
    };
    adapter
        .as_table()
        .cloned()
        .ok_or_else(|| TreeError::Unprocessable("not a table".into()))
}

fn table_response(
    state: &AppState,
    headers: &HeaderMap,
    rows: Vec<JsonValue>,
) -> Result<Response> {
    let accept = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok());
    let media_type = serialization::negotiate(
        accept,
        state.serialization.supported(StructureFamily::Table),
    )?;
    let body = serialization::encode(&media_type, &serialization::Payload::Rows(rows))?;
    Ok(([(header::CONTENT_TYPE, media_type)], body).into_response())
}

fn columns_from_pairs(pairs: &[(String, String)]) -> Option<Vec<String>> {
    let columns: Vec<String> = pairs
        .iter()
        .filter(|(key, _)| key == "column")
        .map(|(_, value)| value.clone())
        .collect();
    if columns.is_empty() {
        None
    } else {
        Some(columns)
    }
}

pub async fn table_partition_get(
    State(state): State<AppState>,
    Extension(rp): Extension<RequestPrincipal>,
    headers: HeaderMap,
    Path(path): Path<String>,
    RawQuery(raw_query): RawQuery,
) -> Result<Response> {
    let pairs = parse_query_pairs(&raw_query);
    let params: HashMap<String, String> = pairs.iter().cloned().collect();
    let entry = resolve_entry(&state, &path).await?;
    authorize(&state, entry.access_blob(), &rp, &[scopes::READ_DATA]).await?;
    let adapter = entry_table_adapter(&entry).await?;
    let partition: usize = params
        .get("partition")
        .ok_or_else(|| TreeError::Unprocessable("missing partition parameter".into()))?
        .parse()
        .map_err(|_| TreeError::Unprocessable("invalid partition parameter".into()))?;
    let columns = columns_from_pairs(&pairs);
    let rows = adapter.read_partition(partition, columns.as_deref()).await?;
    table_response(&state, &headers, rows)
}

pub async fn table_full_get(
    State(state): State<AppState>,
    Extension(rp): Extension<RequestPrincipal>,
    headers: HeaderMap,
    Path(path): Path<String>,
    RawQuery(raw_query): RawQuery,
) -> Result<Response> {
    let pairs = parse_query_pairs(&raw_query);
    let entry = resolve_entry(&state, &path).await?;
    authorize(&state, entry.access_blob(), &rp, &[scopes::READ_DATA]).await?;
    let adapter = entry_table_adapter(&entry).await?;
    let columns = columns_from_pairs(&pairs);
    let rows = adapter.read(columns.as_deref()).await?;
    table_response(&state, &headers, rows)
}

#[derive(Debug, Deserialize)]
pub struct TableWriteBody {
    pub rows: Vec<JsonValue>,
    #[serde(default)]
    pub partition: Option<usize>,
}

pub async fn table_full_put(
    State(state): State<AppState>,
    Extension(rp): Extension<RequestPrincipal>,
    Path(path): Path<String>,
    Json(body): Json<TableWriteBody>,
) -> Result<Response> {
    let entry = resolve_entry(&state, &path).await?;
    authorize(&state, entry.access_blob(), &rp, &[scopes::WRITE_DATA]).await?;
    let adapter = entry_table_adapter(&entry).await?;
    match body.partition {
        Some(partition) => adapter.write_partition(partition, &body.rows).await?,
        None => adapter.write(&body.rows).await?,
    }
    Ok(Json(json!({"ok": true})).into_response())
}
