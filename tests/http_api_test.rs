// End-to-end HTTP surface tests against an in-memory catalog in
// single-user mode (no authentication providers configured).

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

use trellis::server::compression::CompressionSettings;
use trellis::{build_router, build_state, AdapterRegistry, OpenAccessPolicy, ServerConfig};

async fn test_app(storage: &TempDir) -> Router {
    let config = ServerConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        database_uri: "sqlite::memory:".into(),
        init_if_not_exists: true,
        readable_storage: vec![],
        writable_storage: Some(storage.path().to_path_buf()),
        authentication: Default::default(),
        access_policy: None,
        compression_minimum_size: 1000,
        object_cache_available_bytes: 1 << 20,
    };
    let registry = Arc::new(AdapterRegistry::with_defaults());
    let state = build_state(&config, registry, Arc::new(OpenAccessPolicy))
        .await
        .unwrap();
    build_router(state, Arc::new(CompressionSettings::new(1000)))
}

async fn body_json(response: axum::response::Response) -> JsonValue {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

fn post_json(uri: &str, body: JsonValue) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn create_container(app: &Router, parent: &str, key: &str, metadata: JsonValue) {
    let uri = if parent.is_empty() {
        "/api/v1/metadata".to_string()
    } else {
        format!("/api/v1/metadata/{parent}")
    };
    let response = app
        .clone()
        .oneshot(post_json(
            &uri,
            json!({
                "key": key,
                "structure_family": "container",
                "metadata": metadata,
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
}

async fn create_array(app: &Router, parent: &str, key: &str, shape: Vec<u64>) {
    let uri = if parent.is_empty() {
        "/api/v1/metadata".to_string()
    } else {
        format!("/api/v1/metadata/{parent}")
    };
    let chunks: Vec<Vec<u64>> = shape.iter().map(|extent| vec![extent / 2; 2]).collect();
    let response = app
        .clone()
        .oneshot(post_json(
            &uri,
            json!({
                "key": key,
                "structure_family": "array",
                "metadata": {},
                "data_sources": [{
                    "structure": {
                        "family": "array",
                        "shape": shape,
                        "chunks": chunks,
                        "data_type": "uint8",
                    },
                }],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_metadata_lifecycle() {
    let storage = TempDir::new().unwrap();
    let app = test_app(&storage).await;

    // Root metadata exists from the start.
    let response = app.clone().oneshot(get("/api/v1/metadata")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let document = body_json(response).await;
    assert_eq!(document["data"]["attributes"]["structure_family"], "container");

    create_container(&app, "", "a", json!({"color": "red"})).await;

    let response = app
        .clone()
        .oneshot(get("/api/v1/metadata/a"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let document = body_json(response).await;
    assert_eq!(document["data"]["id"], "a");
    assert_eq!(document["data"]["attributes"]["metadata"]["color"], "red");

    // Unknown entries are 404.
    let response = app
        .clone()
        .oneshot(get("/api/v1/metadata/missing"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Creating the same key again collides with 409.
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/metadata",
            json!({"key": "a", "structure_family": "container"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_metadata_patch_writes_revision() {
    let storage = TempDir::new().unwrap();
    let app = test_app(&storage).await;
    create_container(&app, "", "a", json!({"v": 1})).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PATCH")
                .uri("/api/v1/metadata/a")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({"metadata": {"v": 2}}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(get("/api/v1/revisions/a"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let document = body_json(response).await;
    assert_eq!(document["data"][0]["revision_number"], 1);
    assert_eq!(document["data"][0]["metadata"]["v"], 1);

    let response = app
        .clone()
        .oneshot(get("/api/v1/metadata/a"))
        .await
        .unwrap();
    let document = body_json(response).await;
    assert_eq!(document["data"]["attributes"]["metadata"]["v"], 2);
}

#[tokio::test]
async fn test_search_with_filters_and_pagination() {
    let storage = TempDir::new().unwrap();
    let app = test_app(&storage).await;
    for (key, color, n) in [("a", "red", 1), ("b", "red", 2), ("c", "blue", 3)] {
        create_container(&app, "", key, json!({"color": color, "n": n})).await;
    }

    // Conjoined filters.
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair(
            "filter",
            &json!({"eq": {"key": "color", "value": "red"}}).to_string(),
        )
        .append_pair(
            "filter",
            &json!({"comparison": {"operator": "ge", "key": "n", "value": 2}}).to_string(),
        )
        .finish();
    let response = app
        .clone()
        .oneshot(get(&format!("/api/v1/search?{query}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let document = body_json(response).await;
    assert_eq!(document["meta"]["count"], 1);
    assert_eq!(document["data"][0]["id"], "b");

    // Pagination links and stability.
    let response = app
        .clone()
        .oneshot(get("/api/v1/search?page[offset]=0&page[limit]=2"))
        .await
        .unwrap();
    let document = body_json(response).await;
    assert_eq!(document["meta"]["count"], 3);
    assert_eq!(document["data"].as_array().unwrap().len(), 2);
    assert!(document["links"]["next"].as_str().is_some());
    assert_eq!(document["links"]["prev"], JsonValue::Null);

    let response = app
        .clone()
        .oneshot(get("/api/v1/search?page[offset]=2&page[limit]=2"))
        .await
        .unwrap();
    let document = body_json(response).await;
    assert_eq!(document["data"].as_array().unwrap().len(), 1);
    assert_eq!(document["links"]["next"], JsonValue::Null);

    // Sorting descending by metadata.
    let response = app
        .clone()
        .oneshot(get("/api/v1/search?sort=-n"))
        .await
        .unwrap();
    let document = body_json(response).await;
    let ids: Vec<&str> = document["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["c", "b", "a"]);
}

#[tokio::test]
async fn test_array_round_trip_block_range_and_etag() {
    let storage = TempDir::new().unwrap();
    let app = test_app(&storage).await;
    create_array(&app, "", "x", vec![4, 4]).await;

    // Write the full array.
    let data: Vec<u8> = (0..16).collect();
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/api/v1/array/full/x")
                .body(Body::from(data.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Full read round-trips.
    let response = app
        .clone()
        .oneshot(get("/api/v1/array/full/x"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("application/octet-stream")
    );
    assert_eq!(body_bytes(response).await, data);

    // Block read: block (0, 1) covers rows 0-1, cols 2-3.
    let response = app
        .clone()
        .oneshot(get("/api/v1/array/block/x?block=0,1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let etag = response
        .headers()
        .get(header::ETAG)
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    assert_eq!(body_bytes(response).await, vec![2, 3, 6, 7]);

    // A matching If-None-Match short-circuits with 304.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/array/block/x?block=0,1")
                .header(header::IF_NONE_MATCH, etag)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);

    // Out-of-range block index is 422.
    let response = app
        .clone()
        .oneshot(get("/api/v1/array/block/x?block=999,999"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let document = body_json(response).await;
    assert!(document["message"]
        .as_str()
        .unwrap()
        .contains("Block index out of range"));

    // Sliced read.
    let response = app
        .clone()
        .oneshot(get("/api/v1/array/full/x?slice=1:3,1:3"))
        .await
        .unwrap();
    assert_eq!(body_bytes(response).await, vec![5, 6, 9, 10]);
}

#[tokio::test]
async fn test_content_negotiation() {
    let storage = TempDir::new().unwrap();
    let app = test_app(&storage).await;
    create_container(&app, "", "a", json!({})).await;

    // Unsupported Accept yields 406 listing the supported types.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/metadata/a")
                .header(header::ACCEPT, "image/png")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
    let document = body_json(response).await;
    assert!(document["message"]
        .as_str()
        .unwrap()
        .contains("application/json"));

    // Msgpack is served on request.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/metadata/a")
                .header(header::ACCEPT, "application/x-msgpack")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = body_bytes(response).await;
    let document: JsonValue = rmp_serde::from_slice(&bytes).unwrap();
    assert_eq!(document["data"]["id"], "a");
}

#[tokio::test]
async fn test_table_round_trip_and_csv() {
    let storage = TempDir::new().unwrap();
    let app = test_app(&storage).await;
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/metadata",
            json!({
                "key": "t",
                "structure_family": "table",
                "data_sources": [{
                    "structure": {
                        "family": "table",
                        "columns": ["x", "y"],
                        "npartitions": 1,
                    },
                }],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/api/v1/table/full/t")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({"rows": [{"x": 1, "y": "a"}, {"x": 2, "y": "b"}]}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(get("/api/v1/table/partition/t?partition=0"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let rows = body_json(response).await;
    assert_eq!(rows[1]["y"], "b");

    // Column projection.
    let response = app
        .clone()
        .oneshot(get("/api/v1/table/full/t?column=x"))
        .await
        .unwrap();
    let rows = body_json(response).await;
    assert_eq!(rows[0], json!({"x": 1}));

    // CSV by content negotiation.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/table/full/t")
                .header(header::ACCEPT, "text/csv")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let text = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(text.starts_with("x,y\n"));

    // Bad partition is 422.
    let response = app
        .clone()
        .oneshot(get("/api/v1/table/partition/t?partition=7"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_delete_tree_guarded_by_internal_assets() {
    let storage = TempDir::new().unwrap();
    let app = test_app(&storage).await;
    create_container(&app, "", "c", json!({})).await;
    create_array(&app, "c", "x", vec![4, 4]).await;

    // Guarded delete refuses with 409.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/v1/metadata/c?tree=true")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // Everything still present.
    let response = app.clone().oneshot(get("/api/v1/metadata/c/x")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Unguarded delete removes rows: 2 nodes + 1 data source + 1 asset.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/v1/metadata/c?tree=true&external_only=false")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let document = body_json(response).await;
    assert_eq!(document["deleted"], 4);

    let response = app.clone().oneshot(get("/api/v1/metadata/c")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_distinct_facets() {
    let storage = TempDir::new().unwrap();
    let app = test_app(&storage).await;
    for (key, color) in [("a", "red"), ("b", "red"), ("c", "blue")] {
        create_container(&app, "", key, json!({"color": color})).await;
    }
    let response = app
        .clone()
        .oneshot(get(
            "/api/v1/distinct?metadata=color&counts=true&structure_families=true",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let document = body_json(response).await;
    let colors = document["metadata"]["color"].as_array().unwrap();
    assert_eq!(colors.len(), 2);
    assert_eq!(document["structure_families"][0]["count"], 3);
}
