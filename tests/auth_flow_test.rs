// Authentication flows over the HTTP surface: password login, token
// refresh rotation, API keys, and anonymous access.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower::ServiceExt;

use trellis::server::compression::CompressionSettings;
use trellis::{
    build_router, build_state, AdapterRegistry, AuthConfig, OpenAccessPolicy, ProviderConfig,
    ProviderMode, ServerConfig,
};

fn toy_auth(allow_anonymous: bool) -> AuthConfig {
    AuthConfig {
        secret_keys: vec!["integration-secret".to_string()],
        providers: vec![ProviderConfig {
            provider: "toy".into(),
            mode: ProviderMode::Password,
            users: BTreeMap::from([
                ("alice".to_string(), "secret1".to_string()),
                ("bob".to_string(), "secret2".to_string()),
            ]),
        }],
        allow_anonymous_access: allow_anonymous,
        ..Default::default()
    }
}

async fn test_app(allow_anonymous: bool) -> Router {
    let config = ServerConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        database_uri: "sqlite::memory:".into(),
        init_if_not_exists: true,
        readable_storage: vec![],
        writable_storage: None,
        authentication: toy_auth(allow_anonymous),
        access_policy: None,
        compression_minimum_size: 1000,
        object_cache_available_bytes: 0,
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

fn post_json(uri: &str, body: JsonValue) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn login(app: &Router, username: &str, password: &str) -> JsonValue {
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/auth/provider/toy/token",
            json!({"username": username, "password": password}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await
}

#[tokio::test]
async fn test_login_and_whoami() {
    let app = test_app(false).await;
    let tokens = login(&app, "alice", "secret1").await;
    assert_eq!(tokens["token_type"], "bearer");
    assert!(tokens["expires_in"].as_i64().unwrap() > 0);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/auth/whoami")
                .header(
                    header::AUTHORIZATION,
                    format!("Bearer {}", tokens["access_token"].as_str().unwrap()),
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let who = body_json(response).await;
    assert_eq!(who["type"], "user");
    assert_eq!(who["identities"][0]["external_id"], "alice");
    assert!(who["scopes"]
        .as_array()
        .unwrap()
        .contains(&json!("read:metadata")));
}

#[tokio::test]
async fn test_bad_credentials_rejected() {
    let app = test_app(false).await;
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/auth/provider/toy/token",
            json!({"username": "alice", "password": "wrong"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/auth/provider/nowhere/token",
            json!({"username": "alice", "password": "secret1"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_anonymous_access_gated_by_config() {
    // Without anonymous access every tree route is 401.
    let app = test_app(false).await;
    let response = app
        .clone()
        .oneshot(Request::builder().uri("/api/v1/metadata").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // With anonymous access, reads work.
    let app = test_app(true).await;
    let response = app
        .clone()
        .oneshot(Request::builder().uri("/api/v1/metadata").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // But mutations do not: anonymous principals lack the create scope.
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/metadata",
            json!({"key": "a", "structure_family": "container"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_refresh_rotation() {
    let app = test_app(false).await;
    let tokens = login(&app, "alice", "secret1").await;
    let original_refresh = tokens["refresh_token"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/auth/session/refresh",
            json!({"refresh_token": original_refresh}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let rotated = body_json(response).await;
    let rotated_refresh = rotated["refresh_token"].as_str().unwrap().to_string();
    assert_ne!(rotated_refresh, original_refresh);

    // The new access token works.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/auth/whoami")
                .header(
                    header::AUTHORIZATION,
                    format!("Bearer {}", rotated["access_token"].as_str().unwrap()),
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Replaying the rotated-out token is 401 and revokes the chain.
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/auth/session/refresh",
            json!({"refresh_token": original_refresh}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/auth/session/refresh",
            json!({"refresh_token": rotated_refresh}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_garbage_refresh_token_rejected() {
    let app = test_app(false).await;
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/auth/session/refresh",
            json!({"refresh_token": "not-a-jwt"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_api_key_lifecycle_over_http() {
    let app = test_app(false).await;
    let tokens = login(&app, "alice", "secret1").await;
    let bearer = format!("Bearer {}", tokens["access_token"].as_str().unwrap());

    // Create a key narrowed to read-only scopes.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/auth/apikey")
                .header(header::AUTHORIZATION, &bearer)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({"scopes": ["read:metadata"], "note": "ci"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    let secret = created["secret"].as_str().unwrap().to_string();
    assert_eq!(created["first_eight"], secret[..8]);

    // The key authenticates via the Apikey authorization scheme.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/metadata")
                .header(header::AUTHORIZATION, format!("Apikey {secret}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // But it cannot create nodes: the key's scopes exclude create.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/metadata")
                .header(header::AUTHORIZATION, format!("Apikey {secret}"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({"key": "a", "structure_family": "container"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // A wrong key is 401.
    let mut forged = secret.clone();
    let replacement = if &secret[10..12] == "00" { "11" } else { "00" };
    forged.replace_range(10..12, replacement);
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/metadata")
                .header(header::AUTHORIZATION, format!("Apikey {forged}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    // Either the digest no longer matches, or (unlikely) the forged hex
    // still decodes; the digest check is what rejects it.
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Revoke, after which the key stops working.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!(
                    "/api/v1/auth/apikey?first_eight={}",
                    created["first_eight"].as_str().unwrap()
                ))
                .header(header::AUTHORIZATION, &bearer)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/metadata")
                .header(header::AUTHORIZATION, format!("Apikey {secret}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_api_key_query_parameter_sets_cookie() {
    let app = test_app(false).await;
    let tokens = login(&app, "alice", "secret1").await;
    let bearer = format!("Bearer {}", tokens["access_token"].as_str().unwrap());
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/auth/apikey")
                .header(header::AUTHORIZATION, &bearer)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let secret = body_json(response).await["secret"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/metadata?api_key={secret}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cookies: Vec<&str> = response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    assert!(cookies
        .iter()
        .any(|cookie| cookie.starts_with("trellis_api_key=")));
}
