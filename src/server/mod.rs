// HTTP server assembly: application state, router, middleware stack, and
// the long-running serve loop with its background scheduler.

pub mod auth_routes;
pub mod compression;
pub mod csrf;
pub mod extract;
pub mod pagination;
pub mod routes;
pub mod serialization;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::access::tags::{StaticGroups, TagBasedAccessPolicy};
use crate::access::{AccessPolicy, OpenAccessPolicy};
use crate::auth::AuthService;
use crate::catalog::{CatalogContext, CatalogNode};
use crate::config::ServerConfig;
use crate::dispatch::AdapterRegistry;
use crate::errors::Result;
use crate::object_cache::ObjectCache;
use crate::scheduler::Scheduler;

use compression::{compression_middleware, CompressionSettings};
use csrf::csrf_middleware;
use extract::authenticate;

#[derive(Clone)]
pub struct AppState {
    pub root: CatalogNode,
    pub auth: Arc<AuthService>,
    pub policy: Arc<dyn AccessPolicy>,
    pub serialization: Arc<serialization::SerializationRegistry>,
    pub cache: Option<Arc<ObjectCache>>,
    pub allow_anonymous: bool,
}

/// Connect the catalog, prepare auth, and assemble shared state.
pub async fn build_state(
    config: &ServerConfig,
    registry: Arc<AdapterRegistry>,
    policy: Arc<dyn AccessPolicy>,
) -> Result<AppState> {
    config.validate()?;
    let context = CatalogContext::connect(
        &config.database_uri,
        config.writable_storage.clone(),
        config.readable_storage.clone(),
        registry,
        config.init_if_not_exists,
    )
    .await?;
    let auth = AuthService::new(
        context.pool.clone(),
        context.dialect,
        config.authentication.clone(),
    )?;
    auth.ensure_default_roles().await?;
    auth.ensure_admins(&config.authentication.admins).await?;
    let root = CatalogNode::root(Arc::clone(&context), json!({}), vec![]);
    let cache = if config.object_cache_available_bytes > 0 {
        Some(Arc::new(ObjectCache::new(
            config.object_cache_available_bytes,
        )))
    } else {
        None
    };
    Ok(AppState {
        root,
        auth: Arc::new(auth),
        policy,
        serialization: Arc::new(serialization::SerializationRegistry::default()),
        cache,
        allow_anonymous: config.authentication.allow_anonymous_access,
    })
}

pub fn build_router(state: AppState, settings: Arc<CompressionSettings>) -> Router {
    let router: Router<AppState> = Router::new()
        .route("/api/v1", get(routes::service_index))
        .route(
            "/api/v1/metadata",
            get(routes::node_metadata_root).post(routes::create_node_root),
        )
        .route(
            "/api/v1/metadata/*path",
            get(routes::node_metadata)
                .post(routes::create_node)
                .patch(routes::patch_node)
                .delete(routes::delete_node),
        )
        .route("/api/v1/search", get(routes::search_root))
        .route("/api/v1/search/*path", get(routes::search))
        .route("/api/v1/distinct", get(routes::distinct_root))
        .route("/api/v1/distinct/*path", get(routes::distinct))
        .route(
            "/api/v1/revisions/*path",
            get(routes::revisions).delete(routes::delete_revision),
        )
        .route(
            "/api/v1/array/block/*path",
            get(routes::array_block_get).put(routes::array_block_put),
        )
        .route(
            "/api/v1/array/full/*path",
            get(routes::array_full_get).put(routes::array_full_put),
        )
        .route(
            "/api/v1/table/partition/*path",
            get(routes::table_partition_get),
        )
        .route(
            "/api/v1/table/full/*path",
            get(routes::table_full_get).put(routes::table_full_put),
        )
        .route(
            "/api/v1/auth/provider/:provider/token",
            post(auth_routes::provider_token),
        )
        .route(
            "/api/v1/auth/provider/:provider/code",
            post(auth_routes::provider_code),
        )
        .route(
            "/api/v1/auth/session/refresh",
            post(auth_routes::session_refresh),
        )
        .route(
            "/api/v1/auth/session/revoke",
            post(auth_routes::session_revoke),
        )
        .route("/api/v1/auth/whoami", get(auth_routes::whoami))
        .route(
            "/api/v1/auth/apikey",
            post(auth_routes::create_api_key)
                .get(auth_routes::list_api_keys)
                .delete(auth_routes::revoke_api_key),
        )
        // Innermost first: authentication, then CSRF, then compression,
        // then tracing/CORS at the edge.
        .layer(middleware::from_fn_with_state(state.clone(), authenticate));
    let _ = settings;
    router.with_state(state)
}

/// Compile the configured policy. The concrete tag policy handle is
/// returned alongside the trait object so the refresh tasks act on the
/// same instance the request path reads.
fn build_policy(
    config: &ServerConfig,
) -> Result<(Arc<dyn AccessPolicy>, Option<Arc<TagBasedAccessPolicy>>)> {
    match &config.access_policy {
        Some(policy_config) => {
            let groups = Arc::new(StaticGroups(Default::default()));
            let policy = Arc::new(TagBasedAccessPolicy::new(
                policy_config.provider.clone(),
                policy_config.tag_definitions.clone(),
                groups,
                policy_config.scopes.clone(),
            )?);
            Ok((Arc::clone(&policy) as Arc<dyn AccessPolicy>, Some(policy)))
        }
        None => Ok((Arc::new(OpenAccessPolicy), None)),
    }
}

fn register_background_tasks(
    scheduler: &mut Scheduler,
    state: &AppState,
    tag_policy: Option<Arc<TagBasedAccessPolicy>>,
    config: &ServerConfig,
) {
    let auth = Arc::clone(&state.auth);
    scheduler.register("purge-expired-sessions", 10, move || {
        let auth = Arc::clone(&auth);
        async move {
            match auth.purge_expired_sessions().await {
                Ok(purged) if purged > 0 => {
                    info!(purged, "purged expired sessions")
                }
                Ok(_) => {}
                Err(err) => tracing::error!(%err, "failed to purge sessions"),
            }
        }
    });
    let auth = Arc::clone(&state.auth);
    scheduler.register("purge-expired-api-keys", 10, move || {
        let auth = Arc::clone(&auth);
        async move {
            match auth.purge_expired_api_keys().await {
                Ok(purged) if purged > 0 => {
                    info!(purged, "purged expired API keys")
                }
                Ok(_) => {}
                Err(err) => tracing::error!(%err, "failed to purge API keys"),
            }
        }
    });

    if let (Some(policy), Some(policy_config)) = (tag_policy, &config.access_policy) {
        // The refresh cycles recompile from the supplied definitions; a
        // site-specific deployment would fetch fresh definitions here.
        let definitions = policy_config.tag_definitions.clone();
        let reload_policy = Arc::clone(&policy);
        let reload_definitions = definitions.clone();
        scheduler.register(
            "policy-full-reload",
            policy_config.reload_period_minutes as i64,
            move || {
                let policy = Arc::clone(&reload_policy);
                let definitions = reload_definitions.clone();
                async move {
                    if let Err(err) = policy.reload(definitions).await {
                        tracing::error!(%err, "policy reload failed; keeping loaded state");
                    }
                }
            },
        );
        scheduler.register(
            "policy-partial-update",
            policy_config.update_period_minutes as i64,
            move || {
                let policy = Arc::clone(&policy);
                let definitions = definitions.clone();
                async move {
                    if let Err(err) = policy.update(definitions).await {
                        tracing::error!(%err, "policy update failed; keeping loaded state");
                    }
                }
            },
        );
    }
}

/// Serve until interrupted. Background tasks are cancelled before the
/// database pool is disposed.
pub async fn run(config: ServerConfig) -> Result<()> {
    let registry = Arc::new(AdapterRegistry::with_defaults());
    let (policy, tag_policy) = build_policy(&config)?;
    let state = build_state(&config, registry, policy).await?;
    let settings = Arc::new(CompressionSettings::new(config.compression_minimum_size));

    let mut scheduler = Scheduler::new();
    register_background_tasks(&mut scheduler, &state, tag_policy, &config);
    let scheduler_handle = scheduler.spawn();

    let pool = state.root.context().pool.clone();
    let app = build_router(state, settings);
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .map_err(anyhow::Error::from)?;
    info!(listen = %config.listen, "trellis server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .map_err(anyhow::Error::from)?;

    scheduler_handle.abort();
    pool.close().await;
    Ok(())
}
