// Authentication routes: provider login, session refresh/revoke, whoami,
// and API key management.

use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

use super::extract::RequestPrincipal;
use super::AppState;
use crate::auth::AuthService;
use crate::errors::{Result, TreeError};
use crate::scopes;

fn require_principal(rp: &RequestPrincipal) -> Result<&crate::auth::PrincipalContext> {
    rp.0.as_ref().ok_or(TreeError::AuthRequired)
}

#[derive(Debug, Deserialize)]
pub struct CredentialsBody {
    pub username: String,
    pub password: String,
}

pub async fn provider_token(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Json(body): Json<CredentialsBody>,
) -> Result<Response> {
    let provider_config = state
        .auth
        .config
        .providers
        .iter()
        .find(|p| p.provider == provider)
        .ok_or_else(|| TreeError::NotFound(format!("no provider {provider:?}")))?
        .clone();
    let tokens = state
        .auth
        .authenticate_password(&provider_config, &body.username, &body.password)
        .await?;
    Ok(Json(tokens).into_response())
}

#[derive(Debug, Deserialize)]
pub struct CodeBody {
    pub code: String,
}

pub async fn provider_code(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Json(body): Json<CodeBody>,
) -> Result<Response> {
    let provider_config = state
        .auth
        .config
        .providers
        .iter()
        .find(|p| p.provider == provider)
        .ok_or_else(|| TreeError::NotFound(format!("no provider {provider:?}")))?
        .clone();
    let tokens = state
        .auth
        .authenticate_code(&provider_config, &body.code)
        .await?;
    Ok(Json(tokens).into_response())
}

#[derive(Debug, Deserialize)]
pub struct RefreshBody {
    pub refresh_token: String,
}

pub async fn session_refresh(
    State(state): State<AppState>,
    Json(body): Json<RefreshBody>,
) -> Result<Response> {
    let tokens = state.auth.refresh(&body.refresh_token).await?;
    Ok(Json(tokens).into_response())
}

#[derive(Debug, Deserialize)]
pub struct RevokeBody {
    pub session: Uuid,
}

pub async fn session_revoke(
    State(state): State<AppState>,
    Extension(rp): Extension<RequestPrincipal>,
    Json(body): Json<RevokeBody>,
) -> Result<Response> {
    let context = require_principal(&rp)?;
    // A principal may revoke its own sessions; admins may revoke any.
    let session = state
        .auth
        .get_session(&body.session)
        .await?
        .ok_or_else(|| TreeError::NotFound(format!("no session {}", body.session)))?;
    let is_admin = context.scopes.contains(scopes::ADMIN_APIKEYS);
    if session.principal_id != context.principal.id && !is_admin {
        return Err(TreeError::Forbidden(
            "cannot revoke another principal's session".into(),
        ));
    }
    state.auth.revoke_session(&body.session).await?;
    Ok(Json(json!({"ok": true})).into_response())
}

pub async fn whoami(Extension(rp): Extension<RequestPrincipal>) -> Result<Response> {
    match &rp.0 {
        Some(context) => {
            let mut document = AuthService::describe_principal(&context.principal);
            document["scopes"] = json!(context.scopes);
            Ok(Json(document).into_response())
        }
        None => Ok(Json(json!({"type": "anonymous"})).into_response()),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyBody {
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub access_tags: Option<Vec<String>>,
}

pub async fn create_api_key(
    State(state): State<AppState>,
    Extension(rp): Extension<RequestPrincipal>,
    Json(body): Json<CreateApiKeyBody>,
) -> Result<Response> {
    let context = require_principal(&rp)?;
    if !context.scopes.contains(scopes::APIKEYS) {
        return Err(TreeError::Forbidden(format!(
            "missing scope {}",
            scopes::APIKEYS
        )));
    }
    let (secret, info) = state
        .auth
        .create_api_key(
            &context.principal,
            body.scopes,
            body.expires_in,
            body.note,
            body.access_tags,
        )
        .await?;
    // The secret appears in this response and nowhere else, ever.
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "secret": secret,
            "first_eight": info.first_eight,
            "expiration_time": info.expiration_time,
            "note": info.note,
            "scopes": info.scopes,
            "access_tags": info.access_tags,
        })),
    )
        .into_response())
}

pub async fn list_api_keys(
    State(state): State<AppState>,
    Extension(rp): Extension<RequestPrincipal>,
) -> Result<Response> {
    let context = require_principal(&rp)?;
    if !context.scopes.contains(scopes::APIKEYS) {
        return Err(TreeError::Forbidden(format!(
            "missing scope {}",
            scopes::APIKEYS
        )));
    }
    let keys = state.auth.list_api_keys(context.principal.id).await?;
    Ok(Json(json!({"data": keys})).into_response())
}

pub async fn revoke_api_key(
    State(state): State<AppState>,
    Extension(rp): Extension<RequestPrincipal>,
    axum::extract::Query(params): axum::extract::Query<HashMap<String, String>>,
) -> Result<Response> {
    let context = require_principal(&rp)?;
    if !context.scopes.contains(scopes::APIKEYS) {
        return Err(TreeError::Forbidden(format!(
            "missing scope {}",
            scopes::APIKEYS
        )));
    }
    let first_eight = params
        .get("first_eight")
        .ok_or_else(|| TreeError::Unprocessable("missing first_eight parameter".into()))?;
    state
        .auth
        .revoke_api_key(context.principal.id, first_eight)
        .await?;
    Ok(Json(json!({"ok": true})).into_response())
}
