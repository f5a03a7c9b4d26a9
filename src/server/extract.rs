// Authentication middleware: resolve the request's principal from a
// bearer token, an API key header, an api_key query parameter, or an API
// key cookie, and stash it in request extensions for the handlers.

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use super::AppState;
use crate::auth::PrincipalContext;
use crate::errors::{Result, TreeError};

pub const API_KEY_COOKIE_NAME: &str = "trellis_api_key";
pub const API_KEY_QUERY_PARAMETER: &str = "api_key";

/// The resolved principal, if any credential was presented.
#[derive(Clone)]
pub struct RequestPrincipal(pub Option<PrincipalContext>);

fn query_param(request: &Request, name: &str) -> Option<String> {
    let query = request.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn cookie_value(request: &Request, name: &str) -> Option<String> {
    let header = request.headers().get(header::COOKIE)?.to_str().ok()?;
    header.split(';').find_map(|pair| {
        let (cookie_name, value) = pair.trim().split_once('=')?;
        (cookie_name == name).then(|| value.to_string())
    })
}

async fn resolve(
    state: &AppState,
    request: &Request,
) -> Result<(Option<PrincipalContext>, Option<String>)> {
    if let Some(value) = request.headers().get(header::AUTHORIZATION) {
        let value = value
            .to_str()
            .map_err(|_| TreeError::AuthRequired)?
            .to_string();
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Ok((Some(state.auth.authenticate_bearer(token).await?), None));
        }
        if let Some(key) = value.strip_prefix("Apikey ") {
            return Ok((Some(state.auth.authenticate_api_key(key).await?), None));
        }
        return Err(TreeError::AuthRequired);
    }
    // An api_key query parameter authenticates and moves into a cookie so
    // that subsequent requests (and the CSRF check) see it there.
    if let Some(key) = query_param(request, API_KEY_QUERY_PARAMETER) {
        let context = state.auth.authenticate_api_key(&key).await?;
        return Ok((Some(context), Some(key)));
    }
    if let Some(key) = cookie_value(request, API_KEY_COOKIE_NAME) {
        return Ok((Some(state.auth.authenticate_api_key(&key).await?), None));
    }
    Ok((None, None))
}

pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    match resolve(&state, &request).await {
        Ok((principal, api_key_to_cookie)) => {
            if let Some(context) = &principal {
                debug!(
                    principal = %context.principal.uuid,
                    "authenticated request"
                );
            }
            request.extensions_mut().insert(RequestPrincipal(principal));
            let mut response = next.run(request).await;
            if let Some(key) = api_key_to_cookie {
                let cookie = format!(
                    "{API_KEY_COOKIE_NAME}={key}; HttpOnly; SameSite=lax; Path=/"
                );
                if let Ok(value) = HeaderValue::from_str(&cookie) {
                    response.headers_mut().append(header::SET_COOKIE, value);
                }
            }
            response
        }
        Err(err) => err.into_response(),
    }
}
