// Double-submit cookie CSRF protection.
//
// Cookie-bearing mutating requests must echo the CSRF cookie's value in a
// header or query parameter. Requests without the CSRF cookie get one set
// on the way out.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use base64::Engine;
use rand::RngCore;
use std::collections::HashMap;

use crate::auth::api_keys::digests_match;

pub const CSRF_COOKIE_NAME: &str = "trellis_csrf";
pub const CSRF_HEADER_NAME: &str = "x-csrf";
pub const CSRF_QUERY_PARAMETER: &str = "csrf";
/// Cookies whose presence makes a mutating request require CSRF proof.
const SENSITIVE_COOKIES: &[&str] = &["trellis_api_key"];

fn is_safe_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
    )
}

fn parse_cookies(request: &Request) -> HashMap<String, String> {
    request
        .headers()
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .map(|header| {
            header
                .split(';')
                .filter_map(|pair| {
                    let (name, value) = pair.trim().split_once('=')?;
                    Some((name.to_string(), value.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn query_param(request: &Request, name: &str) -> Option<String> {
    let query = request.uri().query()?;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=')?;
        if key == name {
            return Some(value.to_string());
        }
    }
    None
}

fn new_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn forbidden(message: &'static str) -> Response {
    Response::builder()
        .status(StatusCode::FORBIDDEN)
        .body(Body::from(message))
        .unwrap_or_default()
}

pub async fn csrf_middleware(request: Request, next: Next) -> Response {
    let cookies = parse_cookies(&request);
    let csrf_cookie = cookies.get(CSRF_COOKIE_NAME).cloned();
    let has_sensitive_cookie = SENSITIVE_COOKIES
        .iter()
        .any(|name| cookies.contains_key(*name));

    if !is_safe_method(request.method()) && has_sensitive_cookie {
        let Some(cookie_value) = &csrf_cookie else {
            return forbidden("Expected trellis_csrf cookie");
        };
        let token = request
            .headers()
            .get(CSRF_HEADER_NAME)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string())
            .or_else(|| query_param(&request, CSRF_QUERY_PARAMETER));
        let Some(token) = token else {
            return forbidden("Expected csrf query parameter or x-csrf header");
        };
        if !digests_match(&token, cookie_value) {
            return forbidden("Double-submit CSRF tokens do not match");
        }
    }

    let mut response = next.run(request).await;
    if csrf_cookie.is_none() {
        let cookie = format!(
            "{CSRF_COOKIE_NAME}={}; HttpOnly; SameSite=lax; Path=/",
            new_token()
        );
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{get, post};
    use axum::Router;
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route("/read", get(|| async { "ok" }))
            .route("/write", post(|| async { "written" }))
            .layer(axum::middleware::from_fn(csrf_middleware))
    }

    #[tokio::test]
    async fn test_csrf_cookie_set_when_absent() {
        let response = app()
            .oneshot(Request::builder().uri("/read").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .unwrap();
        assert!(cookie.starts_with("trellis_csrf="));
    }

    #[tokio::test]
    async fn test_mutation_without_sensitive_cookie_passes() {
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/write")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_mutation_with_sensitive_cookie_requires_matching_token() {
        // Missing token: 403.
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/write")
                    .header(
                        header::COOKIE,
                        "trellis_api_key=k; trellis_csrf=token-value",
                    )
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // Mismatched token: 403.
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/write")
                    .header(
                        header::COOKIE,
                        "trellis_api_key=k; trellis_csrf=token-value",
                    )
                    .header(CSRF_HEADER_NAME, "other-value")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // Matching token in header: passes.
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/write")
                    .header(
                        header::COOKIE,
                        "trellis_api_key=k; trellis_csrf=token-value",
                    )
                    .header(CSRF_HEADER_NAME, "token-value")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Matching token in query parameter: passes.
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/write?csrf=token-value")
                    .header(
                        header::COOKIE,
                        "trellis_api_key=k; trellis_csrf=token-value",
                    )
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_sensitive_cookie_without_csrf_cookie_rejected() {
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/write")
                    .header(header::COOKIE, "trellis_api_key=k")
                    .header(CSRF_HEADER_NAME, "anything")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
