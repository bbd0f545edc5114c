//! CORS for the frontend API, decided per instance with the same origin rules as the handshake.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::handshake::request_host;
use crate::services::handshake::{validate_origin, PROXY_URL_HEADERS};
use crate::AppState;

const ALLOW_METHODS: &str = "GET, POST, PATCH, DELETE, OPTIONS";
const ALLOW_HEADERS: &str = "authorization, content-type, x-clerk-proxy-url, clerk-proxy-url";
const MAX_AGE_SECS: &str = "600";

fn is_preflight(req: &Request) -> bool {
    req.method() == Method::OPTIONS
        && req
            .headers()
            .contains_key(header::ACCESS_CONTROL_REQUEST_METHOD)
}

fn single_origin(headers: &HeaderMap) -> Option<HeaderValue> {
    let mut origins = headers.get_all(header::ORIGIN).iter();
    let origin = origins.next()?;
    match origins.next() {
        Some(_) => None,
        None => Some(origin.clone()),
    }
}

/// The origin, if the instance serving `host` trusts it.
async fn trusted_origin(state: &AppState, host: &str, origin: HeaderValue) -> Option<HeaderValue> {
    let instance = state.instances.resolve_host(host).await.ok()?;
    match validate_origin(&instance, origin.to_str().ok()?) {
        Ok(()) => Some(origin),
        Err(_) => {
            tracing::debug!(origin = ?origin, "Origin not trusted for CORS");
            None
        }
    }
}

fn allow_origin(headers: &mut HeaderMap, origin: Option<HeaderValue>) {
    headers.append(header::VARY, HeaderValue::from_static("origin"));
    if let Some(origin) = origin {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
    }
}

/// Answers preflights and echoes trusted origins on every frontend response, errors included.
pub async fn frontend_cors_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let preflight = is_preflight(&req);
    let origin = single_origin(req.headers());
    let host = request_host(&req);
    let origin = match (origin, host) {
        (Some(origin), Some(host)) => trusted_origin(&state, &host, origin).await,
        _ => None,
    };

    if preflight {
        let mut response = StatusCode::NO_CONTENT.into_response();
        let headers = response.headers_mut();
        if origin.is_some() {
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static(ALLOW_METHODS),
            );
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static(ALLOW_HEADERS),
            );
            headers.insert(
                header::ACCESS_CONTROL_MAX_AGE,
                HeaderValue::from_static(MAX_AGE_SECS),
            );
        }
        allow_origin(headers, origin);
        return response;
    }

    let trusted = origin.is_some();
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    allow_origin(headers, origin);
    if trusted {
        headers.insert(
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_static("authorization"),
        );
    }
    response
}
