use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, uri::PathAndQuery, HeaderValue, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use service_core::error::{ApiError, AppError};

use crate::services::{
    handshake::{HandshakeOutcome, HandshakeParams, InboundRequest},
    ServiceError,
};
use crate::AppState;

fn is_form(req: &Request) -> bool {
    req.headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"))
}

/// Largest form body buffered while stripping handshake params.
pub const MAX_FORM_BYTES: usize = 64 * 1024;

pub(crate) fn request_host(req: &Request) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
}

/// Rebuild the URI without handshake params in the query string.
fn strip_query(uri: &Uri, params: &mut HandshakeParams) -> Result<Uri, AppError> {
    let Some(query) = uri.query() else {
        return Ok(uri.clone());
    };
    let Some(rest) = params.strip_encoded(query) else {
        return Ok(uri.clone());
    };

    let path_and_query = if rest.is_empty() {
        uri.path().to_string()
    } else {
        format!("{}?{}", uri.path(), rest)
    };
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(
        PathAndQuery::try_from(path_and_query)
            .map_err(|e| AppError::BadRequest(anyhow::anyhow!("Invalid request URI: {}", e)))?,
    );
    Uri::from_parts(parts)
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!("Invalid request URI: {}", e)))
}

/// Resolves the instance from `Host`, strips handshake params and attaches a `RequestContext`.
pub async fn handshake_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let host = request_host(&req).ok_or(ServiceError::InstanceNotFound)?;
    let instance = state.instances.resolve_host(&host).await?;

    let mut params = HandshakeParams::default();
    let form = is_form(&req);
    let (mut parts, body) = req.into_parts();
    parts.uri = strip_query(&parts.uri, &mut params)?;

    let body = if form {
        let bytes = Limited::new(body, MAX_FORM_BYTES)
            .collect()
            .await
            .map_err(|e| {
                if e.is::<LengthLimitError>() {
                    AppError::from(ApiError::new(
                        StatusCode::PAYLOAD_TOO_LARGE,
                        "request_body_too_large",
                        "Request body too large",
                        format!("Form bodies are limited to {} bytes", MAX_FORM_BYTES),
                    ))
                } else {
                    AppError::BadRequest(anyhow::anyhow!("Failed to read body: {}", e))
                }
            })?
            .to_bytes();
        let stripped = std::str::from_utf8(&bytes)
            .ok()
            .and_then(|text| params.strip_encoded(text));
        match stripped {
            Some(rest) => {
                parts.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(rest.len()));
                Body::from(rest)
            }
            None => Body::from(bytes),
        }
    } else {
        body
    };

    let request_url = format!(
        "https://{}{}",
        host,
        parts
            .uri
            .path_and_query()
            .map(PathAndQuery::as_str)
            .unwrap_or("/")
    );

    let outcome = state
        .handshake
        .resolve(
            instance,
            InboundRequest {
                method: &parts.method,
                path: parts.uri.path(),
                headers: &parts.headers,
                params: &params,
                request_url: &request_url,
            },
        )
        .await?;

    let context = match outcome {
        HandshakeOutcome::Redirect(url) => return Ok(Redirect::temporary(&url).into_response()),
        HandshakeOutcome::Proceed(context) => *context,
    };

    let refreshed_token = context.refreshed_token.clone();
    parts.extensions.insert(context);

    let mut response = next.run(Request::from_parts(parts, body)).await;
    if let Some(token) = refreshed_token {
        if let Ok(value) = HeaderValue::from_str(&token) {
            response.headers_mut().insert(header::AUTHORIZATION, value);
        }
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_query_rebuilds_uri() {
        let uri: Uri = "/v1/client?__clerk_db_jwt=abc&x=1".parse().unwrap();
        let mut params = HandshakeParams::default();
        let stripped = strip_query(&uri, &mut params).unwrap();
        assert_eq!(stripped.to_string(), "/v1/client?x=1");
        assert_eq!(params.dev_browser_token.as_deref(), Some("abc"));

        let uri: Uri = "/v1/client?_is_native=true".parse().unwrap();
        let stripped = strip_query(&uri, &mut params).unwrap();
        assert_eq!(stripped.to_string(), "/v1/client");
        assert!(params.is_native);
    }
}
