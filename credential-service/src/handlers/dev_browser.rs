use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect},
    Extension, Json,
};
use axum_extra::extract::cookie::CookieJar;
use service_core::error::AppError;
use url::Url;

use crate::{
    dtos::{
        client::{DeviceResponse, RedirectQuery},
        ErrorResponse,
    },
    handlers::client::device_cookie,
    models::{DeviceKind, Instance},
    services::{
        handshake::{validate_origin, DEV_BROWSER_COOKIE},
        RequestContext, ServiceError,
    },
    AppState,
};

const INIT_PATH: &str = "/v1/dev_browser/init";

/// `redirect_url` must be an absolute http(s) URL on an origin the instance trusts.
fn parse_redirect_url(instance: &Instance, raw: &str) -> Result<Url, ServiceError> {
    let url = Url::parse(raw.trim()).map_err(|_| ServiceError::InvalidRedirectUrl)?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(ServiceError::InvalidRedirectUrl);
    }
    validate_origin(instance, &url.origin().ascii_serialization()).map_err(|_| {
        tracing::warn!(redirect_url = %url, "Rejected dev browser redirect to an untrusted origin");
        ServiceError::InvalidRedirectUrl
    })?;
    Ok(url)
}

fn require_development(ctx: &RequestContext) -> Result<(), AppError> {
    if ctx.instance.is_production() {
        return Err(AppError::NotFound(anyhow::anyhow!(
            "Dev browsers are only available on development instances"
        )));
    }
    Ok(())
}

/// Current dev browser token for this request, creating a dev browser if there is none.
async fn dev_browser_token(
    state: &AppState,
    ctx: &RequestContext,
) -> Result<(StatusCode, DeviceResponse), AppError> {
    let devices = state.handshake.devices();
    match &ctx.device {
        Some(device) => {
            let token = devices.sign_token(&ctx.instance, device)?;
            Ok((StatusCode::OK, DeviceResponse::new(device, token)))
        }
        None => {
            let (device, token) = devices.create(&ctx.instance, DeviceKind::DevBrowser).await?;
            Ok((StatusCode::CREATED, DeviceResponse::new(&device, token)))
        }
    }
}

/// Create a dev browser
#[utoipa::path(
    post,
    path = "/v1/dev_browser",
    responses(
        (status = 201, description = "Dev browser created", body = DeviceResponse),
        (status = 200, description = "Existing dev browser returned", body = DeviceResponse),
        (status = 404, description = "Production instance", body = ErrorResponse)
    ),
    tag = "Dev Browser"
)]
pub async fn create_dev_browser(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    jar: CookieJar,
) -> Result<impl IntoResponse, AppError> {
    require_development(&ctx)?;
    let (status, response) = dev_browser_token(&state, &ctx).await?;

    let jar = match device_cookie(&ctx, response.token.clone()) {
        Some(cookie) => jar.add(cookie),
        None => jar,
    };
    Ok((status, jar, Json(response)))
}

/// Storage-access page for third-party dev browsers
///
/// Requests unpartitioned cookie access through the Storage Access API and falls back to a
/// top-level navigation through the first-party init endpoint.
#[utoipa::path(
    get,
    path = "/v1/dev_browser/storage_access",
    params(RedirectQuery),
    responses(
        (status = 200, description = "HTML page", content_type = "text/html"),
        (status = 422, description = "Invalid redirect URL", body = ErrorResponse)
    ),
    tag = "Dev Browser"
)]
pub async fn storage_access(
    Extension(ctx): Extension<RequestContext>,
    Query(query): Query<RedirectQuery>,
) -> Result<Html<String>, AppError> {
    require_development(&ctx)?;
    let redirect_url = parse_redirect_url(&ctx.instance, &query.redirect_url)?;

    let mut init_url = Url::parse(&format!("{}{}", ctx.frontend_url, INIT_PATH))
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Invalid frontend URL: {}", e)))?;
    init_url
        .query_pairs_mut()
        .append_pair("redirect_url", redirect_url.as_str());

    Ok(Html(storage_access_page(
        redirect_url.as_str(),
        init_url.as_str(),
    )))
}

/// JSON string literal safe to embed inside a `<script>` element.
fn script_literal(value: &str) -> String {
    serde_json::Value::String(value.to_string())
        .to_string()
        .replace('<', "\\u003c")
        .replace('>', "\\u003e")
        .replace('&', "\\u0026")
}

fn storage_access_page(redirect_url: &str, init_url: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Continue to sign in</title>
<style>
body {{ font-family: system-ui, sans-serif; display: flex; align-items: center; justify-content: center; min-height: 100vh; margin: 0; }}
button {{ font-size: 1rem; padding: 0.75rem 1.5rem; cursor: pointer; }}
</style>
</head>
<body>
<button id="continue" hidden>Continue</button>
<script>
(function () {{
  var redirectUrl = {redirect};
  var initUrl = {init};
  function done() {{ window.location.replace(redirectUrl); }}
  function fallback() {{ window.location.assign(initUrl); }}
  if (!document.hasStorageAccess || !document.requestStorageAccess) {{ fallback(); return; }}
  document.hasStorageAccess().then(function (granted) {{
    if (granted) {{ done(); return; }}
    var button = document.getElementById("continue");
    button.hidden = false;
    button.addEventListener("click", function () {{
      document.requestStorageAccess().then(done, fallback);
    }});
  }}, fallback);
}})();
</script>
</body>
</html>
"#,
        redirect = script_literal(redirect_url),
        init = script_literal(init_url),
    )
}

/// First-party dev browser mint; bounces back to `redirect_url` with the token attached
#[utoipa::path(
    get,
    path = "/v1/dev_browser/init",
    params(RedirectQuery),
    responses(
        (status = 307, description = "Redirect back with `__clerk_db_jwt` appended"),
        (status = 422, description = "Invalid redirect URL", body = ErrorResponse)
    ),
    tag = "Dev Browser"
)]
pub async fn init_dev_browser(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    jar: CookieJar,
    Query(query): Query<RedirectQuery>,
) -> Result<impl IntoResponse, AppError> {
    require_development(&ctx)?;
    let mut redirect_url = parse_redirect_url(&ctx.instance, &query.redirect_url)?;
    let (_, response) = dev_browser_token(&state, &ctx).await?;

    redirect_url
        .query_pairs_mut()
        .append_pair(DEV_BROWSER_COOKIE, &response.token);
    tracing::info!(device_id = %response.id, "Dev browser initialized");

    let jar = match device_cookie(&ctx, response.token) {
        Some(cookie) => jar.add(cookie),
        None => jar,
    };
    Ok((jar, Redirect::temporary(redirect_url.as_str())))
}
