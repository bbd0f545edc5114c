use axum::{extract::State, http::StatusCode, response::IntoResponse, Extension, Json};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use service_core::error::AppError;

use crate::{
    dtos::{client::DeviceResponse, ErrorResponse},
    models::DeviceKind,
    services::{
        handshake::{CLIENT_COOKIE, DEV_BROWSER_COOKIE},
        RequestContext,
    },
    AppState,
};

/// Cookie carrying the device token for browsers. Native clients get none.
pub fn device_cookie(ctx: &RequestContext, token: String) -> Option<Cookie<'static>> {
    if !ctx.client_type.is_browser() {
        return None;
    }
    let cookie = if ctx.instance.is_production() {
        Cookie::build((CLIENT_COOKIE, token))
            .path("/")
            .http_only(true)
            .secure(true)
            .same_site(SameSite::Lax)
    } else {
        Cookie::build((DEV_BROWSER_COOKIE, token))
            .path("/")
            .secure(true)
            .same_site(SameSite::None)
    };
    Some(cookie.build())
}

/// Bootstrap a device identity for this browser or native app
#[utoipa::path(
    post,
    path = "/v1/client",
    responses(
        (status = 200, description = "Existing device returned with a fresh token", body = DeviceResponse),
        (status = 201, description = "Device identity created", body = DeviceResponse),
        (status = 400, description = "Handshake rejected", body = ErrorResponse)
    ),
    tag = "Client"
)]
pub async fn create_client(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    jar: CookieJar,
) -> Result<impl IntoResponse, AppError> {
    let devices = state.handshake.devices();
    let (status, device, token) = match &ctx.device {
        Some(device) => {
            let token = devices.sign_token(&ctx.instance, device)?;
            (StatusCode::OK, device.clone(), token)
        }
        None => {
            let (device, token) = devices
                .create(&ctx.instance, DeviceKind::for_instance(&ctx.instance))
                .await?;
            (StatusCode::CREATED, device, token)
        }
    };

    let jar = match device_cookie(&ctx, token.clone()) {
        Some(cookie) => jar.add(cookie),
        None => jar,
    };
    Ok((status, jar, Json(DeviceResponse::new(&device, token))))
}
