//! Attributes each inbound request to a device identity and at most one session.

use axum::http::{header, HeaderMap, Method};
use axum_extra::extract::cookie::CookieJar;

use super::{
    allow_list::BootstrapPaths,
    client_type::ClientType,
    devices::{DeviceService, ResolvedDevice},
    domain::{host_of, registrable_domain},
    params::{HandshakeParams, DEV_BROWSER_PARAM},
};
use crate::models::{DeviceIdentity, DeviceKind, Instance};
use crate::services::error::ServiceError;

pub const CLIENT_COOKIE: &str = "__client";
pub const DEV_BROWSER_COOKIE: &str = DEV_BROWSER_PARAM;
pub const PROXY_URL_HEADERS: [&str; 2] = ["x-clerk-proxy-url", "clerk-proxy-url"];
pub const STORAGE_ACCESS_PATH: &str = "/v1/dev_browser/storage_access";

/// What the coordinator needs to know about one request.
#[derive(Debug, Clone, Copy)]
pub struct InboundRequest<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub headers: &'a HeaderMap,
    pub params: &'a HandshakeParams,
    /// Absolute URL of the request with handshake params already stripped.
    pub request_url: &'a str,
}

/// Request-scoped identity handed to handlers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub instance: Instance,
    pub client_type: ClientType,
    pub frontend_url: String,
    pub device: Option<DeviceIdentity>,
    pub session_subject: Option<String>,
    /// One-time allowance for a stale-token exchange in the session-refresh path.
    pub rotating_token_nonce: Option<String>,
    /// Current device token to hand back in the `Authorization` response header.
    pub refreshed_token: Option<String>,
}

#[derive(Debug, Clone)]
pub enum HandshakeOutcome {
    Proceed(Box<RequestContext>),
    /// Navigate the browser through the storage-access flow.
    Redirect(String),
}

fn single_header<'a>(
    headers: &'a HeaderMap,
    name: header::HeaderName,
    duplicate: ServiceError,
) -> Result<Option<&'a str>, ServiceError> {
    let mut values = headers.get_all(name).iter();
    let first = values.next();
    if values.next().is_some() {
        return Err(duplicate);
    }
    Ok(first.and_then(|v| v.to_str().ok()).map(str::trim).filter(|v| !v.is_empty()))
}

fn bearer_token(authorization: Option<&str>) -> Option<&str> {
    authorization
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn is_navigation(method: &Method, headers: &HeaderMap) -> bool {
    *method == Method::GET
        && headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("text/html"))
}

/// Storage-access page that will bounce back to `redirect_url`.
pub fn storage_access_url(frontend_url: &str, redirect_url: &str) -> Result<String, ServiceError> {
    let mut url = url::Url::parse(&format!("{}{}", frontend_url, STORAGE_ACCESS_PATH))
        .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Invalid frontend URL: {}", e)))?;
    url.query_pairs_mut().append_pair("redirect_url", redirect_url);
    Ok(url.to_string())
}

#[derive(Clone)]
pub struct HandshakeCoordinator {
    devices: DeviceService,
    bootstrap: BootstrapPaths,
}

impl HandshakeCoordinator {
    pub fn new(devices: DeviceService, bootstrap: BootstrapPaths) -> Self {
        Self { devices, bootstrap }
    }

    pub fn devices(&self) -> &DeviceService {
        &self.devices
    }

    pub fn bootstrap_paths(&self) -> &BootstrapPaths {
        &self.bootstrap
    }

    #[tracing::instrument(skip_all, fields(instance_id = %instance.instance_id, path = request.path))]
    pub async fn resolve(
        &self,
        instance: Instance,
        request: InboundRequest<'_>,
    ) -> Result<HandshakeOutcome, ServiceError> {
        let headers = request.headers;
        let origin = single_header(headers, header::ORIGIN, ServiceError::MultipleOriginHeaderValues)?;
        let authorization = single_header(
            headers,
            header::AUTHORIZATION,
            ServiceError::MultipleAuthorizationHeaderValues,
        )?;

        let client_type = ClientType::classify(headers, request.params.is_native);
        if client_type.is_browser() && origin.is_some() && authorization.is_some() {
            return Err(ServiceError::OriginAuthorizationHeadersConflict);
        }

        let frontend_url = self.frontend_url(&instance, headers)?;
        let bootstrap = self.bootstrap.contains(request.path);
        let cookies = CookieJar::from_headers(headers);

        let resolved = if instance.is_production() {
            let client_cookie = cookies.get(CLIENT_COOKIE).map(|c| c.value().to_string());
            if !bootstrap {
                if let Some(origin) = origin {
                    validate_origin(&instance, origin)?;
                } else if authorization.is_none() && client_cookie.is_none() {
                    return Err(ServiceError::MissingRequestHeaders);
                }
            }

            let token = bearer_token(authorization).map(str::to_string).or(client_cookie);
            self.resolve_token(&instance, DeviceKind::Client, token.as_deref(), request.params)
                .await?
        } else {
            let token = request
                .params
                .dev_browser_token
                .clone()
                .or_else(|| request.params.legacy_dev_session.clone())
                .or_else(|| cookies.get(DEV_BROWSER_COOKIE).map(|c| c.value().to_string()))
                .or_else(|| bearer_token(authorization).map(str::to_string));
            let resolved = self
                .resolve_token(&instance, DeviceKind::DevBrowser, token.as_deref(), request.params)
                .await?;

            if resolved.is_none()
                && !bootstrap
                && client_type.is_browser()
                && is_third_party(&instance, origin, headers)
            {
                let handshake_url = storage_access_url(&frontend_url, request.request_url)?;
                if is_navigation(request.method, headers) {
                    tracing::info!("Redirecting third-party dev browser through storage access");
                    return Ok(HandshakeOutcome::Redirect(handshake_url));
                }
                return Err(ServiceError::DevBrowserUnauthenticated { handshake_url });
            }
            resolved
        };

        let (device, session_subject, refreshed_token) = match resolved {
            Some(ResolvedDevice {
                device,
                session_subject,
                refreshed_token,
            }) => (Some(device), session_subject, refreshed_token),
            None => (None, None, None),
        };

        Ok(HandshakeOutcome::Proceed(Box::new(RequestContext {
            instance,
            client_type,
            frontend_url,
            device,
            session_subject,
            rotating_token_nonce: request.params.rotating_token_nonce.clone(),
            refreshed_token,
        })))
    }

    async fn resolve_token(
        &self,
        instance: &Instance,
        kind: DeviceKind,
        token: Option<&str>,
        params: &HandshakeParams,
    ) -> Result<Option<ResolvedDevice>, ServiceError> {
        match token {
            Some(token) => {
                self.devices
                    .resolve(instance, kind, token, params.rotating_token_nonce.as_deref())
                    .await
            }
            None => Ok(None),
        }
    }

    /// A proxy header must name exactly the configured https proxy URL.
    fn frontend_url(&self, instance: &Instance, headers: &HeaderMap) -> Result<String, ServiceError> {
        let proxy = PROXY_URL_HEADERS
            .iter()
            .find_map(|name| headers.get(*name))
            .map(|v| v.to_str().map_err(|_| ServiceError::InvalidProxyUrl))
            .transpose()?;

        let Some(proxy) = proxy else {
            return Ok(instance.issuer());
        };
        let proxy = proxy.trim().trim_end_matches('/');
        let parsed = url::Url::parse(proxy).map_err(|_| ServiceError::InvalidProxyUrl)?;
        let configured = instance.proxy_url.as_deref().map(|p| p.trim_end_matches('/'));
        if parsed.scheme() != "https" || configured != Some(proxy) {
            return Err(ServiceError::InvalidProxyUrl);
        }
        Ok(proxy.to_string())
    }
}

/// The origin must share a registrable domain with the auth domain, a satellite or the
/// configured proxy, or be explicitly allowed.
pub fn validate_origin(instance: &Instance, origin: &str) -> Result<(), ServiceError> {
    let normalized = origin.trim_end_matches('/');
    if instance
        .allowed_origins
        .iter()
        .any(|allowed| allowed.trim_end_matches('/').eq_ignore_ascii_case(normalized))
    {
        return Ok(());
    }

    let host = host_of(origin).ok_or_else(|| ServiceError::InvalidOrigin(origin.to_string()))?;
    let site = registrable_domain(&host);
    let proxy_host = instance.proxy_url.as_deref().and_then(host_of);
    let trusted = std::iter::once(instance.auth_domain.as_str())
        .chain(instance.satellite_domains.iter().map(String::as_str))
        .chain(proxy_host.as_deref())
        .any(|domain| registrable_domain(domain) == site);

    if trusted {
        Ok(())
    } else {
        Err(ServiceError::InvalidOrigin(origin.to_string()))
    }
}

/// Third-party when the `Origin` (else `Referer`) sits on another registrable domain
/// than the auth domain.
fn is_third_party(instance: &Instance, origin: Option<&str>, headers: &HeaderMap) -> bool {
    let source = origin.map(str::to_string).or_else(|| {
        headers
            .get(header::REFERER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    });
    match source.as_deref().and_then(host_of) {
        Some(host) => registrable_domain(&host) != registrable_domain(&instance.auth_domain),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InstanceEnvironment, InstanceKeys, SigningAlgorithm};
    use axum::http::HeaderValue;
    use chrono::Utc;
    use secrecy::Secret;

    fn instance() -> Instance {
        let mut instance = Instance::new(
            InstanceEnvironment::Production,
            "clerk.example.com",
            InstanceKeys {
                key_id: "ins_1".to_string(),
                algorithm: SigningAlgorithm::HS256,
                private_key: Secret::new("secret".to_string()),
                public_key: String::new(),
            },
            Utc::now(),
        );
        instance.satellite_domains = vec!["satellite.io".to_string()];
        instance.allowed_origins = vec!["https://partner.dev".to_string()];
        instance
    }

    #[test]
    fn test_validate_origin() {
        let instance = instance();
        assert!(validate_origin(&instance, "https://app.example.com").is_ok());
        assert!(validate_origin(&instance, "https://www.satellite.io").is_ok());
        assert!(validate_origin(&instance, "https://partner.dev/").is_ok());

        let err = validate_origin(&instance, "https://example.com.evil.io").unwrap_err();
        assert_eq!(err.code(), "invalid_origin");
        assert!(validate_origin(&instance, "null").is_err());
    }

    #[test]
    fn test_validate_origin_trusts_the_proxy_site() {
        let mut instance = instance();
        assert!(validate_origin(&instance, "https://myapp.dev").is_err());

        instance.proxy_url = Some("https://myapp.dev/__clerk".to_string());
        assert!(validate_origin(&instance, "https://myapp.dev").is_ok());
        assert!(validate_origin(&instance, "https://www.myapp.dev").is_ok());
        assert!(validate_origin(&instance, "https://myapp.dev.evil.io").is_err());
    }

    #[test]
    fn test_third_party_falls_back_to_referer() {
        let instance = instance();
        let mut headers = HeaderMap::new();
        assert!(!is_third_party(&instance, None, &headers));

        headers.insert(header::REFERER, HeaderValue::from_static("https://myapp.dev/page"));
        assert!(is_third_party(&instance, None, &headers));
        assert!(!is_third_party(&instance, Some("https://app.example.com"), &headers));
    }

    #[test]
    fn test_single_header_rejects_duplicates() {
        let mut headers = HeaderMap::new();
        headers.append(header::ORIGIN, HeaderValue::from_static("https://a.com"));
        assert_eq!(
            single_header(&headers, header::ORIGIN, ServiceError::MultipleOriginHeaderValues)
                .unwrap(),
            Some("https://a.com")
        );

        headers.append(header::ORIGIN, HeaderValue::from_static("https://b.com"));
        assert!(matches!(
            single_header(&headers, header::ORIGIN, ServiceError::MultipleOriginHeaderValues),
            Err(ServiceError::MultipleOriginHeaderValues)
        ));
    }

    #[test]
    fn test_storage_access_url_encodes_redirect() {
        let url = storage_access_url("https://clerk.example.com", "https://app.dev/a?b=c").unwrap();
        assert_eq!(
            url,
            "https://clerk.example.com/v1/dev_browser/storage_access?redirect_url=https%3A%2F%2Fapp.dev%2Fa%3Fb%3Dc"
        );
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token(Some("Bearer abc")), Some("abc"));
        assert_eq!(bearer_token(Some("Basic abc")), None);
        assert_eq!(bearer_token(None), None);
    }
}
