pub mod config;
pub mod db;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod store;
pub mod utils;

use service_core::axum::{
    extract::State,
    http::{header, HeaderName, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Json, Router,
};
use service_core::middleware::{
    security_headers::security_headers_middleware, tracing::request_id_middleware,
};
use sqlx::PgPool;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::{
    openapi::security::{ApiKey, ApiKeyValue, SecurityScheme},
    Modify, OpenApi,
};

use crate::config::CredentialConfig;
use crate::services::{
    BootstrapPaths, Clock, CodeDispatcher, DeviceService, EventSink, HandshakeCoordinator,
    InstanceService, JwtTemplateService, KeyProvider, TicketEngine, TicketSignIn,
    VerificationService,
};
use crate::store::CredentialStore;
use service_core::error::AppError;

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check,
        handlers::tickets::create_actor_token,
        handlers::tickets::revoke_actor_token,
        handlers::tickets::create_sign_in_token,
        handlers::tickets::revoke_sign_in_token,
        handlers::tickets::accept_ticket,
        handlers::jwt_templates::list_templates,
        handlers::jwt_templates::create_template,
        handlers::jwt_templates::get_template,
        handlers::jwt_templates::update_template,
        handlers::jwt_templates::delete_template,
        handlers::jwt_templates::create_token,
        handlers::verifications::prepare_verification,
        handlers::verifications::get_verification,
        handlers::verifications::attempt_verification,
        handlers::client::create_client,
        handlers::dev_browser::create_dev_browser,
        handlers::dev_browser::storage_access,
        handlers::dev_browser::init_dev_browser,
        handlers::instances::promote_instance,
    ),
    components(
        schemas(
            dtos::ErrorItem,
            dtos::ErrorResponse,
            dtos::DeletedObject,
            dtos::tickets::CreateActorTokenRequest,
            dtos::tickets::CreateSignInTokenRequest,
            dtos::tickets::TicketResponse,
            dtos::tickets::TicketAcceptanceResponse,
            dtos::jwt_templates::CreateJwtTemplateRequest,
            dtos::jwt_templates::UpdateJwtTemplateRequest,
            dtos::jwt_templates::JwtTemplateResponse,
            dtos::jwt_templates::TokenResponse,
            dtos::verifications::PrepareVerificationRequest,
            dtos::verifications::AttemptVerificationRequest,
            dtos::verifications::VerificationResponse,
            dtos::client::DeviceResponse,
            handlers::instances::InstanceResponse,
            models::TicketStatus,
            models::Strategy,
            models::VerificationStatus,
            models::DeviceKind,
            HealthResponse,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Tickets", description = "Actor and sign-in tokens"),
        (name = "JWT Templates", description = "Custom token templates and minting"),
        (name = "Verifications", description = "Proof of ownership state machine"),
        (name = "Client", description = "Device identity bootstrap"),
        (name = "Dev Browser", description = "Development instance cross-domain handshake"),
        (name = "Instances", description = "Instance lifecycle"),
        (name = "Observability", description = "Service health"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "admin_api_key",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new(
                    middleware::admin::ADMIN_API_KEY_HEADER,
                ))),
            );
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: CredentialConfig,
    pub store: Arc<dyn CredentialStore>,
    /// Present when running against PostgreSQL.
    pub pool: Option<PgPool>,
    pub instances: InstanceService,
    pub tickets: TicketEngine,
    pub templates: JwtTemplateService,
    pub verifications: VerificationService,
    pub handshake: HandshakeCoordinator,
    pub sign_in: TicketSignIn,
}

impl AppState {
    /// Wire every service over one store, key provider, clock and event sink.
    pub fn new(
        config: CredentialConfig,
        store: Arc<dyn CredentialStore>,
        pool: Option<PgPool>,
        keys: Arc<dyn KeyProvider>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        dispatcher: Arc<dyn CodeDispatcher>,
    ) -> Self {
        let instances = InstanceService::new(store.clone(), events.clone());
        let tickets = TicketEngine::new(
            store.clone(),
            keys.clone(),
            clock.clone(),
            events.clone(),
            config.ticket_policy(),
        );
        let templates =
            JwtTemplateService::new(store.clone(), keys.clone(), clock.clone(), events.clone());
        let verifications = VerificationService::new(
            store.clone(),
            dispatcher,
            clock.clone(),
            events.clone(),
            config.verification_policy(),
        );
        let devices = DeviceService::new(
            store.clone(),
            keys,
            clock,
            events.clone(),
            config.devices.token_lifetime_days,
        );
        let sign_in = TicketSignIn::new(tickets.clone(), devices.clone(), events);
        let bootstrap = BootstrapPaths::with_extra(config.security.bootstrap_paths_extra.clone());
        let handshake = HandshakeCoordinator::new(devices, bootstrap);

        Self {
            config,
            store,
            pool,
            instances,
            tickets,
            templates,
            verifications,
            handshake,
            sign_in,
        }
    }
}

fn cors_layer(config: &CredentialConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .security
        .allowed_origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!("Invalid CORS origin '{}': {}. Skipping.", o, e);
                None
            }
        })
        .collect();

    let allow_headers = [
        header::AUTHORIZATION,
        header::CONTENT_TYPE,
        HeaderName::from_static(middleware::admin::ADMIN_API_KEY_HEADER),
    ];

    CorsLayer::new()
        .allow_origin(origins)
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(allow_headers)
}

pub async fn build_router(state: AppState) -> Result<Router, AppError> {
    // Backend API, admin key required
    let admin_routes = Router::new()
        .route(
            "/v1/instances/:instance_id/actor_tokens",
            post(handlers::create_actor_token),
        )
        .route(
            "/v1/instances/:instance_id/actor_tokens/:ticket_id/revoke",
            post(handlers::revoke_actor_token),
        )
        .route(
            "/v1/instances/:instance_id/sign_in_tokens",
            post(handlers::create_sign_in_token),
        )
        .route(
            "/v1/instances/:instance_id/sign_in_tokens/:ticket_id/revoke",
            post(handlers::revoke_sign_in_token),
        )
        .route(
            "/v1/instances/:instance_id/jwt_templates",
            get(handlers::list_templates).post(handlers::create_template),
        )
        .route(
            "/v1/instances/:instance_id/jwt_templates/:template_id",
            get(handlers::get_template)
                .patch(handlers::update_template)
                .delete(handlers::delete_template),
        )
        .route(
            "/v1/instances/:instance_id/promote",
            post(handlers::promote_instance),
        )
        .layer(from_fn_with_state(
            state.clone(),
            middleware::admin_auth_middleware,
        ));

    // Frontend API, attributed to a device by the handshake
    let frontend_routes = Router::new()
        .route("/v1/tickets/accept", get(handlers::accept_ticket))
        .route("/v1/client", post(handlers::create_client))
        .route(
            "/v1/client/verifications",
            post(handlers::prepare_verification),
        )
        .route(
            "/v1/client/verifications/:verification_id",
            get(handlers::get_verification),
        )
        .route(
            "/v1/client/verifications/:verification_id/attempt",
            post(handlers::attempt_verification),
        )
        .route("/v1/client/tokens/:template", post(handlers::create_token))
        .route("/v1/dev_browser", post(handlers::create_dev_browser))
        .route(
            "/v1/dev_browser/storage_access",
            get(handlers::storage_access),
        )
        .route("/v1/dev_browser/init", get(handlers::init_dev_browser))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::handshake_middleware,
        ))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::frontend_cors_middleware,
        ));

    // Static origin list for everything outside the frontend API
    let backend_routes = Router::new()
        .route("/v1/health", get(health_check))
        .route(
            "/.well-known/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        .merge(admin_routes)
        .layer(cors_layer(&state.config));

    let app = backend_routes
        .merge(frontend_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &service_core::axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri().path(),
                    version = ?request.version(),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware));

    Ok(app)
}

#[derive(serde::Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    #[schema(example = "healthy")]
    pub status: String,
    #[schema(example = "credential-service")]
    pub service: String,
    #[schema(example = "0.1.0")]
    pub version: String,
    #[schema(example = "memory")]
    pub store: String,
}

/// Health check
#[utoipa::path(
    get,
    path = "/v1/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 500, description = "Database unreachable", body = dtos::ErrorResponse)
    ),
    tag = "Observability"
)]
pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<HealthResponse>, AppError> {
    let store = match &state.pool {
        Some(pool) => {
            db::health_check(pool).await.map_err(|e| {
                tracing::error!("Database health check failed: {}", e);
                AppError::DatabaseError(anyhow::anyhow!(e))
            })?;
            "postgres"
        }
        None => "memory",
    };

    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        service: state.config.service_name.clone(),
        version: state.config.service_version.clone(),
        store: store.to_string(),
    }))
}
