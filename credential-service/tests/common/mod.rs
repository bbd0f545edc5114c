//! Shared setup for credential-service integration tests.
//!
//! Every test gets its own in-memory store, a manually driven clock and
//! recording event/dispatch sinks, so tests run without PostgreSQL.

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use chrono::{DateTime, TimeZone, Utc};
use credential_service::{
    build_router,
    config::{
        CredentialConfig, DatabaseConfig, DeviceConfig, Environment, SecurityConfig,
        TicketConfig, VerificationConfig,
    },
    models::{
        Instance, InstanceEnvironment, InstanceKeys, PlanFeature, PlanFeatures, SigningAlgorithm,
        Subject,
    },
    services::{
        Clock, FixedClock, InstanceKeyProvider, RecordingDispatcher, RecordingEventSink,
    },
    store::{InstanceStore, MemoryStore, SubjectDirectory},
    AppState,
};
use http_body_util::BodyExt;
use secrecy::Secret;
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

pub const TEST_ADMIN_API_KEY: &str = "test-admin-key-12345";
pub const RSA_PRIVATE_KEY: &str = include_str!("../fixtures/rsa_private.pem");
pub const RSA_PUBLIC_KEY: &str = include_str!("../fixtures/rsa_public.pem");
pub const RSA_OTHER_PRIVATE_KEY: &str = include_str!("../fixtures/rsa_other_private.pem");
pub const RSA_OTHER_PUBLIC_KEY: &str = include_str!("../fixtures/rsa_other_public.pem");
pub const EC_PRIVATE_KEY: &str = include_str!("../fixtures/ec_private.pem");
pub const EC_PUBLIC_KEY: &str = include_str!("../fixtures/ec_public.pem");

/// Logs go to the test writer; set RUST_LOG to see them.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> CredentialConfig {
    CredentialConfig {
        common: service_core::config::Config {
            host: "127.0.0.1".parse().expect("valid host"),
            port: 8080,
        },
        environment: Environment::Dev,
        service_name: "credential-service-test".to_string(),
        service_version: "0.1.0".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: None,
            max_connections: 5,
        },
        security: SecurityConfig {
            allowed_origins: vec!["http://localhost:3000".to_string()],
            admin_api_key: TEST_ADMIN_API_KEY.to_string(),
            debug_errors: false,
            bootstrap_paths_extra: Vec::new(),
        },
        tickets: TicketConfig {
            default_ttl_seconds: 3600,
            actor_max_ttl_seconds: 86_400,
        },
        devices: DeviceConfig {
            token_lifetime_days: 90,
        },
        verification: VerificationConfig {
            code_max_attempts: 3,
            code_lifetime_seconds: 600,
            redirect_lifetime_seconds: 600,
        },
    }
}

pub fn rsa_keys() -> InstanceKeys {
    InstanceKeys {
        key_id: format!("ins_{}", Uuid::new_v4().simple()),
        algorithm: SigningAlgorithm::RS256,
        private_key: Secret::new(RSA_PRIVATE_KEY.to_string()),
        public_key: RSA_PUBLIC_KEY.to_string(),
    }
}

/// A fixed point comfortably inside the validity window of every token in these tests.
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
        .single()
        .expect("valid timestamp")
}

/// Response captured from the router.
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub text: String,
    pub body: Value,
}

impl TestResponse {
    /// `code` of the first error in the envelope.
    pub fn error_code(&self) -> &str {
        self.body["errors"][0]["code"].as_str().unwrap_or_default()
    }

    pub fn header(&self, name: header::HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Every `Set-Cookie` value on the response.
    pub fn set_cookies(&self) -> Vec<String> {
        self.headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect()
    }
}

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<FixedClock>,
    pub events: Arc<RecordingEventSink>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub router: Router,
}

impl TestApp {
    pub async fn spawn() -> Self {
        init_test_tracing();

        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(start_time()));
        let events = Arc::new(RecordingEventSink::new());
        let dispatcher = Arc::new(RecordingDispatcher::new());

        let state = AppState::new(
            test_config(),
            store.clone(),
            None,
            Arc::new(InstanceKeyProvider::new()),
            clock.clone(),
            events.clone(),
            dispatcher.clone(),
        );
        let router = build_router(state.clone())
            .await
            .expect("Failed to build router");

        Self {
            state,
            store,
            clock,
            events,
            dispatcher,
            router,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Persist a production instance on `auth_domain` with every plan feature.
    pub async fn production_instance(&self, auth_domain: &str) -> Instance {
        let mut instance = Instance::new(
            InstanceEnvironment::Production,
            auth_domain,
            rsa_keys(),
            self.now(),
        );
        instance.plan = PlanFeatures {
            unrestricted: true,
            features: Vec::new(),
        };
        self.save_instance(&instance).await;
        instance
    }

    pub async fn development_instance(&self, auth_domain: &str) -> Instance {
        let mut instance = Instance::new(
            InstanceEnvironment::Development,
            auth_domain,
            rsa_keys(),
            self.now(),
        );
        instance.plan = PlanFeatures {
            unrestricted: true,
            features: Vec::new(),
        };
        self.save_instance(&instance).await;
        instance
    }

    /// Production instance limited to `features`.
    pub async fn instance_with_plan(&self, auth_domain: &str, features: Vec<PlanFeature>) -> Instance {
        let mut instance = Instance::new(
            InstanceEnvironment::Production,
            auth_domain,
            rsa_keys(),
            self.now(),
        );
        instance.plan = PlanFeatures {
            unrestricted: false,
            features,
        };
        self.save_instance(&instance).await;
        instance
    }

    pub async fn save_instance(&self, instance: &Instance) {
        self.store
            .insert_instance(instance)
            .await
            .expect("Failed to insert instance");
    }

    /// Current stored copy, picking up session-template pointer moves.
    pub async fn reload(&self, instance: &Instance) -> Instance {
        self.store
            .find_instance(instance.instance_id)
            .await
            .expect("Failed to load instance")
            .expect("Instance exists")
    }

    pub async fn add_subject(&self, instance: &Instance, subject_id: &str, data: Value) -> Subject {
        let subject = Subject::new(instance.instance_id, subject_id, data);
        self.store
            .insert_subject(&subject)
            .await
            .expect("Failed to insert subject");
        subject
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Router is infallible");

        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to read body")
            .to_bytes();
        let text = String::from_utf8_lossy(&bytes).to_string();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

        TestResponse {
            status,
            headers,
            text,
            body,
        }
    }

    /// Admin call against the backend API.
    pub async fn admin(&self, method: Method, uri: &str, body: Option<Value>) -> TestResponse {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::HOST, "api.localhost")
            .header("x-admin-api-key", TEST_ADMIN_API_KEY);
        self.send(json_request(builder, body)).await
    }
}

/// Request to the frontend API served on `host`.
pub fn frontend(method: Method, host: &str, uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::HOST, host)
}

pub fn json_request(builder: axum::http::request::Builder, body: Option<Value>) -> Request<Body> {
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("valid request"),
        None => builder.body(Body::empty()).expect("valid request"),
    }
}
