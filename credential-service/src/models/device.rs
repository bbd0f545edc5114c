//! Device identity model - clients and dev browsers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::Instance;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Production browser or native client, carried by the `__client` cookie or a bearer token.
    Client,
    /// Development shim used when first-party cookies are unavailable.
    DevBrowser,
}

impl DeviceKind {
    /// Production instances attribute requests to clients, development instances to dev browsers.
    pub fn for_instance(instance: &Instance) -> Self {
        if instance.is_production() {
            DeviceKind::Client
        } else {
            DeviceKind::DevBrowser
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Client => "client",
            DeviceKind::DevBrowser => "dev_browser",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "client" => Some(DeviceKind::Client),
            "dev_browser" => Some(DeviceKind::DevBrowser),
            _ => None,
        }
    }
}

/// Device identity entity.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdentity {
    pub device_id: Uuid,
    pub instance_id: Uuid,
    pub kind: DeviceKind,
    pub rotating_token: String,
    /// Token replaced by the last rotation; honoured once with a matching nonce.
    pub previous_token: Option<String>,
    pub rotation_nonce: Option<String>,
    pub session_subject: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub rotated_utc: Option<DateTime<Utc>>,
}

impl DeviceIdentity {
    pub fn new(
        instance_id: Uuid,
        kind: DeviceKind,
        rotating_token: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id: Uuid::new_v4(),
            instance_id,
            kind,
            rotating_token,
            previous_token: None,
            rotation_nonce: None,
            session_subject: None,
            created_utc: now,
            rotated_utc: None,
        }
    }
}
