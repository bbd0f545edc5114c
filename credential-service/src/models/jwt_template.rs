//! JWT template model - named claim blueprints.

use chrono::{DateTime, Utc};
use secrecy::Secret;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::SigningAlgorithm;

pub const DEFAULT_LIFETIME_SECONDS: i64 = 60;
pub const DEFAULT_CLOCK_SKEW_SECONDS: i64 = 5;

/// Template-specific signing key that overrides the instance default.
#[derive(Debug, Clone)]
pub struct CustomSigningKey {
    pub algorithm: SigningAlgorithm,
    /// Shared secret for HS*, PEM private key for RS*/ES*.
    pub signing_key: Secret<String>,
    /// Optional PEM public key for RS*/ES*, used to verify the save-time dry run.
    pub public_key: Option<String>,
}

/// JWT template entity.
#[derive(Debug, Clone)]
pub struct JwtTemplate {
    pub template_id: Uuid,
    pub instance_id: Uuid,
    pub name: String,
    pub claims: Map<String, Value>,
    pub lifetime_seconds: i64,
    pub allowed_clock_skew_seconds: i64,
    pub custom_signing_key: Option<CustomSigningKey>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl JwtTemplate {
    pub fn new(
        instance_id: Uuid,
        name: impl Into<String>,
        claims: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            template_id: Uuid::new_v4(),
            instance_id,
            name: name.into(),
            claims,
            lifetime_seconds: DEFAULT_LIFETIME_SECONDS,
            allowed_clock_skew_seconds: DEFAULT_CLOCK_SKEW_SECONDS,
            custom_signing_key: None,
            created_utc: now,
            updated_utc: now,
        }
    }

    /// Algorithm tokens minted from this template are signed with.
    pub fn effective_algorithm(&self, instance_default: SigningAlgorithm) -> SigningAlgorithm {
        self.custom_signing_key
            .as_ref()
            .map(|k| k.algorithm)
            .unwrap_or(instance_default)
    }
}
