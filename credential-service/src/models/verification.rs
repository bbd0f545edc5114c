//! Verification model - attempt-tracked identity proofs.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Verification strategy codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    EmailCode,
    PhoneCode,
    #[serde(rename = "oauth")]
    OAuth,
    Saml,
    Passkey,
    Password,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::EmailCode => "email_code",
            Strategy::PhoneCode => "phone_code",
            Strategy::OAuth => "oauth",
            Strategy::Saml => "saml",
            Strategy::Passkey => "passkey",
            Strategy::Password => "password",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "email_code" => Some(Strategy::EmailCode),
            "phone_code" => Some(Strategy::PhoneCode),
            "oauth" => Some(Strategy::OAuth),
            "saml" => Some(Strategy::Saml),
            "passkey" => Some(Strategy::Passkey),
            "password" => Some(Strategy::Password),
            _ => None,
        }
    }

    pub fn is_code(&self) -> bool {
        matches!(self, Strategy::EmailCode | Strategy::PhoneCode)
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self, Strategy::OAuth | Strategy::Saml)
    }
}

/// Verification status codes. Everything except `Unverified` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Unverified,
    Verified,
    Expired,
    Failed,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Unverified => "unverified",
            VerificationStatus::Verified => "verified",
            VerificationStatus::Expired => "expired",
            VerificationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unverified" => Some(VerificationStatus::Unverified),
            "verified" => Some(VerificationStatus::Verified),
            "expired" => Some(VerificationStatus::Expired),
            "failed" => Some(VerificationStatus::Failed),
            _ => None,
        }
    }
}

/// Verification entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Verification {
    pub verification_id: Uuid,
    pub instance_id: Uuid,
    pub strategy: Strategy,
    /// The email, phone number, provider account or credential being proven.
    pub identification: String,
    pub status: VerificationStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    /// SHA-256 hex of the expected code, state nonce or challenge.
    pub secret_hash: Option<String>,
    pub external_authorization_url: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub expires_utc: DateTime<Utc>,
    pub verified_utc: Option<DateTime<Utc>>,
}

impl Verification {
    pub fn new(
        instance_id: Uuid,
        strategy: Strategy,
        identification: impl Into<String>,
        max_attempts: u32,
        lifetime_seconds: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            verification_id: Uuid::new_v4(),
            instance_id,
            strategy,
            identification: identification.into(),
            status: VerificationStatus::Unverified,
            attempts: 0,
            max_attempts,
            secret_hash: None,
            external_authorization_url: None,
            created_utc: now,
            expires_utc: now + Duration::seconds(lifetime_seconds),
            verified_utc: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_utc
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }
}
