use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::models::{Strategy, Verification, VerificationStatus};

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct PrepareVerificationRequest {
    pub strategy: Strategy,

    /// Email address, phone number or user id being proven.
    #[validate(length(min = 1, max = 320, message = "identification is required"))]
    #[schema(example = "user@example.com")]
    pub identification: String,

    /// Provider authorization endpoint for `oauth` and `saml`.
    #[validate(url(message = "provider_url must be a URL"))]
    #[schema(example = "https://accounts.google.com/o/oauth2/v2/auth?client_id=abc")]
    pub provider_url: Option<String>,
}

/// Exactly one of the proof fields must be set, matching the verification's strategy.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct AttemptVerificationRequest {
    #[validate(length(min = 1, max = 16))]
    #[schema(example = "424242")]
    pub code: Option<String>,

    /// OAuth/SAML state or passkey challenge returned by the provider flow.
    pub nonce: Option<String>,

    pub password: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct VerificationResponse {
    #[schema(example = "verification")]
    pub object: String,
    pub id: String,
    pub strategy: Strategy,
    pub status: VerificationStatus,
    pub attempts: u32,
    pub remaining_attempts: u32,
    pub expire_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_verification_redirect_url: Option<String>,
    /// Passkey challenge, only returned when preparing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge: Option<String>,
}

impl From<&Verification> for VerificationResponse {
    fn from(verification: &Verification) -> Self {
        Self {
            object: "verification".to_string(),
            id: verification.verification_id.to_string(),
            strategy: verification.strategy,
            status: verification.status,
            attempts: verification.attempts,
            remaining_attempts: verification.remaining_attempts(),
            expire_at: verification.expires_utc.timestamp_millis(),
            external_verification_redirect_url: verification.external_authorization_url.clone(),
            challenge: None,
        }
    }
}
