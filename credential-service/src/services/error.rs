use axum::http::StatusCode;
use service_core::error::{ApiError, AppError, ErrorMeta};
use thiserror::Error;

use crate::models::{PlanFeature, TicketKind, TicketStatus, VerificationStatus};

/// Closed catalog of credential-core failures. Each variant owns a stable wire code.
#[derive(Error, Debug)]
pub enum ServiceError {
    // Tickets
    #[error("Subject not found")]
    SubjectNotFound,

    #[error("Missing parameter: {0}")]
    MissingParameter(String),

    #[error("Invalid expiry: {0}")]
    InvalidExpiry(String),

    #[error("Ticket invalid")]
    TicketInvalid,

    #[error("Ticket expired")]
    TicketExpired,

    #[error("Ticket not found")]
    TicketNotFound,

    #[error("Ticket already used")]
    TicketAlreadyUsed,

    #[error("Ticket revoked")]
    TicketRevoked,

    #[error("{} cannot be revoked, status is {}", .kind.label(), .status.as_str())]
    TicketCannotBeRevoked {
        kind: TicketKind,
        status: TicketStatus,
    },

    #[error("Ticket not in expected flow")]
    TicketNotInExpectedFlow { expected: TicketKind },

    // JWT templates
    #[error("Invalid template name")]
    InvalidTemplateName,

    #[error("Reserved template name")]
    ReservedTemplateName,

    #[error("Claims too large: {0} bytes")]
    ClaimsTooLarge(usize),

    #[error("Claims must be a JSON object")]
    ClaimsNotObject,

    #[error("Reserved claim used: {0}")]
    ReservedClaim(String),

    #[error("Forbidden audience")]
    ForbiddenAudience,

    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Invalid lifetime: {0}")]
    InvalidLifetime(i64),

    #[error("Invalid clock skew: {0}")]
    InvalidClockSkew(i64),

    #[error("Template name taken")]
    TemplateNameTaken,

    #[error("Feature not supported by plan")]
    FeatureNotSupportedByPlan(Vec<PlanFeature>),

    #[error("Signing key invalid")]
    SigningKeyInvalid,

    #[error("Template not found")]
    TemplateNotFound,

    #[error("Template not deletable")]
    TemplateNotDeletable,

    // Verifications
    #[error("Verification not found")]
    VerificationNotFound,

    #[error("Verification already verified")]
    VerificationAlreadyVerified,

    #[error("Verification expired")]
    VerificationExpired,

    #[error("Too many failed attempts")]
    VerificationFailed,

    #[error("Incorrect code, {remaining} attempts remaining")]
    FormCodeIncorrect { remaining: u32 },

    #[error("Verification missing")]
    VerificationMissing,

    #[error("Verification not attempted")]
    VerificationNotAttempted,

    #[error("Verification incomplete, status is {}", .0.as_str())]
    VerificationIncomplete(VerificationStatus),

    #[error("Proof does not match verification strategy")]
    VerificationStrategyMismatch,

    // Handshake
    #[error("Multiple Origin header values")]
    MultipleOriginHeaderValues,

    #[error("Multiple Authorization header values")]
    MultipleAuthorizationHeaderValues,

    #[error("Origin and Authorization headers conflict")]
    OriginAuthorizationHeadersConflict,

    #[error("Invalid proxy URL")]
    InvalidProxyUrl,

    #[error("Invalid origin: {0}")]
    InvalidOrigin(String),

    #[error("Missing request headers")]
    MissingRequestHeaders,

    #[error("Dev browser unauthenticated")]
    DevBrowserUnauthenticated { handshake_url: String },

    #[error("Invalid redirect URL")]
    InvalidRedirectUrl,

    #[error("Instance not found")]
    InstanceNotFound,

    #[error("Device identity missing")]
    DeviceMissing,

    #[error("Signed out")]
    SignedOut,

    #[error("Multiple errors: {0:?}")]
    Multiple(Vec<ServiceError>),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::SubjectNotFound => "subject_not_found",
            ServiceError::MissingParameter(_) => "missing_parameter",
            ServiceError::InvalidExpiry(_) => "invalid_expiry",
            ServiceError::TicketInvalid => "ticket_invalid",
            ServiceError::TicketExpired => "ticket_expired",
            ServiceError::TicketNotFound => "ticket_not_found",
            ServiceError::TicketAlreadyUsed => "ticket_already_used",
            ServiceError::TicketRevoked => "ticket_revoked",
            ServiceError::TicketCannotBeRevoked { .. } => "ticket_cannot_be_revoked",
            ServiceError::TicketNotInExpectedFlow { .. } => "ticket_not_in_expected_flow",
            ServiceError::InvalidTemplateName => "invalid_template_name",
            ServiceError::ReservedTemplateName => "reserved_template_name",
            ServiceError::ClaimsTooLarge(_) => "claims_too_large",
            ServiceError::ClaimsNotObject => "claims_not_object",
            ServiceError::ReservedClaim(_) => "reserved_claim",
            ServiceError::ForbiddenAudience => "forbidden_audience",
            ServiceError::UnsupportedAlgorithm(_) => "unsupported_algorithm",
            ServiceError::InvalidLifetime(_) => "invalid_lifetime",
            ServiceError::InvalidClockSkew(_) => "invalid_clock_skew",
            ServiceError::TemplateNameTaken => "template_name_taken",
            ServiceError::FeatureNotSupportedByPlan(_) => "feature_not_supported_by_plan",
            ServiceError::SigningKeyInvalid => "signing_key_invalid",
            ServiceError::TemplateNotFound => "template_not_found",
            ServiceError::TemplateNotDeletable => "template_not_deletable",
            ServiceError::VerificationNotFound => "verification_not_found",
            ServiceError::VerificationAlreadyVerified => "verification_already_verified",
            ServiceError::VerificationExpired => "verification_expired",
            ServiceError::VerificationFailed => "verification_failed",
            ServiceError::FormCodeIncorrect { .. } => "form_code_incorrect",
            ServiceError::VerificationMissing => "verification_missing",
            ServiceError::VerificationNotAttempted => "verification_not_attempted",
            ServiceError::VerificationIncomplete(_) => "verification_incomplete",
            ServiceError::VerificationStrategyMismatch => "verification_strategy_mismatch",
            ServiceError::MultipleOriginHeaderValues => "multiple_origin_header_values",
            ServiceError::MultipleAuthorizationHeaderValues => {
                "multiple_authorization_header_values"
            }
            ServiceError::OriginAuthorizationHeadersConflict => {
                "origin_authorization_headers_conflict"
            }
            ServiceError::InvalidProxyUrl => "invalid_proxy_url",
            ServiceError::InvalidOrigin(_) => "invalid_origin",
            ServiceError::MissingRequestHeaders => "missing_request_headers",
            ServiceError::DevBrowserUnauthenticated { .. } => "dev_browser_unauthenticated",
            ServiceError::InvalidRedirectUrl => "invalid_redirect_url",
            ServiceError::InstanceNotFound => "instance_not_found",
            ServiceError::DeviceMissing => "device_missing",
            ServiceError::SignedOut => "signed_out",
            ServiceError::Multiple(_) => "multiple_errors",
            ServiceError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::SubjectNotFound
            | ServiceError::TicketNotFound
            | ServiceError::TemplateNotFound
            | ServiceError::VerificationNotFound
            | ServiceError::InstanceNotFound => StatusCode::NOT_FOUND,

            ServiceError::MissingParameter(_)
            | ServiceError::InvalidExpiry(_)
            | ServiceError::InvalidTemplateName
            | ServiceError::ReservedTemplateName
            | ServiceError::ClaimsTooLarge(_)
            | ServiceError::ClaimsNotObject
            | ServiceError::ReservedClaim(_)
            | ServiceError::ForbiddenAudience
            | ServiceError::UnsupportedAlgorithm(_)
            | ServiceError::InvalidLifetime(_)
            | ServiceError::InvalidClockSkew(_)
            | ServiceError::TemplateNameTaken
            | ServiceError::SigningKeyInvalid
            | ServiceError::FormCodeIncorrect { .. }
            | ServiceError::VerificationMissing
            | ServiceError::VerificationNotAttempted
            | ServiceError::VerificationIncomplete(_)
            | ServiceError::VerificationStrategyMismatch
            | ServiceError::InvalidRedirectUrl => StatusCode::UNPROCESSABLE_ENTITY,

            ServiceError::TicketInvalid
            | ServiceError::TicketExpired
            | ServiceError::TicketAlreadyUsed
            | ServiceError::TicketRevoked
            | ServiceError::TicketCannotBeRevoked { .. }
            | ServiceError::TicketNotInExpectedFlow { .. }
            | ServiceError::TemplateNotDeletable
            | ServiceError::VerificationAlreadyVerified
            | ServiceError::VerificationExpired
            | ServiceError::VerificationFailed
            | ServiceError::MultipleOriginHeaderValues
            | ServiceError::MultipleAuthorizationHeaderValues
            | ServiceError::OriginAuthorizationHeadersConflict
            | ServiceError::InvalidProxyUrl
            | ServiceError::InvalidOrigin(_) => StatusCode::BAD_REQUEST,

            ServiceError::FeatureNotSupportedByPlan(_) => StatusCode::FORBIDDEN,

            ServiceError::MissingRequestHeaders
            | ServiceError::DevBrowserUnauthenticated { .. }
            | ServiceError::DeviceMissing
            | ServiceError::SignedOut => StatusCode::UNAUTHORIZED,

            ServiceError::Multiple(errors) => service_core::error::combined_status(
                &errors.iter().map(ServiceError::to_api_error).collect::<Vec<_>>(),
            ),
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short, user-facing message.
    pub fn message(&self) -> String {
        match self {
            ServiceError::TicketRevoked => "cannot be used".to_string(),
            ServiceError::TicketAlreadyUsed => "has already been used".to_string(),
            ServiceError::TicketExpired => "has expired".to_string(),
            ServiceError::TicketInvalid => "is invalid".to_string(),
            ServiceError::VerificationFailed => "Too many failed attempts".to_string(),
            ServiceError::FormCodeIncorrect { .. } => "is incorrect".to_string(),
            ServiceError::Internal(_) => "Oops, an unexpected error occurred".to_string(),
            other => other.to_string(),
        }
    }

    /// Longer explanation. Signature failures stay vague on purpose.
    pub fn long_message(&self) -> String {
        match self {
            ServiceError::SubjectNotFound => {
                "No subject was found with the given identifier in this instance.".to_string()
            }
            ServiceError::MissingParameter(name) => format!("{} must be included.", name),
            ServiceError::InvalidExpiry(reason) => reason.clone(),
            ServiceError::TicketInvalid => "The provided ticket is invalid.".to_string(),
            ServiceError::TicketExpired => "The provided ticket has expired.".to_string(),
            ServiceError::TicketAlreadyUsed => {
                "The provided ticket has already been used.".to_string()
            }
            ServiceError::TicketRevoked => {
                "The provided ticket has been revoked and cannot be used.".to_string()
            }
            ServiceError::TicketNotInExpectedFlow { expected } => format!(
                "The provided ticket cannot be used here; expected a {} ticket.",
                expected.as_str()
            ),
            ServiceError::ReservedClaim(claim) => format!(
                "The claim '{}' is reserved and is set automatically on every token.",
                claim
            ),
            ServiceError::ClaimsTooLarge(size) => format!(
                "Claims are {} bytes when serialized; the limit is {} bytes.",
                size,
                crate::services::jwt_templates::MAX_CLAIMS_BYTES
            ),
            ServiceError::ForbiddenAudience => {
                "The audience claim cannot be set to 'clerk'.".to_string()
            }
            ServiceError::UnsupportedAlgorithm(alg) => format!(
                "'{}' is not supported. Use one of RS256, RS384, RS512, ES256, ES384, ES512, HS256, HS384, HS512.",
                alg
            ),
            ServiceError::SigningKeyInvalid => {
                "A token could not be signed and verified with the configured signing key and algorithm.".to_string()
            }
            ServiceError::TemplateNotDeletable => {
                "The session token template cannot be deleted.".to_string()
            }
            ServiceError::FeatureNotSupportedByPlan(features) => format!(
                "The current plan does not support: {}.",
                features
                    .iter()
                    .map(PlanFeature::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            ServiceError::VerificationFailed => {
                "Too many failed attempts. Start a new verification to try again.".to_string()
            }
            ServiceError::VerificationExpired => {
                "This verification has expired. Start a new verification to try again.".to_string()
            }
            ServiceError::InvalidOrigin(origin) => {
                format!("The request origin '{}' is not allowed for this instance.", origin)
            }
            ServiceError::MissingRequestHeaders => {
                "Requests must include an Origin or an Authorization header.".to_string()
            }
            ServiceError::DevBrowserUnauthenticated { .. } => {
                "Browser unauthenticated. Complete the dev browser handshake and retry.".to_string()
            }
            ServiceError::Internal(_) => {
                "There was an internal error on our servers.".to_string()
            }
            other => other.to_string(),
        }
    }

    pub fn meta(&self) -> Option<ErrorMeta> {
        match self {
            ServiceError::MissingParameter(name) => Some(ErrorMeta::ParamNames {
                param_names: vec![name.clone()],
            }),
            ServiceError::ReservedClaim(claim) => Some(ErrorMeta::ParamNames {
                param_names: vec![claim.clone()],
            }),
            ServiceError::FeatureNotSupportedByPlan(features) => Some(ErrorMeta::Features {
                features: features.iter().map(|f| f.as_str().to_string()).collect(),
            }),
            ServiceError::TicketCannotBeRevoked { status, .. } => Some(ErrorMeta::Status {
                status: status.as_str().to_string(),
            }),
            ServiceError::VerificationIncomplete(status) => Some(ErrorMeta::Status {
                status: status.as_str().to_string(),
            }),
            ServiceError::FormCodeIncorrect { remaining } => Some(ErrorMeta::Attempts {
                remaining_attempts: *remaining,
            }),
            ServiceError::InvalidOrigin(origin) => Some(ErrorMeta::Origin {
                origin: origin.clone(),
            }),
            ServiceError::DevBrowserUnauthenticated { handshake_url } => {
                Some(ErrorMeta::Handshake {
                    handshake_url: handshake_url.clone(),
                })
            }
            _ => None,
        }
    }

    pub fn to_api_error(&self) -> ApiError {
        let error = ApiError::new(self.status(), self.code(), self.message(), self.long_message());
        match self.meta() {
            Some(meta) => error.with_meta(meta),
            None => error,
        }
    }

    /// Collapse a list of validation failures into a single error.
    pub fn from_many(mut errors: Vec<ServiceError>) -> Option<ServiceError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(ServiceError::Multiple(errors)),
        }
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Internal(e) => AppError::InternalError(e),
            ServiceError::Multiple(errors) => {
                AppError::Api(errors.iter().map(ServiceError::to_api_error).collect())
            }
            other => AppError::Api(vec![other.to_api_error()]),
        }
    }
}
