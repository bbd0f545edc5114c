use std::sync::atomic::{AtomicBool, Ordering};

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::middleware::tracing::current_request_id;

static DEBUG_ERRORS: AtomicBool = AtomicBool::new(false);

/// Include wrapped causes of internal errors in responses. Never enable in production.
pub fn set_debug_errors(enabled: bool) {
    DEBUG_ERRORS.store(enabled, Ordering::Relaxed);
}

fn debug_errors() -> bool {
    DEBUG_ERRORS.load(Ordering::Relaxed)
}

/// Statically typed metadata attached to an error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ErrorMeta {
    ParamNames { param_names: Vec<String> },
    Features { features: Vec<String> },
    Status { status: String },
    Attempts { remaining_attempts: u32 },
    Origin { origin: String },
    Handshake { handshake_url: String },
}

/// One entry of the `errors` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub message: String,
    pub long_message: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ErrorMeta>,
}

/// An error body together with the HTTP status it maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        code: impl Into<String>,
        message: impl Into<String>,
        long_message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            body: ErrorBody {
                message: message.into(),
                long_message: long_message.into(),
                code: code.into(),
                meta: None,
            },
        }
    }

    pub fn with_meta(mut self, meta: ErrorMeta) -> Self {
        self.body.meta = Some(meta);
        self
    }
}

/// Wire envelope for every error response.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub errors: Vec<ErrorBody>,
    pub clerk_trace_id: String,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("API error: {}", summarize(.0))]
    Api(Vec<ApiError>),

    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Bad request: {0}")]
    BadRequest(anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Unauthorized: {0}")]
    Unauthorized(anyhow::Error),

    #[error("Forbidden: {0}")]
    Forbidden(anyhow::Error),

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

fn summarize(errors: &[ApiError]) -> String {
    errors
        .iter()
        .map(|e| e.body.code.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

impl From<ApiError> for AppError {
    fn from(err: ApiError) -> Self {
        AppError::Api(vec![err])
    }
}

impl AppError {
    /// Flatten into the list of error bodies this error renders as.
    pub fn into_api_errors(self) -> Vec<ApiError> {
        match self {
            AppError::Api(errors) => errors,
            AppError::ValidationError(err) => {
                let mut fields: Vec<String> =
                    err.field_errors().keys().map(|k| k.to_string()).collect();
                fields.sort();
                vec![
                    ApiError::new(
                        StatusCode::UNPROCESSABLE_ENTITY,
                        "form_param_invalid",
                        "is invalid",
                        err.to_string(),
                    )
                    .with_meta(ErrorMeta::ParamNames {
                        param_names: fields,
                    }),
                ]
            }
            AppError::BadRequest(err) => vec![ApiError::new(
                StatusCode::BAD_REQUEST,
                "bad_request",
                "Bad request",
                err.to_string(),
            )],
            AppError::NotFound(err) => vec![ApiError::new(
                StatusCode::NOT_FOUND,
                "resource_not_found",
                "Not found",
                err.to_string(),
            )],
            AppError::Unauthorized(err) => vec![ApiError::new(
                StatusCode::UNAUTHORIZED,
                "authentication_invalid",
                "Unauthorized request",
                err.to_string(),
            )],
            AppError::Forbidden(err) => vec![ApiError::new(
                StatusCode::FORBIDDEN,
                "authorization_invalid",
                "Forbidden",
                err.to_string(),
            )],
            AppError::InternalError(err)
            | AppError::DatabaseError(err)
            | AppError::ConfigError(err) => {
                tracing::error!(error = ?err, "Unexpected error");
                let long_message = if debug_errors() {
                    format!("{:#}", err)
                } else {
                    "There was an internal error on our servers. We've been notified and are working on fixing it.".to_string()
                };
                vec![ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Oops, an unexpected error occurred",
                    long_message,
                )]
            }
        }
    }
}

/// Pick the response status for a set of errors: any 5xx wins, otherwise the highest 4xx.
pub fn combined_status(errors: &[ApiError]) -> StatusCode {
    errors
        .iter()
        .map(|e| e.status)
        .max_by_key(|s| s.as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let errors = self.into_api_errors();
        let status = combined_status(&errors);

        let envelope = ErrorEnvelope {
            errors: errors.into_iter().map(|e| e.body).collect(),
            clerk_trace_id: current_request_id().unwrap_or_default(),
        };

        (status, Json(envelope)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_status_prefers_server_errors() {
        let errors = vec![
            ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "a", "a", "a"),
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "b", "b", "b"),
            ApiError::new(StatusCode::BAD_REQUEST, "c", "c", "c"),
        ];
        assert_eq!(combined_status(&errors), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_combined_status_picks_highest_client_error() {
        let errors = vec![
            ApiError::new(StatusCode::BAD_REQUEST, "a", "a", "a"),
            ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "b", "b", "b"),
        ];
        assert_eq!(combined_status(&errors), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_internal_error_hides_cause_by_default() {
        let errors = AppError::InternalError(anyhow::anyhow!("db password leaked")).into_api_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].body.code, "internal_error");
        assert!(!errors[0].body.long_message.contains("leaked"));
    }

    #[test]
    fn test_meta_serializes_flat() {
        let body = ErrorBody {
            message: "missing".to_string(),
            long_message: "missing".to_string(),
            code: "missing_parameter".to_string(),
            meta: Some(ErrorMeta::ParamNames {
                param_names: vec!["actor.sub".to_string()],
            }),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["meta"]["param_names"][0], "actor.sub");
    }
}
