use secrecy::Secret;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::models::{Instance, JwtTemplate};
use crate::services::{ServiceError, SigningKeyParams, TemplateParams, TemplatePatch};

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateJwtTemplateRequest {
    #[schema(example = "supabase")]
    pub name: String,

    #[schema(value_type = Object, example = json!({"role": "authenticated", "email": "{{user.email}}"}))]
    pub claims: serde_json::Value,

    /// Token lifetime in seconds.
    #[schema(example = 60)]
    pub lifetime: Option<i64>,

    /// Allowed clock skew in seconds, subtracted from `iat` to form `nbf`.
    #[schema(example = 5)]
    pub allowed_clock_skew: Option<i64>,

    #[serde(default)]
    pub custom_signing_key: bool,

    #[schema(example = "HS256")]
    pub signing_algorithm: Option<String>,

    /// Shared secret for HS*, PEM private key for RS*/ES*.
    pub signing_key: Option<String>,

    /// Optional PEM public key used to verify the save-time test signature.
    pub public_key: Option<String>,

    /// Designate this template as the instance's session-token template.
    #[serde(default)]
    pub session_token: bool,
}

#[derive(Debug, Default, Deserialize, Validate, ToSchema)]
pub struct UpdateJwtTemplateRequest {
    pub name: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub claims: Option<serde_json::Value>,
    pub lifetime: Option<i64>,
    pub allowed_clock_skew: Option<i64>,
    /// `false` drops a custom key; `true` replaces it with the supplied one.
    pub custom_signing_key: Option<bool>,
    pub signing_algorithm: Option<String>,
    pub signing_key: Option<String>,
    pub public_key: Option<String>,
    pub session_token: Option<bool>,
}

fn signing_key_params(
    algorithm: Option<String>,
    signing_key: Option<String>,
    public_key: Option<String>,
) -> Result<SigningKeyParams, ServiceError> {
    let algorithm = algorithm
        .filter(|a| !a.trim().is_empty())
        .ok_or_else(|| ServiceError::MissingParameter("signing_algorithm".to_string()))?;
    let signing_key = signing_key
        .filter(|k| !k.is_empty())
        .ok_or_else(|| ServiceError::MissingParameter("signing_key".to_string()))?;
    Ok(SigningKeyParams {
        algorithm,
        signing_key: Secret::new(signing_key),
        public_key,
    })
}

impl TryFrom<CreateJwtTemplateRequest> for TemplateParams {
    type Error = ServiceError;

    fn try_from(req: CreateJwtTemplateRequest) -> Result<Self, Self::Error> {
        let signing_key = if req.custom_signing_key {
            Some(signing_key_params(
                req.signing_algorithm,
                req.signing_key,
                req.public_key,
            )?)
        } else {
            None
        };
        Ok(TemplateParams {
            name: req.name,
            claims: req.claims,
            lifetime_seconds: req.lifetime,
            allowed_clock_skew_seconds: req.allowed_clock_skew,
            signing_key,
            session_token: req.session_token,
        })
    }
}

impl TryFrom<UpdateJwtTemplateRequest> for TemplatePatch {
    type Error = ServiceError;

    fn try_from(req: UpdateJwtTemplateRequest) -> Result<Self, Self::Error> {
        let signing_key = match req.custom_signing_key {
            Some(true) => Some(Some(signing_key_params(
                req.signing_algorithm,
                req.signing_key,
                req.public_key,
            )?)),
            Some(false) => Some(None),
            None => None,
        };
        Ok(TemplatePatch {
            name: req.name,
            claims: req.claims,
            lifetime_seconds: req.lifetime,
            allowed_clock_skew_seconds: req.allowed_clock_skew,
            signing_key,
            session_token: req.session_token,
        })
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct JwtTemplateResponse {
    #[schema(example = "jwt_template")]
    pub object: String,
    pub id: String,
    pub name: String,
    #[schema(value_type = Object)]
    pub claims: serde_json::Map<String, serde_json::Value>,
    pub lifetime: i64,
    pub allowed_clock_skew: i64,
    pub custom_signing_key: bool,
    #[schema(example = "RS256")]
    pub signing_algorithm: String,
    pub session_token: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl JwtTemplateResponse {
    /// Render a template for `instance`. Key material is never returned.
    pub fn new(template: &JwtTemplate, instance: &Instance) -> Self {
        Self {
            object: "jwt_template".to_string(),
            id: template.template_id.to_string(),
            name: template.name.clone(),
            claims: template.claims.clone(),
            lifetime: template.lifetime_seconds,
            allowed_clock_skew: template.allowed_clock_skew_seconds,
            custom_signing_key: template.custom_signing_key.is_some(),
            signing_algorithm: template
                .effective_algorithm(instance.keys.algorithm)
                .as_str()
                .to_string(),
            session_token: instance.session_template_id == Some(template.template_id),
            created_at: template.created_utc.timestamp_millis(),
            updated_at: template.updated_utc.timestamp_millis(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TokenResponse {
    #[schema(example = "token")]
    pub object: String,
    pub jwt: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_request(custom_signing_key: bool) -> CreateJwtTemplateRequest {
        CreateJwtTemplateRequest {
            name: "t".to_string(),
            claims: serde_json::json!({}),
            lifetime: None,
            allowed_clock_skew: None,
            custom_signing_key,
            signing_algorithm: Some("HS256".to_string()),
            signing_key: None,
            public_key: None,
            session_token: false,
        }
    }

    #[test]
    fn test_custom_key_requires_secret() {
        let err = TemplateParams::try_from(create_request(true)).unwrap_err();
        assert_eq!(err.code(), "missing_parameter");

        let params = TemplateParams::try_from(create_request(false)).unwrap();
        assert!(params.signing_key.is_none());
    }

    #[test]
    fn test_patch_can_drop_custom_key() {
        let patch = TemplatePatch::try_from(UpdateJwtTemplateRequest {
            custom_signing_key: Some(false),
            ..Default::default()
        })
        .unwrap();
        assert!(matches!(patch.signing_key, Some(None)));

        let patch = TemplatePatch::try_from(UpdateJwtTemplateRequest::default()).unwrap();
        assert!(patch.signing_key.is_none());
    }
}
