//! JWT template management and token minting.

use jsonwebtoken::{decode, encode};
use regex::Regex;
use secrecy::{ExposeSecret, Secret};
use serde_json::{json, Map, Value};
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

use super::{
    clock::Clock,
    error::ServiceError,
    events::{CredentialEvent, EventSink},
    keys::{KeyProvider, SigningMaterial},
};
use crate::models::{
    CustomSigningKey, Instance, JwtTemplate, PlanFeature, SigningAlgorithm, Subject,
};
use crate::store::{
    CredentialStore, SessionPointer, TemplateChange, TemplateUnitOfWork, UnitOfWorkOutcome,
};

pub const MAX_NAME_LENGTH: usize = 64;
pub const MAX_CLAIMS_BYTES: usize = 4096;
pub const RESERVED_NAME_PREFIX: &str = "clerk";
pub const RESERVED_CLAIMS: [&str; 6] = ["iat", "nbf", "exp", "iss", "sub", "azp"];
pub const FORBIDDEN_AUDIENCE: &str = "clerk";
pub const MIN_LIFETIME_SECONDS: i64 = 30;
pub const MAX_LIFETIME_SECONDS: i64 = 315_360_000;
pub const MAX_CLOCK_SKEW_SECONDS: i64 = 300;

/// Custom key as submitted by the caller.
#[derive(Debug, Clone)]
pub struct SigningKeyParams {
    pub algorithm: String,
    pub signing_key: Secret<String>,
    pub public_key: Option<String>,
}

/// Full template definition as submitted on create.
#[derive(Debug, Clone)]
pub struct TemplateParams {
    pub name: String,
    pub claims: Value,
    pub lifetime_seconds: Option<i64>,
    pub allowed_clock_skew_seconds: Option<i64>,
    pub signing_key: Option<SigningKeyParams>,
    /// Make this the instance's session-token template.
    pub session_token: bool,
}

/// Partial update; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct TemplatePatch {
    pub name: Option<String>,
    pub claims: Option<Value>,
    pub lifetime_seconds: Option<i64>,
    pub allowed_clock_skew_seconds: Option<i64>,
    /// `Some(None)` removes the custom key and falls back to the instance default.
    pub signing_key: Option<Option<SigningKeyParams>>,
    pub session_token: Option<bool>,
}

/// Check every static rule on a template definition, reporting all violations.
pub fn validate(params: &TemplateParams) -> Result<(), ServiceError> {
    let mut errors = Vec::new();

    if let Err(e) = validate_name(&params.name) {
        errors.push(e);
    }
    errors.extend(validate_claims(&params.claims));

    if let Some(key) = &params.signing_key {
        if SigningAlgorithm::parse(&key.algorithm).is_none() {
            errors.push(ServiceError::UnsupportedAlgorithm(key.algorithm.clone()));
        }
    }

    if let Some(lifetime) = params.lifetime_seconds {
        if !(MIN_LIFETIME_SECONDS..=MAX_LIFETIME_SECONDS).contains(&lifetime) {
            errors.push(ServiceError::InvalidLifetime(lifetime));
        }
    }
    if let Some(skew) = params.allowed_clock_skew_seconds {
        if !(0..=MAX_CLOCK_SKEW_SECONDS).contains(&skew) {
            errors.push(ServiceError::InvalidClockSkew(skew));
        }
    }

    match ServiceError::from_many(errors) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn validate_name(name: &str) -> Result<(), ServiceError> {
    let well_formed = !name.is_empty()
        && name.len() <= MAX_NAME_LENGTH
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !well_formed {
        return Err(ServiceError::InvalidTemplateName);
    }
    if name
        .get(..RESERVED_NAME_PREFIX.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(RESERVED_NAME_PREFIX))
    {
        return Err(ServiceError::ReservedTemplateName);
    }
    Ok(())
}

fn validate_claims(claims: &Value) -> Vec<ServiceError> {
    let Value::Object(map) = claims else {
        return vec![ServiceError::ClaimsNotObject];
    };

    let mut errors = Vec::new();
    let size = claims.to_string().len();
    if size > MAX_CLAIMS_BYTES {
        errors.push(ServiceError::ClaimsTooLarge(size));
    }

    for reserved in RESERVED_CLAIMS {
        if map.contains_key(reserved) {
            errors.push(ServiceError::ReservedClaim(reserved.to_string()));
        }
    }

    let forbidden = |v: &Value| {
        v.as_str()
            .is_some_and(|s| s.eq_ignore_ascii_case(FORBIDDEN_AUDIENCE))
    };
    let audience_forbidden = match map.get("aud") {
        Some(Value::Array(items)) => items.iter().any(forbidden),
        Some(value) => forbidden(value),
        None => false,
    };
    if audience_forbidden {
        errors.push(ServiceError::ForbiddenAudience);
    }

    errors
}

const SHORTCODE: &str = r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}";

fn shortcode_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(SHORTCODE).expect("shortcode pattern is a valid literal"))
}

fn lookup<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(context, |node, segment| node.get(segment))
}

/// Replace `{{path}}` shortcodes in string values with data from `context`.
///
/// A string that is exactly one shortcode takes the referenced value with its
/// JSON type (null when missing). Shortcodes inside longer strings are
/// interpolated as text.
pub fn render_shortcodes(value: &Value, context: &Value) -> Value {
    match value {
        Value::String(s) => render_string(s, context),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| render_shortcodes(item, context))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_shortcodes(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn render_string(s: &str, context: &Value) -> Value {
    let pattern = shortcode_pattern();

    if let Some(caps) = pattern.captures(s.trim()) {
        if caps.get(0).is_some_and(|m| m.as_str().len() == s.trim().len()) {
            return lookup(context, &caps[1]).cloned().unwrap_or(Value::Null);
        }
    }

    let rendered = pattern.replace_all(s, |caps: &regex::Captures| match lookup(context, &caps[1]) {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    });
    Value::String(rendered.into_owned())
}

#[derive(Clone)]
pub struct JwtTemplateService {
    store: Arc<dyn CredentialStore>,
    keys: Arc<dyn KeyProvider>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl JwtTemplateService {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        keys: Arc<dyn KeyProvider>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            keys,
            clock,
            events,
        }
    }

    pub async fn list(&self, instance: &Instance) -> Result<Vec<JwtTemplate>, ServiceError> {
        Ok(self.store.list_templates(instance.instance_id).await?)
    }

    pub async fn get(
        &self,
        instance: &Instance,
        template_id: Uuid,
    ) -> Result<JwtTemplate, ServiceError> {
        self.store
            .find_template(instance.instance_id, template_id)
            .await?
            .ok_or(ServiceError::TemplateNotFound)
    }

    pub async fn get_by_name(
        &self,
        instance: &Instance,
        name: &str,
    ) -> Result<JwtTemplate, ServiceError> {
        self.store
            .find_template_by_name(instance.instance_id, name)
            .await?
            .ok_or(ServiceError::TemplateNotFound)
    }

    #[tracing::instrument(skip(self, instance, params), fields(instance_id = %instance.instance_id, name = %params.name))]
    pub async fn create(
        &self,
        instance: &Instance,
        params: TemplateParams,
    ) -> Result<JwtTemplate, ServiceError> {
        validate(&params)?;
        check_plan(instance, params.session_token)?;

        if self
            .store
            .find_template_by_name(instance.instance_id, &params.name)
            .await?
            .is_some()
        {
            return Err(ServiceError::TemplateNameTaken);
        }

        let now = self.clock.now();
        let Value::Object(claims) = params.claims else {
            return Err(ServiceError::ClaimsNotObject);
        };
        let mut template = JwtTemplate::new(instance.instance_id, params.name, claims, now);
        if let Some(lifetime) = params.lifetime_seconds {
            template.lifetime_seconds = lifetime;
        }
        if let Some(skew) = params.allowed_clock_skew_seconds {
            template.allowed_clock_skew_seconds = skew;
        }
        template.custom_signing_key = params.signing_key.map(custom_key).transpose()?;

        self.mint_test_token(&template, instance)?;

        let pointer = if params.session_token {
            SessionPointer::Set(template.template_id)
        } else {
            SessionPointer::Keep
        };
        self.commit(instance, TemplateChange::Upsert(template.clone()), pointer)
            .await?;

        self.events.emit(CredentialEvent::TemplateSaved {
            instance_id: instance.instance_id,
            template_id: template.template_id,
        });
        Ok(template)
    }

    #[tracing::instrument(skip(self, instance, patch), fields(instance_id = %instance.instance_id))]
    pub async fn update(
        &self,
        instance: &Instance,
        template_id: Uuid,
        patch: TemplatePatch,
    ) -> Result<JwtTemplate, ServiceError> {
        let existing = self.get(instance, template_id).await?;
        let is_session = instance.session_template_id == Some(template_id);

        let signing_key = match patch.signing_key {
            Some(replacement) => replacement,
            None => existing.custom_signing_key.as_ref().map(|k| SigningKeyParams {
                algorithm: k.algorithm.as_str().to_string(),
                signing_key: k.signing_key.clone(),
                public_key: k.public_key.clone(),
            }),
        };
        let params = TemplateParams {
            name: patch.name.unwrap_or_else(|| existing.name.clone()),
            claims: patch
                .claims
                .unwrap_or_else(|| Value::Object(existing.claims.clone())),
            lifetime_seconds: Some(patch.lifetime_seconds.unwrap_or(existing.lifetime_seconds)),
            allowed_clock_skew_seconds: Some(
                patch
                    .allowed_clock_skew_seconds
                    .unwrap_or(existing.allowed_clock_skew_seconds),
            ),
            signing_key,
            session_token: patch.session_token.unwrap_or(is_session),
        };

        validate(&params)?;
        check_plan(instance, params.session_token)?;

        if params.name != existing.name {
            let clash = self
                .store
                .find_template_by_name(instance.instance_id, &params.name)
                .await?;
            if clash.is_some_and(|t| t.template_id != template_id) {
                return Err(ServiceError::TemplateNameTaken);
            }
        }

        let Value::Object(claims) = params.claims else {
            return Err(ServiceError::ClaimsNotObject);
        };
        let template = JwtTemplate {
            name: params.name,
            claims,
            lifetime_seconds: params.lifetime_seconds.unwrap_or(existing.lifetime_seconds),
            allowed_clock_skew_seconds: params
                .allowed_clock_skew_seconds
                .unwrap_or(existing.allowed_clock_skew_seconds),
            custom_signing_key: params.signing_key.map(custom_key).transpose()?,
            updated_utc: self.clock.now(),
            ..existing
        };

        self.mint_test_token(&template, instance)?;

        let pointer = match (params.session_token, is_session) {
            (true, false) => SessionPointer::Set(template_id),
            (false, true) => SessionPointer::Clear,
            _ => SessionPointer::Keep,
        };
        self.commit(instance, TemplateChange::Upsert(template.clone()), pointer)
            .await?;

        self.events.emit(CredentialEvent::TemplateSaved {
            instance_id: instance.instance_id,
            template_id,
        });
        Ok(template)
    }

    /// Hard-delete a template. The session-token template cannot be deleted.
    pub async fn delete(&self, instance: &Instance, template_id: Uuid) -> Result<(), ServiceError> {
        self.get(instance, template_id).await?;
        if instance.session_template_id == Some(template_id) {
            return Err(ServiceError::TemplateNotDeletable);
        }

        self.commit(
            instance,
            TemplateChange::Delete(template_id),
            SessionPointer::Keep,
        )
        .await?;

        self.events.emit(CredentialEvent::TemplateDeleted {
            instance_id: instance.instance_id,
            template_id,
        });
        Ok(())
    }

    /// Sign a token for `subject` from `template`.
    pub fn mint(
        &self,
        template: &JwtTemplate,
        instance: &Instance,
        subject: &Subject,
        azp: Option<&str>,
    ) -> Result<String, ServiceError> {
        let material = self.material_for(template, instance)?;

        let mut user = match &subject.data {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        user.insert("id".to_string(), Value::String(subject.subject_id.clone()));
        let context = json!({ "user": Value::Object(user) });

        let Value::Object(mut claims) =
            render_shortcodes(&Value::Object(template.claims.clone()), &context)
        else {
            return Err(ServiceError::ClaimsNotObject);
        };

        let now = self.clock.now().timestamp();
        claims.insert("iat".to_string(), json!(now));
        claims.insert(
            "nbf".to_string(),
            json!(now - template.allowed_clock_skew_seconds),
        );
        claims.insert("exp".to_string(), json!(now + template.lifetime_seconds));
        claims.insert("iss".to_string(), json!(instance.issuer()));
        claims.insert("sub".to_string(), json!(subject.subject_id));
        if let Some(azp) = azp {
            claims.insert("azp".to_string(), json!(azp));
        }

        encode(&material.header(), &Value::Object(claims), &material.encoding)
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Failed to sign token: {}", e)))
    }

    /// Prove the template's effective key and algorithm can produce a verifiable signature.
    pub fn mint_test_token(
        &self,
        template: &JwtTemplate,
        instance: &Instance,
    ) -> Result<(), ServiceError> {
        let material = self.material_for(template, instance).map_err(|e| {
            tracing::info!(error = %e, "Template signing key rejected");
            ServiceError::SigningKeyInvalid
        })?;

        let now = self.clock.now().timestamp();
        let claims = json!({ "test": "dummy", "exp": now + 60 });
        let token = encode(&material.header(), &claims, &material.encoding).map_err(|e| {
            tracing::info!(error = %e, "Template dry-run signing failed");
            ServiceError::SigningKeyInvalid
        })?;

        if let Some(decoding) = &material.decoding {
            decode::<Value>(&token, decoding, &material.validation()).map_err(|e| {
                tracing::info!(error = %e, "Template dry-run verification failed");
                ServiceError::SigningKeyInvalid
            })?;
        }
        Ok(())
    }

    fn material_for(
        &self,
        template: &JwtTemplate,
        instance: &Instance,
    ) -> Result<Arc<SigningMaterial>, ServiceError> {
        match &template.custom_signing_key {
            Some(key) => SigningMaterial::parse(
                key.algorithm,
                key.signing_key.expose_secret(),
                key.public_key.as_deref(),
                None,
            )
            .map(Arc::new)
            .map_err(|e| {
                tracing::debug!(error = %e, "Custom signing key unusable");
                ServiceError::SigningKeyInvalid
            }),
            None => Ok(self.keys.instance_material(instance)?),
        }
    }

    async fn commit(
        &self,
        instance: &Instance,
        change: TemplateChange,
        session_pointer: SessionPointer,
    ) -> Result<(), ServiceError> {
        let outcome = self
            .store
            .apply_template_change(TemplateUnitOfWork {
                instance_id: instance.instance_id,
                change,
                session_pointer,
            })
            .await?;
        match outcome {
            UnitOfWorkOutcome::Applied => Ok(()),
            UnitOfWorkOutcome::NameTaken => Err(ServiceError::TemplateNameTaken),
            UnitOfWorkOutcome::NotFound => Err(ServiceError::TemplateNotFound),
            UnitOfWorkOutcome::SessionTemplateInUse => Err(ServiceError::TemplateNotDeletable),
        }
    }
}

fn check_plan(instance: &Instance, session_token: bool) -> Result<(), ServiceError> {
    let feature = if session_token {
        PlanFeature::CustomSessionToken
    } else {
        PlanFeature::CustomJwtTemplates
    };
    if instance.plan.allows(feature) {
        Ok(())
    } else {
        Err(ServiceError::FeatureNotSupportedByPlan(vec![feature]))
    }
}

fn custom_key(params: SigningKeyParams) -> Result<CustomSigningKey, ServiceError> {
    let algorithm = SigningAlgorithm::parse(&params.algorithm)
        .ok_or_else(|| ServiceError::UnsupportedAlgorithm(params.algorithm.clone()))?;
    Ok(CustomSigningKey {
        algorithm,
        signing_key: params.signing_key,
        public_key: params.public_key.filter(|k| !k.trim().is_empty()),
    })
}
