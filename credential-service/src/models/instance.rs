//! Instance model - the configuration boundary every other entity belongs to.

use chrono::{DateTime, Utc};
use secrecy::Secret;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::SigningAlgorithm;

/// Instance environment codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceEnvironment {
    Production,
    Development,
}

impl InstanceEnvironment {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceEnvironment::Production => "production",
            InstanceEnvironment::Development => "development",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "production" => Some(InstanceEnvironment::Production),
            "development" | "staging" => Some(InstanceEnvironment::Development),
            _ => None,
        }
    }
}

/// Subscription-gated capabilities relevant to this core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanFeature {
    CustomSessionToken,
    CustomJwtTemplates,
}

impl PlanFeature {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanFeature::CustomSessionToken => "custom_session_token",
            PlanFeature::CustomJwtTemplates => "custom_jwt_templates",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "custom_session_token" => Some(PlanFeature::CustomSessionToken),
            "custom_jwt_templates" => Some(PlanFeature::CustomJwtTemplates),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanFeatures {
    /// Internal or grandfathered instances skip feature checks entirely.
    pub unrestricted: bool,
    pub features: Vec<PlanFeature>,
}

impl PlanFeatures {
    pub fn allows(&self, feature: PlanFeature) -> bool {
        self.unrestricted || self.features.contains(&feature)
    }
}

/// The instance's active signing key pair.
///
/// For HMAC algorithms `private_key` is the shared secret and `public_key` is empty.
#[derive(Debug, Clone)]
pub struct InstanceKeys {
    pub key_id: String,
    pub algorithm: SigningAlgorithm,
    pub private_key: Secret<String>,
    pub public_key: String,
}

/// Instance entity.
#[derive(Debug, Clone)]
pub struct Instance {
    pub instance_id: Uuid,
    pub environment: InstanceEnvironment,
    /// Host of the authentication (frontend API) domain, e.g. `clerk.example.com`.
    pub auth_domain: String,
    pub proxy_url: Option<String>,
    pub satellite_domains: Vec<String>,
    pub allowed_origins: Vec<String>,
    pub keys: InstanceKeys,
    pub session_template_id: Option<Uuid>,
    pub plan: PlanFeatures,
    pub created_utc: DateTime<Utc>,
}

impl Instance {
    /// Create a new instance with no templates.
    pub fn new(
        environment: InstanceEnvironment,
        auth_domain: impl Into<String>,
        keys: InstanceKeys,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            environment,
            auth_domain: auth_domain.into().to_ascii_lowercase(),
            proxy_url: None,
            satellite_domains: Vec::new(),
            allowed_origins: Vec::new(),
            keys,
            session_template_id: None,
            plan: PlanFeatures::default(),
            created_utc: now,
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment == InstanceEnvironment::Production
    }

    /// Base URL for links this instance issues (the proxy when configured).
    pub fn frontend_url(&self) -> String {
        match &self.proxy_url {
            Some(proxy) => proxy.trim_end_matches('/').to_string(),
            None => format!("https://{}", self.auth_domain),
        }
    }

    /// Value of the `iss` claim on every token this instance signs.
    pub fn issuer(&self) -> String {
        format!("https://{}", self.auth_domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> InstanceKeys {
        InstanceKeys {
            key_id: "ins_test".to_string(),
            algorithm: SigningAlgorithm::HS256,
            private_key: Secret::new("secret".to_string()),
            public_key: String::new(),
        }
    }

    #[test]
    fn test_frontend_url_prefers_proxy() {
        let mut instance = Instance::new(
            InstanceEnvironment::Production,
            "Clerk.Example.com",
            keys(),
            Utc::now(),
        );
        assert_eq!(instance.auth_domain, "clerk.example.com");
        assert_eq!(instance.frontend_url(), "https://clerk.example.com");

        instance.proxy_url = Some("https://example.com/__auth/".to_string());
        assert_eq!(instance.frontend_url(), "https://example.com/__auth");
        assert_eq!(instance.issuer(), "https://clerk.example.com");
    }

    #[test]
    fn test_plan_allows() {
        let mut plan = PlanFeatures::default();
        assert!(!plan.allows(PlanFeature::CustomJwtTemplates));

        plan.features.push(PlanFeature::CustomJwtTemplates);
        assert!(plan.allows(PlanFeature::CustomJwtTemplates));
        assert!(!plan.allows(PlanFeature::CustomSessionToken));

        plan.unrestricted = true;
        assert!(plan.allows(PlanFeature::CustomSessionToken));
    }

    #[test]
    fn test_environment_parse() {
        assert_eq!(
            InstanceEnvironment::parse("staging"),
            Some(InstanceEnvironment::Development)
        );
        assert_eq!(InstanceEnvironment::parse("prod"), None);
    }
}
