use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

use crate::services::{StrategyLimits, TicketPolicy, VerificationPolicy};

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub security: SecurityConfig,
    pub tickets: TicketConfig,
    pub devices: DeviceConfig,
    pub verification: VerificationConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Unset in dev means the in-memory store.
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
    pub admin_api_key: String,
    pub debug_errors: bool,
    pub bootstrap_paths_extra: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TicketConfig {
    pub default_ttl_seconds: i64,
    pub actor_max_ttl_seconds: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub token_lifetime_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerificationConfig {
    pub code_max_attempts: u32,
    pub code_lifetime_seconds: i64,
    pub redirect_lifetime_seconds: i64,
}

impl CredentialConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let database_url = match env::var("DATABASE_URL") {
            Ok(url) if !url.trim().is_empty() => Some(url),
            _ if is_prod => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "DATABASE_URL is required in production but not set"
                )))
            }
            _ => None,
        };

        let config = CredentialConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("credential-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.trim().is_empty()),
            database: DatabaseConfig {
                url: database_url,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", "10", is_prod)?,
            },
            security: SecurityConfig {
                allowed_origins: split_list(&get_env(
                    "ALLOWED_ORIGINS",
                    Some("http://localhost:3000"),
                    is_prod,
                )?),
                admin_api_key: get_env("ADMIN_API_KEY", None, true)?,
                debug_errors: get_env("DEBUG_ERRORS", Some("false"), is_prod)?
                    .parse()
                    .unwrap_or(false),
                bootstrap_paths_extra: split_list(&get_env(
                    "BOOTSTRAP_PATHS_EXTRA",
                    Some(""),
                    is_prod,
                )?),
            },
            tickets: TicketConfig {
                default_ttl_seconds: parse_env("TICKET_DEFAULT_TTL_SECONDS", "3600", is_prod)?,
                actor_max_ttl_seconds: parse_env("ACTOR_TOKEN_MAX_TTL_SECONDS", "86400", is_prod)?,
            },
            devices: DeviceConfig {
                token_lifetime_days: parse_env("DEVICE_TOKEN_LIFETIME_DAYS", "90", is_prod)?,
            },
            verification: VerificationConfig {
                code_max_attempts: parse_env("VERIFICATION_CODE_MAX_ATTEMPTS", "3", is_prod)?,
                code_lifetime_seconds: parse_env(
                    "VERIFICATION_CODE_LIFETIME_SECONDS",
                    "600",
                    is_prod,
                )?,
                redirect_lifetime_seconds: parse_env(
                    "VERIFICATION_REDIRECT_LIFETIME_SECONDS",
                    "600",
                    is_prod,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.admin_key_is_blank() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "ADMIN_API_KEY must not be empty"
            )));
        }

        if self.tickets.default_ttl_seconds <= 0
            || self.tickets.actor_max_ttl_seconds < self.tickets.default_ttl_seconds
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "TICKET_DEFAULT_TTL_SECONDS must be positive and at most ACTOR_TOKEN_MAX_TTL_SECONDS"
            )));
        }

        if self.devices.token_lifetime_days <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "DEVICE_TOKEN_LIFETIME_DAYS must be positive"
            )));
        }

        if self.verification.code_max_attempts == 0
            || self.verification.code_lifetime_seconds <= 0
            || self.verification.redirect_lifetime_seconds <= 0
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Verification attempts and lifetimes must be positive"
            )));
        }

        if self.environment == Environment::Prod {
            if self.security.allowed_origins.iter().any(|o| o == "*") {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Wildcard CORS origin not allowed in production"
                )));
            }

            if self.security.debug_errors {
                tracing::error!("DEBUG_ERRORS is enabled in production - internal causes will be exposed");
            }
        }

        Ok(())
    }

    fn admin_key_is_blank(&self) -> bool {
        self.security.admin_api_key.trim().is_empty()
    }

    pub fn ticket_policy(&self) -> TicketPolicy {
        TicketPolicy {
            actor_default_ttl: self.tickets.default_ttl_seconds,
            actor_max_ttl: self.tickets.actor_max_ttl_seconds,
            ..TicketPolicy::default()
        }
    }

    pub fn verification_policy(&self) -> VerificationPolicy {
        let defaults = VerificationPolicy::default();
        VerificationPolicy {
            code: StrategyLimits {
                max_attempts: self.verification.code_max_attempts,
                lifetime_seconds: self.verification.code_lifetime_seconds,
            },
            redirect: StrategyLimits {
                lifetime_seconds: self.verification.redirect_lifetime_seconds,
                ..defaults.redirect
            },
            ..defaults
        }
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: &str, is_prod: bool) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), is_prod)?
        .trim()
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{} is invalid: {}", key, e)))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}
