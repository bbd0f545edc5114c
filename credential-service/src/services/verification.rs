//! Verification state machine shared by every identity-proof strategy.
//!
//! `unverified` is the only non-terminal state. Strategies differ only in how a
//! proof is compared against the stored secret; every transition is a
//! conditional write on (status, attempts).

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::{Rng, RngCore};
use secrecy::Secret;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use super::{
    clock::Clock,
    dispatch::CodeDispatcher,
    error::ServiceError,
    events::{CredentialEvent, EventSink},
};
use crate::models::{Instance, Strategy, Verification, VerificationStatus};
use crate::store::CredentialStore;
use crate::utils::password::verify_password;

/// How many times an attempt re-reads the row after losing a conditional write.
const MAX_CAS_RETRIES: usize = 5;

const CODE_DIGITS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyLimits {
    pub max_attempts: u32,
    pub lifetime_seconds: i64,
}

#[derive(Debug, Clone)]
pub struct VerificationPolicy {
    pub code: StrategyLimits,
    pub redirect: StrategyLimits,
    pub passkey: StrategyLimits,
    pub password: StrategyLimits,
}

impl Default for VerificationPolicy {
    fn default() -> Self {
        Self {
            code: StrategyLimits {
                max_attempts: 3,
                lifetime_seconds: 600,
            },
            redirect: StrategyLimits {
                max_attempts: 3,
                lifetime_seconds: 600,
            },
            passkey: StrategyLimits {
                max_attempts: 3,
                lifetime_seconds: 300,
            },
            password: StrategyLimits {
                max_attempts: 5,
                lifetime_seconds: 600,
            },
        }
    }
}

impl VerificationPolicy {
    pub fn limits_for(&self, strategy: Strategy) -> StrategyLimits {
        match strategy {
            Strategy::EmailCode | Strategy::PhoneCode => self.code,
            Strategy::OAuth | Strategy::Saml => self.redirect,
            Strategy::Passkey => self.passkey,
            Strategy::Password => self.password,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PrepareVerification {
    pub strategy: Strategy,
    /// Email address, phone number, provider account or user reference being proven.
    pub identification: String,
    /// Authorization endpoint of the external provider, required for redirect strategies.
    pub provider_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PreparedVerification {
    pub verification: Verification,
    /// Passkey challenge to hand to the client. Codes travel out of band instead.
    pub challenge: Option<String>,
}

/// Evidence offered by an attempt.
#[derive(Debug, Clone)]
pub enum Proof {
    /// One-time code typed by the user.
    Code(String),
    /// OAuth/SAML state or passkey challenge echoed back after the provider protocol check.
    Nonce(String),
    /// Candidate password and the stored hash it must match.
    Password {
        candidate: Secret<String>,
        hash: String,
    },
}

impl Proof {
    fn fits(&self, strategy: Strategy) -> bool {
        match self {
            Proof::Code(_) => strategy.is_code(),
            Proof::Nonce(_) => strategy.is_redirect() || strategy == Strategy::Passkey,
            Proof::Password { .. } => strategy == Strategy::Password,
        }
    }
}

fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

fn generate_code() -> String {
    let n: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{:0width$}", n, width = CODE_DIGITS)
}

fn generate_nonce() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn matches_hash(candidate: &str, stored: Option<&str>) -> bool {
    let Some(stored) = stored else {
        return false;
    };
    let candidate = sha256_hex(candidate.trim());
    bool::from(candidate.as_bytes().ct_eq(stored.as_bytes()))
}

fn authorization_url(provider_url: &str, state: &str) -> Result<String, ServiceError> {
    let mut url = url::Url::parse(provider_url)
        .ok()
        .filter(|u| matches!(u.scheme(), "http" | "https"))
        .ok_or_else(|| ServiceError::MissingParameter("provider_url".to_string()))?;
    url.query_pairs_mut().append_pair("state", state);
    Ok(url.to_string())
}

#[derive(Clone)]
pub struct VerificationService {
    store: Arc<dyn CredentialStore>,
    dispatcher: Arc<dyn CodeDispatcher>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    policy: VerificationPolicy,
}

impl VerificationService {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        dispatcher: Arc<dyn CodeDispatcher>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        policy: VerificationPolicy,
    ) -> Self {
        Self {
            store,
            dispatcher,
            clock,
            events,
            policy,
        }
    }

    pub async fn get(
        &self,
        instance: &Instance,
        verification_id: Uuid,
    ) -> Result<Verification, ServiceError> {
        self.store
            .find_verification(instance.instance_id, verification_id)
            .await?
            .ok_or(ServiceError::VerificationNotFound)
    }

    /// Create a fresh `unverified` verification and start the strategy's proof flow.
    #[tracing::instrument(skip(self, instance, request), fields(instance_id = %instance.instance_id, strategy = request.strategy.as_str()))]
    pub async fn prepare(
        &self,
        instance: &Instance,
        request: PrepareVerification,
    ) -> Result<PreparedVerification, ServiceError> {
        if request.identification.trim().is_empty() {
            return Err(ServiceError::MissingParameter("identification".to_string()));
        }

        let limits = self.policy.limits_for(request.strategy);
        let mut verification = Verification::new(
            instance.instance_id,
            request.strategy,
            request.identification.trim(),
            limits.max_attempts,
            limits.lifetime_seconds,
            self.clock.now(),
        );

        let mut code = None;
        let mut challenge = None;
        match request.strategy {
            Strategy::EmailCode | Strategy::PhoneCode => {
                let generated = generate_code();
                verification.secret_hash = Some(sha256_hex(&generated));
                code = Some(generated);
            }
            Strategy::OAuth | Strategy::Saml => {
                let provider_url = request
                    .provider_url
                    .as_deref()
                    .ok_or_else(|| ServiceError::MissingParameter("provider_url".to_string()))?;
                let state = generate_nonce();
                verification.external_authorization_url =
                    Some(authorization_url(provider_url, &state)?);
                verification.secret_hash = Some(sha256_hex(&state));
            }
            Strategy::Passkey => {
                let nonce = generate_nonce();
                verification.secret_hash = Some(sha256_hex(&nonce));
                challenge = Some(nonce);
            }
            Strategy::Password => {}
        }

        self.store.insert_verification(&verification).await?;

        if let Some(code) = code {
            self.dispatcher
                .dispatch(verification.strategy, &verification.identification, &code)
                .await?;
        }

        tracing::info!(verification_id = %verification.verification_id, "Verification prepared");
        self.events.emit(CredentialEvent::VerificationPrepared {
            instance_id: instance.instance_id,
            verification_id: verification.verification_id,
            strategy: verification.strategy,
        });

        Ok(PreparedVerification {
            verification,
            challenge,
        })
    }

    /// Evaluate one proof. Exactly one concurrent attempt wins each (status, attempts) state.
    #[tracing::instrument(skip(self, instance, proof), fields(instance_id = %instance.instance_id))]
    pub async fn attempt(
        &self,
        instance: &Instance,
        verification_id: Uuid,
        proof: Proof,
    ) -> Result<Verification, ServiceError> {
        for _ in 0..MAX_CAS_RETRIES {
            let current = self.get(instance, verification_id).await?;

            match current.status {
                VerificationStatus::Verified => {
                    return Err(ServiceError::VerificationAlreadyVerified)
                }
                VerificationStatus::Failed => return Err(ServiceError::VerificationFailed),
                VerificationStatus::Expired => return Err(ServiceError::VerificationExpired),
                VerificationStatus::Unverified => {}
            }

            let now = self.clock.now();
            if current.is_expired(now) {
                let next = Verification {
                    status: VerificationStatus::Expired,
                    ..current.clone()
                };
                if !self
                    .store
                    .update_verification_if(current.status, current.attempts, &next)
                    .await?
                {
                    continue;
                }
                self.events.emit(CredentialEvent::VerificationExpired {
                    instance_id: instance.instance_id,
                    verification_id,
                });
                return Err(ServiceError::VerificationExpired);
            }

            if !proof.fits(current.strategy) {
                return Err(ServiceError::VerificationStrategyMismatch);
            }

            let correct = self.check(&current, &proof)?;

            let mut next = current.clone();
            next.attempts += 1;
            if correct {
                next.status = VerificationStatus::Verified;
                next.verified_utc = Some(now);
            } else if next.attempts >= next.max_attempts {
                next.status = VerificationStatus::Failed;
            }

            if !self
                .store
                .update_verification_if(current.status, current.attempts, &next)
                .await?
            {
                tracing::debug!("Lost verification attempt race, re-reading");
                continue;
            }

            return match next.status {
                VerificationStatus::Verified => {
                    tracing::info!("Verification verified");
                    self.events.emit(CredentialEvent::VerificationVerified {
                        instance_id: instance.instance_id,
                        verification_id,
                    });
                    Ok(next)
                }
                VerificationStatus::Failed => {
                    tracing::info!(attempts = next.attempts, "Verification failed");
                    self.events.emit(CredentialEvent::VerificationFailed {
                        instance_id: instance.instance_id,
                        verification_id,
                    });
                    Err(ServiceError::VerificationFailed)
                }
                _ => Err(ServiceError::FormCodeIncorrect {
                    remaining: next.remaining_attempts(),
                }),
            };
        }

        Err(ServiceError::Internal(anyhow::anyhow!(
            "Verification {} stayed contended after {} attempts",
            verification_id,
            MAX_CAS_RETRIES
        )))
    }

    /// Assert that a verification completed successfully.
    pub fn require_verified(&self, verification: Option<&Verification>) -> Result<(), ServiceError> {
        let Some(verification) = verification else {
            return Err(ServiceError::VerificationMissing);
        };

        match verification.status {
            VerificationStatus::Verified => Ok(()),
            VerificationStatus::Unverified if verification.is_expired(self.clock.now()) => {
                Err(ServiceError::VerificationExpired)
            }
            VerificationStatus::Unverified if verification.attempts == 0 => {
                Err(ServiceError::VerificationNotAttempted)
            }
            status => Err(ServiceError::VerificationIncomplete(status)),
        }
    }

    fn check(&self, verification: &Verification, proof: &Proof) -> Result<bool, ServiceError> {
        match proof {
            Proof::Code(code) | Proof::Nonce(code) => {
                Ok(matches_hash(code, verification.secret_hash.as_deref()))
            }
            Proof::Password { candidate, hash } => Ok(verify_password(candidate, hash)?),
        }
    }
}
