//! Per-instance signing material.

use dashmap::DashMap;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use secrecy::ExposeSecret;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{Instance, KeyFamily, SigningAlgorithm};

/// Parsed keys ready for signing and verification.
#[derive(Clone)]
pub struct SigningMaterial {
    pub algorithm: SigningAlgorithm,
    pub jwt_algorithm: Algorithm,
    pub key_id: Option<String>,
    pub encoding: EncodingKey,
    /// Absent when only a private key was configured.
    pub decoding: Option<DecodingKey>,
}

impl std::fmt::Debug for SigningMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningMaterial")
            .field("algorithm", &self.algorithm)
            .field("key_id", &self.key_id)
            .field("verifiable", &self.decoding.is_some())
            .finish()
    }
}

impl SigningMaterial {
    /// Parse raw key text for `algorithm`.
    ///
    /// HMAC algorithms take the shared secret as `private_key` and ignore `public_key`.
    pub fn parse(
        algorithm: SigningAlgorithm,
        private_key: &str,
        public_key: Option<&str>,
        key_id: Option<String>,
    ) -> Result<Self, anyhow::Error> {
        let jwt_algorithm = algorithm
            .to_jwt()
            .ok_or_else(|| anyhow::anyhow!("{} signing is not available", algorithm))?;

        let (encoding, decoding) = match algorithm.family() {
            KeyFamily::Hmac => {
                if private_key.is_empty() {
                    anyhow::bail!("HMAC secret must not be empty");
                }
                (
                    EncodingKey::from_secret(private_key.as_bytes()),
                    Some(DecodingKey::from_secret(private_key.as_bytes())),
                )
            }
            KeyFamily::Rsa => {
                let encoding = EncodingKey::from_rsa_pem(private_key.as_bytes())
                    .map_err(|e| anyhow::anyhow!("Failed to parse RSA private key: {}", e))?;
                let decoding = public_key
                    .filter(|k| !k.trim().is_empty())
                    .map(|k| {
                        DecodingKey::from_rsa_pem(k.as_bytes())
                            .map_err(|e| anyhow::anyhow!("Failed to parse RSA public key: {}", e))
                    })
                    .transpose()?;
                (encoding, decoding)
            }
            KeyFamily::Ec => {
                let encoding = EncodingKey::from_ec_pem(private_key.as_bytes())
                    .map_err(|e| anyhow::anyhow!("Failed to parse EC private key: {}", e))?;
                let decoding = public_key
                    .filter(|k| !k.trim().is_empty())
                    .map(|k| {
                        DecodingKey::from_ec_pem(k.as_bytes())
                            .map_err(|e| anyhow::anyhow!("Failed to parse EC public key: {}", e))
                    })
                    .transpose()?;
                (encoding, decoding)
            }
        };

        Ok(Self {
            algorithm,
            jwt_algorithm,
            key_id,
            encoding,
            decoding,
        })
    }

    pub fn header(&self) -> jsonwebtoken::Header {
        let mut header = jsonwebtoken::Header::new(self.jwt_algorithm);
        header.kid = self.key_id.clone();
        header
    }

    /// Decoding key, or an error when this material cannot verify.
    pub fn decoding_key(&self) -> Result<&DecodingKey, anyhow::Error> {
        self.decoding
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No verification key configured"))
    }

    /// Validation for tokens this core issues. Expiry is checked against the `Clock`.
    pub fn validation(&self) -> jsonwebtoken::Validation {
        let mut validation = jsonwebtoken::Validation::new(self.jwt_algorithm);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp"]);
        validation
    }
}

/// Supplies signing material for an instance's default key pair.
pub trait KeyProvider: Send + Sync {
    fn instance_material(&self, instance: &Instance) -> Result<Arc<SigningMaterial>, anyhow::Error>;
}

/// Parses each instance's configured keys once and caches them by key id.
#[derive(Default)]
pub struct InstanceKeyProvider {
    cache: DashMap<(Uuid, String), Arc<SigningMaterial>>,
}

impl InstanceKeyProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyProvider for InstanceKeyProvider {
    fn instance_material(&self, instance: &Instance) -> Result<Arc<SigningMaterial>, anyhow::Error> {
        let cache_key = (instance.instance_id, instance.keys.key_id.clone());
        if let Some(material) = self.cache.get(&cache_key) {
            return Ok(material.clone());
        }

        let material = Arc::new(SigningMaterial::parse(
            instance.keys.algorithm,
            instance.keys.private_key.expose_secret(),
            Some(instance.keys.public_key.as_str()),
            Some(instance.keys.key_id.clone()),
        )?);

        tracing::debug!(
            instance_id = %instance.instance_id,
            key_id = %instance.keys.key_id,
            algorithm = %instance.keys.algorithm,
            "Loaded instance signing keys"
        );

        self.cache.insert(cache_key, material.clone());
        Ok(material)
    }
}
