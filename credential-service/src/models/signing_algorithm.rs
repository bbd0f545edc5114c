//! JWS algorithms accepted for instance keys and JWT templates.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Key family an algorithm belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    Hmac,
    Rsa,
    Ec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum SigningAlgorithm {
    HS256,
    HS384,
    HS512,
    RS256,
    RS384,
    RS512,
    ES256,
    ES384,
    ES512,
}

impl SigningAlgorithm {
    pub const ALL: [SigningAlgorithm; 9] = [
        SigningAlgorithm::HS256,
        SigningAlgorithm::HS384,
        SigningAlgorithm::HS512,
        SigningAlgorithm::RS256,
        SigningAlgorithm::RS384,
        SigningAlgorithm::RS512,
        SigningAlgorithm::ES256,
        SigningAlgorithm::ES384,
        SigningAlgorithm::ES512,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SigningAlgorithm::HS256 => "HS256",
            SigningAlgorithm::HS384 => "HS384",
            SigningAlgorithm::HS512 => "HS512",
            SigningAlgorithm::RS256 => "RS256",
            SigningAlgorithm::RS384 => "RS384",
            SigningAlgorithm::RS512 => "RS512",
            SigningAlgorithm::ES256 => "ES256",
            SigningAlgorithm::ES384 => "ES384",
            SigningAlgorithm::ES512 => "ES512",
        }
    }

    /// Case-insensitive lookup; `None` for anything outside the supported set.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|alg| alg.as_str().eq_ignore_ascii_case(s.trim()))
    }

    pub fn family(&self) -> KeyFamily {
        match self {
            SigningAlgorithm::HS256 | SigningAlgorithm::HS384 | SigningAlgorithm::HS512 => {
                KeyFamily::Hmac
            }
            SigningAlgorithm::RS256 | SigningAlgorithm::RS384 | SigningAlgorithm::RS512 => {
                KeyFamily::Rsa
            }
            SigningAlgorithm::ES256 | SigningAlgorithm::ES384 | SigningAlgorithm::ES512 => {
                KeyFamily::Ec
            }
        }
    }

    /// The signing backend's algorithm, if it can produce this one.
    pub fn to_jwt(&self) -> Option<jsonwebtoken::Algorithm> {
        use jsonwebtoken::Algorithm;
        match self {
            SigningAlgorithm::HS256 => Some(Algorithm::HS256),
            SigningAlgorithm::HS384 => Some(Algorithm::HS384),
            SigningAlgorithm::HS512 => Some(Algorithm::HS512),
            SigningAlgorithm::RS256 => Some(Algorithm::RS256),
            SigningAlgorithm::RS384 => Some(Algorithm::RS384),
            SigningAlgorithm::RS512 => Some(Algorithm::RS512),
            SigningAlgorithm::ES256 => Some(Algorithm::ES256),
            SigningAlgorithm::ES384 => Some(Algorithm::ES384),
            // P-521 signatures are not supported by the signing backend.
            SigningAlgorithm::ES512 => None,
        }
    }
}

impl std::fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!(SigningAlgorithm::parse("rs256"), Some(SigningAlgorithm::RS256));
        assert_eq!(SigningAlgorithm::parse("Es384"), Some(SigningAlgorithm::ES384));
        assert_eq!(SigningAlgorithm::parse("PS256"), None);
        assert_eq!(SigningAlgorithm::parse("none"), None);
    }

    #[test]
    fn test_families() {
        assert_eq!(SigningAlgorithm::HS512.family(), KeyFamily::Hmac);
        assert_eq!(SigningAlgorithm::RS384.family(), KeyFamily::Rsa);
        assert_eq!(SigningAlgorithm::ES256.family(), KeyFamily::Ec);
    }

    #[test]
    fn test_es512_has_no_backend_algorithm() {
        assert!(SigningAlgorithm::ES512.to_jwt().is_none());
        assert!(SigningAlgorithm::ES256.to_jwt().is_some());
    }
}
