//! Extraction of handshake parameters before normal parameter validation.

pub const DEV_BROWSER_PARAM: &str = "__clerk_db_jwt";
pub const LEGACY_DEV_SESSION_PARAM: &str = "__dev_session";
pub const ROTATING_TOKEN_NONCE_PARAM: &str = "rotating_token_nonce";
pub const IS_NATIVE_PARAM: &str = "_is_native";

pub const STRIPPED_PARAMS: [&str; 4] = [
    DEV_BROWSER_PARAM,
    LEGACY_DEV_SESSION_PARAM,
    ROTATING_TOKEN_NONCE_PARAM,
    IS_NATIVE_PARAM,
];

/// Handshake values pulled out of the query string and form body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeParams {
    pub dev_browser_token: Option<String>,
    pub legacy_dev_session: Option<String>,
    pub rotating_token_nonce: Option<String>,
    pub is_native: bool,
}

impl HandshakeParams {
    fn absorb(&mut self, key: &str, value: String) {
        let value = value.trim().to_string();
        match key {
            DEV_BROWSER_PARAM if !value.is_empty() => self.dev_browser_token = Some(value),
            LEGACY_DEV_SESSION_PARAM if !value.is_empty() => {
                self.legacy_dev_session = Some(value)
            }
            ROTATING_TOKEN_NONCE_PARAM if !value.is_empty() => {
                self.rotating_token_nonce = Some(value)
            }
            IS_NATIVE_PARAM => self.is_native = matches!(value.as_str(), "1" | "true"),
            _ => {}
        }
    }

    /// Remove handshake params from an urlencoded string, recording their values.
    ///
    /// Returns the remaining encoded pairs, or `None` when the input was not
    /// valid urlencoded data and must be left untouched.
    pub fn strip_encoded(&mut self, encoded: &str) -> Option<String> {
        let pairs: Vec<(String, String)> = serde_urlencoded::from_str(encoded).ok()?;
        if !pairs.iter().any(|(k, _)| STRIPPED_PARAMS.contains(&k.as_str())) {
            return Some(encoded.to_string());
        }

        let mut kept = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            if STRIPPED_PARAMS.contains(&key.as_str()) {
                self.absorb(&key, value);
            } else {
                kept.push((key, value));
            }
        }
        serde_urlencoded::to_string(&kept).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_query() {
        let mut params = HandshakeParams::default();
        let rest = params
            .strip_encoded("redirect_url=https%3A%2F%2Fapp.dev&__clerk_db_jwt=abc&_is_native=1")
            .unwrap();
        assert_eq!(rest, "redirect_url=https%3A%2F%2Fapp.dev");
        assert_eq!(params.dev_browser_token.as_deref(), Some("abc"));
        assert!(params.is_native);
    }

    #[test]
    fn test_strip_form_body() {
        let mut params = HandshakeParams::default();
        let rest = params
            .strip_encoded("code=123456&rotating_token_nonce=n1&__dev_session=legacy")
            .unwrap();
        assert_eq!(rest, "code=123456");
        assert_eq!(params.rotating_token_nonce.as_deref(), Some("n1"));
        assert_eq!(params.legacy_dev_session.as_deref(), Some("legacy"));
    }

    #[test]
    fn test_untouched_without_handshake_params() {
        let mut params = HandshakeParams::default();
        assert_eq!(params.strip_encoded("a=1&b=%20x").as_deref(), Some("a=1&b=%20x"));
        assert_eq!(params, HandshakeParams::default());
    }

    #[test]
    fn test_empty_values_are_ignored() {
        let mut params = HandshakeParams::default();
        let rest = params.strip_encoded("__clerk_db_jwt=&_is_native=0").unwrap();
        assert_eq!(rest, "");
        assert_eq!(params, HandshakeParams::default());
    }
}
