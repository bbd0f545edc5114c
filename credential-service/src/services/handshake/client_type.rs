use axum::http::{header, HeaderMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientType {
    Browser,
    Native,
}

impl ClientType {
    /// Browser when the request carries any of `Origin`, `Referer` or `Cookie`,
    /// unless the caller forced native mode.
    pub fn classify(headers: &HeaderMap, force_native: bool) -> Self {
        if force_native {
            return ClientType::Native;
        }
        let browser_marked = [header::ORIGIN, header::REFERER, header::COOKIE]
            .iter()
            .any(|name| headers.contains_key(name));
        if browser_marked {
            ClientType::Browser
        } else {
            ClientType::Native
        }
    }

    pub fn is_browser(&self) -> bool {
        *self == ClientType::Browser
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_classify() {
        let mut headers = HeaderMap::new();
        assert_eq!(ClientType::classify(&headers, false), ClientType::Native);

        headers.insert(header::COOKIE, HeaderValue::from_static("a=b"));
        assert_eq!(ClientType::classify(&headers, false), ClientType::Browser);
        assert_eq!(ClientType::classify(&headers, true), ClientType::Native);
    }
}
