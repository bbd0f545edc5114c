/// Paths that can bootstrap a device identity and therefore run without one.
pub const DEFAULT_BOOTSTRAP_PATHS: &[&str] = &[
    "/v1/client/sync",
    "/v1/client/link",
    "/v1/client/handshake",
    "/v1/tickets/accept",
    "/v1/oauth_callback",
    "/v1/health",
    "/.well-known/",
    "/v1/dev_browser",
];

/// Reviewed allow-list of self-bootstrapping path prefixes.
///
/// Used for both origin exemption and device-identity exemption. A prefix
/// ending in `/` matches anything below it; any other prefix matches itself
/// and its sub-paths on a segment boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapPaths {
    prefixes: Vec<String>,
}

impl Default for BootstrapPaths {
    fn default() -> Self {
        Self {
            prefixes: DEFAULT_BOOTSTRAP_PATHS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

impl BootstrapPaths {
    /// Defaults plus extra prefixes, e.g. from configuration.
    pub fn with_extra<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut paths = Self::default();
        for prefix in extra {
            let prefix = prefix.into();
            let prefix = prefix.trim();
            if prefix.starts_with('/') && !paths.prefixes.iter().any(|p| p == prefix) {
                paths.prefixes.push(prefix.to_string());
            }
        }
        paths
    }

    pub fn contains(&self, path: &str) -> bool {
        self.prefixes.iter().any(|prefix| {
            if prefix.ends_with('/') {
                return path.starts_with(prefix.as_str());
            }
            path.strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
        })
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }
}
