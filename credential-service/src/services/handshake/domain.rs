//! Registrable-domain comparison for first-party detection.

use std::net::IpAddr;

fn normalize(host: &str) -> String {
    host.trim()
        .trim_end_matches('.')
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase()
}

/// eTLD+1 of `host` per the public suffix list. IP addresses, `localhost` and
/// hosts without a registrable part compare by the host itself.
pub fn registrable_domain(host: &str) -> String {
    let host = normalize(host);
    if host.parse::<IpAddr>().is_ok() || host == "localhost" || host.ends_with(".localhost") {
        return host;
    }
    psl::domain_str(&host)
        .map(str::to_string)
        .unwrap_or(host)
}

/// Host part of an absolute URL.
pub fn host_of(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(normalize))
}

pub fn same_site(a: &str, b: &str) -> bool {
    registrable_domain(a) == registrable_domain(b)
}
