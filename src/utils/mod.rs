//! Utility functions and helpers.

pub mod http;
pub mod log;
pub mod retry;
pub mod text;

use url::Url;

/// Key used to rate-limit requests to a fetch target.
///
/// URL targets share a bucket per host; anything else is keyed on the
/// target string itself.
pub fn rate_limit_key(target: &str) -> String {
    get_domain(target).unwrap_or_else(|| target.trim().to_string())
}

/// Extract the domain from a URL string.
pub fn get_domain(url_str: &str) -> Option<String> {
    Url::parse(url_str)
        .ok()
        .and_then(|u| u.host_str().map(|s| s.to_lowercase()))
}
