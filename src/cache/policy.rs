//! Which requests are intercepted and which responses may be stored.

use reqwest::Method;
use url::{Origin, Url};

use super::traits::{Request, ResponseKind, Snapshot};

/// Eligibility rules for the interceptor.
#[derive(Debug, Clone)]
pub struct CachePolicy {
  origin: Origin,
  trusted_hosts: Vec<String>,
}

impl CachePolicy {
  /// `base_url` defines the application's own origin. `trusted_hosts` are
  /// third-party host patterns whose responses may be stored even when they
  /// are not same-origin.
  pub fn new(base_url: &Url, trusted_hosts: &[String]) -> Self {
    Self {
      origin: base_url.origin(),
      trusted_hosts: trusted_hosts
        .iter()
        .map(|h| h.trim().to_lowercase())
        .filter(|h| !h.is_empty())
        .collect(),
    }
  }

  /// Only GET requests over a network-fetchable scheme are intercepted.
  pub fn intercepts(&self, request: &Request) -> bool {
    request.method == Method::GET && matches!(request.url.scheme(), "http" | "https")
  }

  /// Classify a response the way a browser would label it for the application.
  pub fn classify(&self, url: &Url, headers: &[(String, String)]) -> ResponseKind {
    if url.origin() == self.origin {
      return ResponseKind::Basic;
    }

    let cors = headers
      .iter()
      .any(|(k, _)| k.eq_ignore_ascii_case("access-control-allow-origin"));

    if cors {
      ResponseKind::Cors
    } else {
      ResponseKind::Opaque
    }
  }

  /// Whether a network response for `request` may be written to the store.
  pub fn is_cacheable(&self, request: &Request, response: &Snapshot) -> bool {
    if response.status != 200 {
      return false;
    }

    response.kind == ResponseKind::Basic || self.is_trusted(&request.url)
  }

  /// Whether the URL's host matches one of the trusted patterns.
  pub fn is_trusted(&self, url: &Url) -> bool {
    let Some(host) = url.host_str() else {
      return false;
    };
    let host = host.to_lowercase();

    self
      .trusted_hosts
      .iter()
      .any(|pattern| match pattern.strip_prefix("*.") {
        Some(suffix) => host.ends_with(&format!(".{}", suffix)),
        None => host == *pattern || host.ends_with(&format!(".{}", pattern)),
      })
  }
}
