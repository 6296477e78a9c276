//! Core types for the offline cache: request identity, response snapshots
//! and result provenance.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// What kind of resource a request is for.
///
/// Only documents are eligible for the offline fallback page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Destination {
  /// Top-level navigation (HTML entry point)
  Document,
  /// Scripts, styles, fonts, data, ...
  #[default]
  Other,
}

/// An outgoing read request from the application.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub destination: Destination,
}

impl Request {
  /// Build a GET request for an absolute URL.
  pub fn get(url: &str) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid request URL '{}': {}", url, e))?;
    Ok(Self {
      method: Method::GET,
      url,
      destination: Destination::Other,
    })
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn as_document(mut self) -> Self {
    self.destination = Destination::Document;
    self
  }

  /// Canonical identity of this request in the store.
  pub fn key(&self) -> RequestKey {
    RequestKey::new(&self.method, &self.url)
  }
}

/// Canonicalized request identity (method + URL, fragment stripped).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  method: String,
  url: String,
}

impl RequestKey {
  pub fn new(method: &Method, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: method.as_str().to_uppercase(),
      url: url.into(),
    }
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  /// SHA256 of the canonical identity, for stable fixed-length storage keys.
  pub fn hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl std::fmt::Display for RequestKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// How much of a response the application is allowed to inspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
  /// Same-origin response
  Basic,
  /// Cross-origin response that opted in via CORS headers
  Cors,
  /// Cross-origin response that can only be relayed
  Opaque,
}

impl ResponseKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Basic => "basic",
      Self::Cors => "cors",
      Self::Opaque => "opaque",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "basic" => Some(Self::Basic),
      "cors" => Some(Self::Cors),
      "opaque" => Some(Self::Opaque),
      _ => None,
    }
  }
}

/// A whole-response snapshot. Entries are only ever replaced, never patched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
  pub url: String,
  pub status: u16,
  pub kind: ResponseKind,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Snapshot {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// Result of an intercepted request, including where the response came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
    }
  }

  pub fn from_cache(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
    }
  }

  pub fn fallback(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Fallback,
    }
  }

  pub fn passthrough(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Passthrough,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fetched from the network (and stored, if eligible)
  Network,
  /// Served from the active generation; a revalidation may be in flight
  Cache,
  /// Network failed with nothing cached; the stored offline page was served
  Fallback,
  /// Request was not intercepted at all
  Passthrough,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Fallback => "offline fallback",
      Self::Passthrough => "passthrough",
    };
    f.write_str(s)
  }
}
