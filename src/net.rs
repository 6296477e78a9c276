//! Network transport used by the interceptor and the manifest loader.

use color_eyre::{eyre::eyre, Result};
use std::future::Future;

use crate::cache::{CachePolicy, Request, Snapshot};

/// Something that can perform a request against the network.
///
/// Failures are reported through the transport's own errors; this layer
/// imposes no deadlines.
pub trait Fetcher: Send + Sync + 'static {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Snapshot>> + Send;
}

/// HTTP transport backed by reqwest.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
  policy: CachePolicy,
}

impl HttpFetcher {
  pub fn new(policy: CachePolicy) -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("innerorder/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, policy })
  }
}

impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Snapshot> {
    let response = self
      .client
      .request(request.method.clone(), request.url.clone())
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let url = response.url().clone();
    let status = response.status().as_u16();
    let headers: Vec<(String, String)> = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", url, e))?;

    Ok(Snapshot {
      kind: self.policy.classify(&url, &headers),
      url: url.into(),
      status,
      headers,
      body: body.to_vec(),
    })
  }
}

/// Transport with no connectivity. Every request fails.
#[derive(Clone, Copy, Default)]
pub struct OfflineFetcher;

impl Fetcher for OfflineFetcher {
  async fn fetch(&self, request: &Request) -> Result<Snapshot> {
    Err(eyre!("Failed to fetch {}: network is offline", request.url))
  }
}
