//! Request interceptor: stale-while-revalidate over one generation.

use color_eyre::Result;
use reqwest::Method;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use super::generation::Generation;
use super::policy::CachePolicy;
use super::storage::ResourceStore;
use super::traits::{CacheResult, Destination, Request, RequestKey, Snapshot};
use crate::net::Fetcher;

/// Interceptor bound to a single generation.
///
/// This sits between the application and the network, serving stored
/// responses immediately and refreshing them in the background.
pub struct Interceptor<N: Fetcher> {
  generation: Generation,
  store: Arc<dyn ResourceStore>,
  network: Arc<N>,
  policy: CachePolicy,
  /// Stored page served for document requests when offline with nothing cached
  offline_fallback: Option<Url>,
  revalidations: Mutex<Vec<JoinHandle<()>>>,
}

impl<N: Fetcher> Interceptor<N> {
  pub fn new(
    generation: Generation,
    store: Arc<dyn ResourceStore>,
    network: Arc<N>,
    policy: CachePolicy,
  ) -> Self {
    Self {
      generation,
      store,
      network,
      policy,
      offline_fallback: None,
      revalidations: Mutex::new(Vec::new()),
    }
  }

  /// Serve a stored page for document requests that cannot be answered.
  pub fn with_offline_fallback(mut self, url: Option<Url>) -> Self {
    self.offline_fallback = url;
    self
  }

  pub fn generation(&self) -> &Generation {
    &self.generation
  }

  /// Answer a request.
  ///
  /// 1. Not intercepted (non-GET, non-http scheme) - straight to the network
  /// 2. Stored - return it now, refresh it in the background
  /// 3. Not stored - fetch, store a copy if eligible, return
  /// 4. Not stored and network failed - offline fallback for documents, else error
  pub async fn handle(&self, request: &Request) -> Result<CacheResult<Snapshot>> {
    if !self.policy.intercepts(request) {
      let response = self.network.fetch(request).await?;
      return Ok(CacheResult::passthrough(response));
    }

    let key = request.key();

    if let Some(cached) = self.lookup(&key) {
      self.revalidate(request.clone(), key);
      return Ok(CacheResult::from_cache(cached));
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if self.policy.is_cacheable(request, &response) {
          self.store_entry(&key, &response);
        } else {
          debug!(%key, status = response.status, kind = response.kind.as_str(), "not cacheable");
        }
        Ok(CacheResult::from_network(response))
      }
      Err(e) => {
        if request.destination == Destination::Document {
          if let Some(page) = self.fallback_page() {
            debug!(%key, "serving offline fallback");
            return Ok(CacheResult::fallback(page));
          }
        }
        Err(e)
      }
    }
  }

  /// Wait for every background revalidation started so far.
  pub async fn settle(&self) {
    let handles = match self.revalidations.lock() {
      Ok(mut handles) => std::mem::take(&mut *handles),
      Err(_) => return,
    };

    for handle in handles {
      let _ = handle.await;
    }
  }

  /// Read from the active generation. Store errors count as a miss.
  fn lookup(&self, key: &RequestKey) -> Option<Snapshot> {
    match self.store.get(&self.generation, key) {
      Ok(found) => found,
      Err(e) => {
        warn!(generation = %self.generation, %key, error = %e, "store read failed, treating as miss");
        None
      }
    }
  }

  fn store_entry(&self, key: &RequestKey, response: &Snapshot) {
    match self.store.put(&self.generation, key, response) {
      Ok(true) => {}
      Ok(false) => debug!(generation = %self.generation, %key, "write dropped"),
      Err(e) => warn!(generation = %self.generation, %key, error = %e, "store write failed"),
    }
  }

  fn fallback_page(&self) -> Option<Snapshot> {
    let url = self.offline_fallback.as_ref()?;
    self.lookup(&RequestKey::new(&Method::GET, url))
  }

  /// Refresh a stored entry without blocking the caller. Failures are only logged.
  fn revalidate(&self, request: Request, key: RequestKey) {
    let store = Arc::clone(&self.store);
    let network = Arc::clone(&self.network);
    let generation = self.generation.clone();

    let handle = tokio::spawn(async move {
      match network.fetch(&request).await {
        Ok(fresh) if fresh.status == 200 => match store.put(&generation, &key, &fresh) {
          Ok(true) => debug!(%generation, %key, "revalidated"),
          Ok(false) => debug!(%generation, %key, "revalidation dropped, generation closed"),
          Err(e) => warn!(%generation, %key, error = %e, "revalidation write failed"),
        },
        Ok(fresh) => debug!(%key, status = fresh.status, "revalidation skipped"),
        Err(e) => debug!(%key, error = %e, "revalidation failed"),
      }
    });

    if let Ok(mut handles) = self.revalidations.lock() {
      handles.retain(|h| !h.is_finished());
      handles.push(handle);
    }
  }
}
