//! Scripted in-memory network for tests.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::{Request, ResponseKind, Snapshot};
use crate::net::Fetcher;

#[derive(Default)]
struct State {
  routes: HashMap<String, (u16, ResponseKind, Vec<u8>)>,
  online: bool,
  delay: Duration,
  calls: HashMap<String, usize>,
}

/// A fake network whose routes, connectivity and latency can be changed
/// while requests are in flight.
#[derive(Clone)]
pub struct FakeFetcher {
  state: Arc<Mutex<State>>,
}

impl FakeFetcher {
  pub fn new() -> Self {
    Self {
      state: Arc::new(Mutex::new(State {
        online: true,
        ..State::default()
      })),
    }
  }

  /// Serve a same-origin 200 response.
  pub fn serve(&self, url: &str, body: &str) -> &Self {
    self.route(url, 200, ResponseKind::Basic, body)
  }

  pub fn route(&self, url: &str, status: u16, kind: ResponseKind, body: &str) -> &Self {
    self
      .state
      .lock()
      .unwrap()
      .routes
      .insert(url.to_string(), (status, kind, body.as_bytes().to_vec()));
    self
  }

  pub fn remove(&self, url: &str) {
    self.state.lock().unwrap().routes.remove(url);
  }

  pub fn set_online(&self, online: bool) {
    self.state.lock().unwrap().online = online;
  }

  pub fn set_delay(&self, delay: Duration) {
    self.state.lock().unwrap().delay = delay;
  }

  /// Number of fetches issued for a URL.
  pub fn calls(&self, url: &str) -> usize {
    self
      .state
      .lock()
      .unwrap()
      .calls
      .get(url)
      .copied()
      .unwrap_or(0)
  }
}

impl Fetcher for FakeFetcher {
  async fn fetch(&self, request: &Request) -> Result<Snapshot> {
    let url = request.url.to_string();
    let delay = {
      let mut state = self.state.lock().unwrap();
      *state.calls.entry(url.clone()).or_default() += 1;
      state.delay
    };

    if !delay.is_zero() {
      tokio::time::sleep(delay).await;
    }

    let state = self.state.lock().unwrap();
    if !state.online {
      return Err(eyre!("Failed to fetch {}: network is offline", url));
    }

    let (status, kind, body) = state
      .routes
      .get(&url)
      .cloned()
      .unwrap_or((404, ResponseKind::Basic, b"not found".to_vec()));

    Ok(Snapshot {
      url,
      status,
      kind,
      headers: vec![("content-type".to_string(), "text/plain".to_string())],
      body,
    })
  }
}
