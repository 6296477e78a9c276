//! The bootstrap resource list and the loader that warms it into a generation.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::generation::Generation;
use super::storage::ResourceStore;
use super::traits::Request;
use crate::net::Fetcher;

/// Ordered list of resources required for the app shell to work offline.
#[derive(Debug, Clone)]
pub struct Manifest {
  entries: Vec<ManifestEntry>,
  core: Option<Url>,
}

/// A manifest locator, resolved against the application base URL.
#[derive(Debug, Clone)]
pub struct ManifestEntry {
  /// The locator as written in the manifest
  pub locator: String,
  /// The resolved URL, or why it could not be resolved
  pub url: std::result::Result<Url, String>,
}

impl Manifest {
  /// Resolve every locator against `base`. Unresolvable locators are kept
  /// and reported as failures at install time. Duplicates are dropped.
  ///
  /// `core_document` names the top-level entry point; it defaults to the
  /// first resolvable entry. An explicit core document missing from
  /// `locators` is appended so install always fetches it.
  pub fn resolve(base: &Url, locators: &[String], core_document: Option<&str>) -> Result<Self> {
    let mut entries: Vec<ManifestEntry> = Vec::new();

    for locator in locators {
      let url = base.join(locator).map_err(|e| e.to_string());
      let duplicate = match &url {
        Ok(u) => entries.iter().any(|e| e.url.as_ref() == Ok(u)),
        Err(_) => false,
      };
      if duplicate {
        debug!(%locator, "skipping duplicate manifest entry");
        continue;
      }
      entries.push(ManifestEntry {
        locator: locator.clone(),
        url,
      });
    }

    let core = match core_document {
      Some(c) => Some(
        base
          .join(c)
          .map_err(|e| eyre!("Invalid core document '{}': {}", c, e))?,
      ),
      None => entries.iter().find_map(|e| e.url.clone().ok()),
    };

    if let (Some(c), Some(url)) = (core_document, &core) {
      if !entries.iter().any(|e| e.url.as_ref() == Ok(url)) {
        debug!(core = %url, "core document not listed, adding it");
        entries.push(ManifestEntry {
          locator: c.to_string(),
          url: Ok(url.clone()),
        });
      }
    }

    Ok(Self { entries, core })
  }

  pub fn entries(&self) -> &[ManifestEntry] {
    &self.entries
  }

  pub fn core(&self) -> Option<&Url> {
    self.core.as_ref()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

/// Outcome of a single manifest entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
  Stored,
  Failed(String),
}

/// Per-entry outcomes of an install, in manifest order.
#[derive(Debug, Clone)]
pub struct InstallReport {
  pub generation: Generation,
  pub outcomes: Vec<(String, EntryOutcome)>,
  core: Option<String>,
}

impl InstallReport {
  pub fn stored(&self) -> usize {
    self
      .outcomes
      .iter()
      .filter(|(_, o)| *o == EntryOutcome::Stored)
      .count()
  }

  pub fn failures(&self) -> impl Iterator<Item = (&str, &str)> {
    self.outcomes.iter().filter_map(|(url, o)| match o {
      EntryOutcome::Failed(reason) => Some((url.as_str(), reason.as_str())),
      EntryOutcome::Stored => None,
    })
  }

  /// Whether the top-level entry point failed to warm.
  pub fn core_failed(&self) -> bool {
    let Some(core) = &self.core else {
      return false;
    };
    self
      .outcomes
      .iter()
      .any(|(url, o)| url == core && *o != EntryOutcome::Stored)
  }
}

/// Fetches manifest entries and stores them under a generation.
pub struct ManifestLoader<N: Fetcher> {
  store: Arc<dyn ResourceStore>,
  network: Arc<N>,
}

impl<N: Fetcher> ManifestLoader<N> {
  pub fn new(store: Arc<dyn ResourceStore>, network: Arc<N>) -> Self {
    Self { store, network }
  }

  /// Fetch every entry concurrently and store the successful ones.
  ///
  /// Returns once every entry has been attempted; individual failures are
  /// recorded, never fatal.
  pub async fn load(&self, generation: &Generation, manifest: &Manifest) -> InstallReport {
    let attempts = manifest
      .entries()
      .iter()
      .map(|entry| self.load_entry(generation, entry));

    let outcomes = join_all(attempts).await;

    let report = InstallReport {
      generation: generation.clone(),
      outcomes,
      core: manifest.core().map(|u| u.to_string()),
    };

    info!(
      %generation,
      stored = report.stored(),
      total = manifest.len(),
      "manifest loaded"
    );

    report
  }

  async fn load_entry(
    &self,
    generation: &Generation,
    entry: &ManifestEntry,
  ) -> (String, EntryOutcome) {
    let url = match &entry.url {
      Ok(url) => url,
      Err(reason) => {
        warn!(locator = %entry.locator, %reason, "invalid manifest entry");
        return (entry.locator.clone(), EntryOutcome::Failed(reason.clone()));
      }
    };

    let request = Request {
      method: reqwest::Method::GET,
      url: url.clone(),
      destination: Default::default(),
    };

    let outcome = match self.network.fetch(&request).await {
      Ok(response) if response.is_success() => {
        match self.store.put(generation, &request.key(), &response) {
          Ok(true) => EntryOutcome::Stored,
          Ok(false) => EntryOutcome::Failed(format!("generation {} is not open", generation)),
          Err(e) => EntryOutcome::Failed(e.to_string()),
        }
      }
      Ok(response) => EntryOutcome::Failed(format!("HTTP {}", response.status)),
      Err(e) => EntryOutcome::Failed(e.to_string()),
    };

    if let EntryOutcome::Failed(reason) = &outcome {
      warn!(%generation, %url, %reason, "manifest entry not cached");
    }

    (url.to_string(), outcome)
  }
}
