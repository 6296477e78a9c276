//! Lifecycle of a cache generation: install, activate, serve.
//!
//! Each generation gets its own [`Worker`] with its own storage namespace.
//! A [`Registration`] holds whichever interceptor currently controls
//! requests; a new worker only takes over once it has fully activated, so the
//! previous generation keeps serving while its successor installs.

use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{
  CachePolicy, CacheResult, Generation, GenerationManager, InstallReport, Interceptor, Manifest,
  ManifestLoader, PurgeReport, Request, ResourceStore, Snapshot,
};
use crate::net::Fetcher;

/// Lifecycle phase of one worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  /// Warming the manifest into a fresh generation
  Installing,
  /// Install finished; purging stale generations
  Activating,
  /// Interceptor is live for this generation
  Active,
  /// Install failed; this instance will never serve
  Redundant,
}

/// Dependencies shared by every worker instance.
pub struct WorkerContext<N: Fetcher> {
  pub store: Arc<dyn ResourceStore>,
  pub network: Arc<N>,
  pub policy: CachePolicy,
  pub offline_fallback: Option<Url>,
}

impl<N: Fetcher> Clone for WorkerContext<N> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      network: Arc::clone(&self.network),
      policy: self.policy.clone(),
      offline_fallback: self.offline_fallback.clone(),
    }
  }
}

impl<N: Fetcher> WorkerContext<N> {
  fn interceptor(&self, generation: Generation) -> Interceptor<N> {
    Interceptor::new(
      generation,
      Arc::clone(&self.store),
      Arc::clone(&self.network),
      self.policy.clone(),
    )
    .with_offline_fallback(self.offline_fallback.clone())
  }
}

/// State machine for a single generation.
pub struct Worker<N: Fetcher> {
  generation: Generation,
  phase: Phase,
  context: WorkerContext<N>,
}

impl<N: Fetcher> Worker<N> {
  pub fn new(generation: Generation, context: WorkerContext<N>) -> Self {
    Self {
      generation,
      phase: Phase::Installing,
      context,
    }
  }

  pub fn phase(&self) -> Phase {
    self.phase
  }

  pub fn generation(&self) -> &Generation {
    &self.generation
  }

  /// Create the generation and warm the manifest into it.
  ///
  /// Every entry is attempted. Install fails only when the generation cannot
  /// be created or the core document could not be cached; the caller should
  /// retry on the next load. On success the worker skips waiting and moves
  /// straight to activation.
  pub async fn install(&mut self, manifest: &Manifest) -> Result<InstallReport> {
    if self.phase != Phase::Installing {
      return Err(eyre!("Worker for {} is not installing", self.generation));
    }

    let generations = GenerationManager::new(Arc::clone(&self.context.store));
    if let Err(e) = generations.instantiate(&self.generation) {
      self.phase = Phase::Redundant;
      return Err(eyre!("Failed to create generation {}: {}", self.generation, e));
    }

    let loader = ManifestLoader::new(
      Arc::clone(&self.context.store),
      Arc::clone(&self.context.network),
    );
    let report = loader.load(&self.generation, manifest).await;

    if report.core_failed() {
      self.phase = Phase::Redundant;
      // Drop the partial namespace so the next load installs again
      if let Err(e) = self.context.store.delete_generation(&self.generation) {
        warn!(generation = %self.generation, error = %e, "failed to drop partial generation");
      }
      let core = manifest.core().map(Url::to_string).unwrap_or_default();
      return Err(eyre!(
        "Core document {} could not be cached for {}; install will be retried",
        core,
        self.generation
      ));
    }

    info!(generation = %self.generation, "installed, skipping wait");
    self.phase = Phase::Activating;
    Ok(report)
  }

  /// Record activation, purge every other generation and go live.
  ///
  /// Activation is recorded before the purge so a restart never resumes a
  /// generation whose install did not finish. Purge failures never block
  /// activation.
  pub fn activate(&mut self) -> Result<PurgeReport> {
    if self.phase != Phase::Activating {
      return Err(eyre!("Worker for {} has not installed", self.generation));
    }

    let generations = GenerationManager::new(Arc::clone(&self.context.store));
    if let Err(e) = generations.mark_active(&self.generation) {
      self.phase = Phase::Redundant;
      return Err(eyre!("Failed to record activation of {}: {}", self.generation, e));
    }

    let report = generations
      .purge_stale(&self.generation)
      .unwrap_or_else(|e| {
        warn!(generation = %self.generation, error = %e, "could not enumerate stale generations");
        PurgeReport::default()
      });

    info!(generation = %self.generation, purged = report.deleted.len(), "activated");
    self.phase = Phase::Active;
    Ok(report)
  }

  /// The interceptor for an active worker.
  pub fn into_interceptor(self) -> Result<Interceptor<N>> {
    if self.phase != Phase::Active {
      return Err(eyre!("Worker for {} is not active", self.generation));
    }
    Ok(self.context.interceptor(self.generation))
  }
}

/// What an update did.
#[derive(Debug)]
pub enum UpdateReport {
  /// The generation was already in control; nothing was installed
  AlreadyActive(Generation),
  Activated {
    install: InstallReport,
    purge: PurgeReport,
  },
}

/// Routes requests to the controlling generation and drives updates.
pub struct Registration<N: Fetcher> {
  context: WorkerContext<N>,
  controller: RwLock<Option<Arc<Interceptor<N>>>>,
}

impl<N: Fetcher> Registration<N> {
  pub fn new(context: WorkerContext<N>) -> Self {
    Self {
      context,
      controller: RwLock::new(None),
    }
  }

  /// The interceptor currently in control, if any.
  pub fn controller(&self) -> Option<Arc<Interceptor<N>>> {
    self.controller.read().ok().and_then(|c| c.clone())
  }

  pub fn active_generation(&self) -> Option<Generation> {
    self.controller().map(|c| c.generation().clone())
  }

  /// Take control with a generation activated by a previous run.
  pub fn resume(&self, generation: &Generation) -> Result<bool> {
    let generations = GenerationManager::new(Arc::clone(&self.context.store));
    if !generations.is_active(generation)? {
      return Ok(false);
    }

    self.claim(self.context.interceptor(generation.clone()));
    Ok(true)
  }

  /// Put the newest activated generation in control after a restart.
  ///
  /// Returns whether `configured` is already active. If it is not, the most
  /// recently activated generation keeps serving until an update installs
  /// `configured`.
  pub fn restore(&self, configured: &Generation) -> Result<bool> {
    let generations = GenerationManager::new(Arc::clone(&self.context.store));

    if self.resume(configured)? {
      // An earlier run may have stopped between activation and purge
      if let Err(e) = generations.purge_stale(configured) {
        warn!(generation = %configured, error = %e, "could not enumerate stale generations");
      }
      return Ok(true);
    }

    if let Some(previous) = generations.latest_active()? {
      debug!(generation = %previous, pending = %configured, "serving previous generation");
      self.resume(&previous)?;
    }

    Ok(false)
  }

  /// Install and activate `generation`, then claim all requests for it.
  ///
  /// The previous controller keeps serving until the claim. If install fails
  /// the previous controller stays in place.
  pub async fn update(&self, generation: Generation, manifest: &Manifest) -> Result<UpdateReport> {
    if self.active_generation().as_ref() == Some(&generation) {
      return Ok(UpdateReport::AlreadyActive(generation));
    }

    let mut worker = Worker::new(generation, self.context.clone());
    let install = worker.install(manifest).await?;
    let purge = worker.activate()?;
    debug!(generation = %worker.generation(), phase = ?worker.phase(), "claiming");
    self.claim(worker.into_interceptor()?);

    Ok(UpdateReport::Activated { install, purge })
  }

  /// Answer a request through the controller, or straight from the network
  /// when nothing is in control yet.
  pub async fn handle(&self, request: &Request) -> Result<CacheResult<Snapshot>> {
    match self.controller() {
      Some(interceptor) => interceptor.handle(request).await,
      None => {
        let response = self.context.network.fetch(request).await?;
        Ok(CacheResult::passthrough(response))
      }
    }
  }

  /// Wait for background work of the current controller.
  pub async fn settle(&self) {
    if let Some(interceptor) = self.controller() {
      interceptor.settle().await;
    }
  }

  fn claim(&self, interceptor: Interceptor<N>) {
    let generation = interceptor.generation().clone();
    match self.controller.write() {
      Ok(mut controller) => {
        *controller = Some(Arc::new(interceptor));
        info!(%generation, "claimed clients");
      }
      Err(e) => warn!(%generation, error = %e, "controller lock poisoned"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, SqliteStorage};
  use crate::testing::FakeFetcher;

  struct Fixture {
    store: Arc<SqliteStorage>,
    network: FakeFetcher,
    registration: Registration<FakeFetcher>,
  }

  fn base() -> Url {
    Url::parse("https://app.test/").unwrap()
  }

  fn fixture() -> Fixture {
    let store = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = FakeFetcher::new();
    let context = WorkerContext {
      store: store.clone(),
      network: Arc::new(network.clone()),
      policy: CachePolicy::new(&base(), &[]),
      offline_fallback: None,
    };
    Fixture {
      store,
      network,
      registration: Registration::new(context),
    }
  }

  fn restart(f: &Fixture) -> Registration<FakeFetcher> {
    Registration::new(WorkerContext {
      store: f.store.clone(),
      network: Arc::new(f.network.clone()),
      policy: CachePolicy::new(&base(), &[]),
      offline_fallback: None,
    })
  }

  fn manifest(items: &[&str]) -> Manifest {
    let locators: Vec<String> = items.iter().map(|s| s.to_string()).collect();
    Manifest::resolve(&base(), &locators, None).unwrap()
  }

  fn get(url: &str) -> Request {
    Request::get(url).unwrap()
  }

  #[tokio::test]
  async fn test_generation_cutover_scenario() {
    let f = fixture();
    f.network.serve("https://app.test/shell.html", "shell v1");
    f.network.serve("https://app.test/app.js", "app v1");

    let report = f
      .registration
      .update(Generation::new("v1"), &manifest(&["/shell.html", "/app.js"]))
      .await
      .unwrap();
    assert!(matches!(report, UpdateReport::Activated { ref install, .. } if install.stored() == 2));

    f.network.set_online(false);
    let shell = f
      .registration
      .handle(&get("https://app.test/shell.html"))
      .await
      .unwrap();
    assert_eq!(shell.source, CacheSource::Cache);
    assert_eq!(shell.data.body, b"shell v1".to_vec());
    f.registration.settle().await;

    f.network.set_online(true);
    f.network.serve("https://app.test/app.v2.js", "app v2");
    let report = f
      .registration
      .update(Generation::new("v2"), &manifest(&["/shell.html", "/app.v2.js"]))
      .await
      .unwrap();
    match report {
      UpdateReport::Activated { purge, .. } => {
        assert_eq!(purge.deleted, vec![Generation::new("v1")]);
      }
      other => panic!("unexpected report {:?}", other),
    }

    f.network.set_online(false);
    assert!(f
      .registration
      .handle(&get("https://app.test/app.js"))
      .await
      .is_err());
    let app = f
      .registration
      .handle(&get("https://app.test/app.v2.js"))
      .await
      .unwrap();
    assert_eq!(app.data.body, b"app v2".to_vec());

    assert_eq!(
      f.store.list_generations().unwrap(),
      vec![Generation::new("v2")]
    );
    assert!(f.store.entries(&Generation::new("v1")).unwrap().is_empty());
    assert_eq!(f.store.entries(&Generation::new("v2")).unwrap().len(), 2);
  }

  #[tokio::test]
  async fn test_failed_core_document_keeps_previous_controller() {
    let f = fixture();
    f.network.serve("https://app.test/shell.html", "shell v1");
    f.registration
      .update(Generation::new("v1"), &manifest(&["/shell.html"]))
      .await
      .unwrap();

    f.network.remove("https://app.test/shell.html");
    let result = f
      .registration
      .update(Generation::new("v2"), &manifest(&["/shell.html"]))
      .await;

    assert!(result.is_err());
    assert_eq!(f.registration.active_generation(), Some(Generation::new("v1")));
    assert_eq!(
      f.store.list_generations().unwrap(),
      vec![Generation::new("v1")]
    );
  }

  #[tokio::test]
  async fn test_non_core_failure_still_activates() {
    let f = fixture();
    f.network.serve("https://app.test/shell.html", "shell");

    let report = f
      .registration
      .update(
        Generation::new("v1"),
        &manifest(&["/shell.html", "/fonts.css"]),
      )
      .await
      .unwrap();

    match report {
      UpdateReport::Activated { install, .. } => {
        assert_eq!(install.stored(), 1);
        assert_eq!(install.failures().count(), 1);
      }
      other => panic!("unexpected report {:?}", other),
    }
    assert_eq!(f.registration.active_generation(), Some(Generation::new("v1")));
  }

  #[tokio::test]
  async fn test_update_to_active_generation_is_noop() {
    let f = fixture();
    f.network.serve("https://app.test/shell.html", "shell");
    let m = manifest(&["/shell.html"]);

    f.registration.update(Generation::new("v1"), &m).await.unwrap();
    let again = f.registration.update(Generation::new("v1"), &m).await.unwrap();

    assert!(matches!(again, UpdateReport::AlreadyActive(_)));
    assert_eq!(f.network.calls("https://app.test/shell.html"), 1);
  }

  #[tokio::test]
  async fn test_no_controller_passes_through() {
    let f = fixture();
    f.network.serve("https://app.test/app.js", "app");

    let result = f
      .registration
      .handle(&get("https://app.test/app.js"))
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Passthrough);
    assert!(f.store.list_generations().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_resume_existing_generation() {
    let f = fixture();
    f.network.serve("https://app.test/shell.html", "shell");
    f.registration
      .update(Generation::new("v1"), &manifest(&["/shell.html"]))
      .await
      .unwrap();

    let restarted = restart(&f);
    assert!(!restarted.resume(&Generation::new("v2")).unwrap());
    assert!(restarted.resume(&Generation::new("v1")).unwrap());

    f.network.set_online(false);
    let shell = restarted
      .handle(&get("https://app.test/shell.html"))
      .await
      .unwrap();
    assert_eq!(shell.source, CacheSource::Cache);
  }

  #[tokio::test]
  async fn test_interrupted_install_is_retried_after_restart() {
    let f = fixture();
    f.network.serve("https://app.test/shell.html", "shell v1");
    f.registration
      .update(Generation::new("v1"), &manifest(&["/shell.html"]))
      .await
      .unwrap();
    // v2 got its namespace, then the process died before activation
    f.store.open_generation(&Generation::new("v2")).unwrap();

    let restarted = restart(&f);
    assert!(!restarted.restore(&Generation::new("v2")).unwrap());
    assert_eq!(restarted.active_generation(), Some(Generation::new("v1")));

    f.network.set_online(false);
    let shell = restarted
      .handle(&get("https://app.test/shell.html"))
      .await
      .unwrap();
    assert_eq!(shell.source, CacheSource::Cache);
    assert_eq!(shell.data.body, b"shell v1".to_vec());
    restarted.settle().await;

    f.network.set_online(true);
    f.network.serve("https://app.test/shell.html", "shell v2");
    let report = restarted
      .update(Generation::new("v2"), &manifest(&["/shell.html"]))
      .await
      .unwrap();
    match report {
      UpdateReport::Activated { purge, .. } => {
        assert_eq!(purge.deleted, vec![Generation::new("v1")]);
      }
      other => panic!("unexpected report {:?}", other),
    }
    assert_eq!(
      f.store.list_generations().unwrap(),
      vec![Generation::new("v2")]
    );
  }

  #[tokio::test]
  async fn test_restore_finishes_interrupted_purge() {
    let f = fixture();
    f.network.serve("https://app.test/shell.html", "shell");
    f.registration
      .update(Generation::new("v1"), &manifest(&["/shell.html"]))
      .await
      .unwrap();
    // v2 was recorded active but the purge of v1 never ran
    f.store.open_generation(&Generation::new("v2")).unwrap();
    f.store.mark_active(&Generation::new("v2")).unwrap();

    let restarted = restart(&f);
    assert!(restarted.restore(&Generation::new("v2")).unwrap());
    assert_eq!(restarted.active_generation(), Some(Generation::new("v2")));
    assert_eq!(
      f.store.list_generations().unwrap(),
      vec![Generation::new("v2")]
    );
  }

  #[tokio::test]
  async fn test_restore_with_empty_store() {
    let f = fixture();
    assert!(!f.registration.restore(&Generation::new("v1")).unwrap());
    assert_eq!(f.registration.active_generation(), None);
  }

  #[tokio::test]
  async fn test_unreachable_explicit_core_fails_install() {
    let f = fixture();
    f.network.serve("https://app.test/app.js", "app");
    let locators = vec!["/app.js".to_string()];
    let m = Manifest::resolve(&base(), &locators, Some("/shell.html")).unwrap();

    let result = f.registration.update(Generation::new("v1"), &m).await;

    assert!(result.is_err());
    assert_eq!(f.registration.active_generation(), None);
    assert!(f.store.list_generations().unwrap().is_empty());
    assert!(!restart(&f).restore(&Generation::new("v1")).unwrap());
  }

  #[tokio::test]
  async fn test_worker_phases() {
    let f = fixture();
    f.network.serve("https://app.test/shell.html", "shell");
    let context = WorkerContext {
      store: f.store.clone(),
      network: Arc::new(f.network.clone()),
      policy: CachePolicy::new(&base(), &[]),
      offline_fallback: None,
    };

    let mut worker = Worker::new(Generation::new("v1"), context.clone());
    assert_eq!(worker.generation(), &Generation::new("v1"));
    assert_eq!(worker.phase(), Phase::Installing);
    assert!(worker.activate().is_err());

    worker.install(&manifest(&["/shell.html"])).await.unwrap();
    assert_eq!(worker.phase(), Phase::Activating);
    worker.activate().unwrap();
    assert_eq!(worker.phase(), Phase::Active);
    assert!(worker.into_interceptor().is_ok());

    let mut failing = Worker::new(Generation::new("v2"), context);
    assert!(failing.install(&manifest(&["/gone.html"])).await.is_err());
    assert_eq!(failing.phase(), Phase::Redundant);
  }
}
