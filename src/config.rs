use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::{Generation, Manifest};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Build-time generation id. Bumping it invalidates every client's cache.
  pub generation: String,
  /// Where the application is served from; defines its own origin and
  /// resolves relative manifest entries
  pub base_url: Url,
  /// Resources that must be cached for the app shell to work offline
  pub manifest: Vec<String>,
  /// Top-level entry point (defaults to the first manifest entry)
  pub core_document: Option<String>,
  /// Third-party hosts whose responses may be cached
  #[serde(default = "default_trusted_hosts")]
  pub trusted_hosts: Vec<String>,
  /// Stored page served to document requests when offline with nothing cached
  pub offline_fallback: Option<String>,
  /// Cache database location (defaults to the data directory)
  pub database: Option<PathBuf>,
}

fn default_trusted_hosts() -> Vec<String> {
  vec!["esm.sh".to_string()]
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./innerorder.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/innerorder/config.yaml
  ///
  /// `INNERORDER_GENERATION` overrides the generation id.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => {
        return Err(eyre!(
          "No configuration file found. Create one at ~/.config/innerorder/config.yaml\n\
                 See innerorder.example.yaml for the format."
        ))
      }
    };

    if let Some(generation) = Self::generation_override() {
      config.generation = generation;
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("innerorder.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("innerorder").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;

    if config.generation.trim().is_empty() {
      return Err(eyre!("generation must not be empty"));
    }

    Ok(config)
  }

  fn generation_override() -> Option<String> {
    std::env::var("INNERORDER_GENERATION")
      .ok()
      .filter(|g| !g.trim().is_empty())
  }

  pub fn generation(&self) -> Generation {
    Generation::new(self.generation.trim())
  }

  pub fn manifest(&self) -> Result<Manifest> {
    Manifest::resolve(
      &self.base_url,
      &self.manifest,
      self.core_document.as_deref(),
    )
  }

  pub fn offline_fallback_url(&self) -> Result<Option<Url>> {
    self
      .offline_fallback
      .as_deref()
      .map(|f| {
        self
          .base_url
          .join(f)
          .map_err(|e| eyre!("Invalid offline_fallback '{}': {}", f, e))
      })
      .transpose()
  }
}
