use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::db::Store;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
  /// Base URL of the restaurant API
  pub api_url: String,
  /// Port that identifies API requests (anything else is a static asset)
  pub api_port: u16,
  /// Origin the site's static assets are served from
  pub origin: String,
  /// Database file (defaults to the user data directory)
  pub database: Option<PathBuf>,
  /// Generated asset manifest used by `install`
  pub manifest: Option<PathBuf>,
  /// Pages that share one cached shell regardless of query string
  pub shell_pages: Vec<String>,
  /// Hosts that are never intercepted (map tiles and the like)
  pub passthrough_hosts: Vec<String>,
  /// URL fragments whose responses are never cached
  pub skip_cache_markers: Vec<String>,
  /// Pause between queuing a mutation and draining the queue
  pub drain_delay_ms: u64,
  /// How often `watch` polls the API for connectivity
  pub poll_interval_secs: u64,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      api_url: "http://localhost:1337".to_string(),
      api_port: 1337,
      origin: "http://localhost:8000".to_string(),
      database: None,
      manifest: None,
      shell_pages: vec!["restaurant.html".to_string()],
      passthrough_hosts: vec!["mapbox.com".to_string()],
      skip_cache_markers: vec!["browser-sync".to_string()],
      drain_delay_ms: 1,
      poll_interval_secs: 5,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./restocache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/restocache/config.yaml
  ///
  /// Falls back to defaults when no file is found. Environment overrides
  /// (`RESTOCACHE_API_URL`, `RESTOCACHE_DATABASE`) apply last.
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    Ok(config.with_overrides(|name| std::env::var(name).ok()))
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("restocache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("restocache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Apply environment overrides through `lookup`.
  pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
    if let Some(api_url) = lookup("RESTOCACHE_API_URL") {
      self.api_url = api_url;
    }
    if let Some(database) = lookup("RESTOCACHE_DATABASE") {
      self.database = Some(PathBuf::from(database));
    }
    self
  }

  pub fn api_url(&self) -> Result<Url> {
    Url::parse(&self.api_url).map_err(|e| eyre!("Invalid api_url {}: {}", self.api_url, e))
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin {}: {}", self.origin, e))
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => Store::default_path(),
    }
  }

  pub fn drain_delay(&self) -> Duration {
    Duration::from_millis(self.drain_delay_ms)
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.poll_interval_secs.max(1))
  }
}
