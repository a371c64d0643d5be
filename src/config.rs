use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Base URL that relative paths (app shell, replay endpoint) resolve against
  pub origin: String,
  /// Where the SQLite database lives (default: $XDG_DATA_HOME/swcache)
  pub data_dir: Option<PathBuf>,
  pub cache: CacheConfig,
  pub sync: SyncConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8080".to_string(),
      data_dir: None,
      cache: CacheConfig::default(),
      sync: SyncConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Namespace shared by every partition this application owns
  pub prefix: String,
  /// Version tag of the current deployment
  pub version: String,
  /// Paths pre-populated on install and always served cache-first
  pub app_shell: Vec<String>,
  /// Substrings of path+query that force network-first
  pub network_first: Vec<String>,
  pub assets_marker: String,
  pub api_marker: String,
  /// Page served to failed navigations when it is cached
  pub offline_page: String,
  pub max_age: MaxAgeConfig,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "app".to_string(),
      version: "v1".to_string(),
      app_shell: vec![
        "/".to_string(),
        "/index.html".to_string(),
        "/offline.html".to_string(),
        "/assets/css/styles.css".to_string(),
        "/assets/js/main.js".to_string(),
        "/manifest.json".to_string(),
      ],
      network_first: vec![
        "/api/".to_string(),
        "/contact".to_string(),
        "fresh=true".to_string(),
      ],
      assets_marker: "/assets/".to_string(),
      api_marker: "/api/".to_string(),
      offline_page: "/offline.html".to_string(),
      max_age: MaxAgeConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct MaxAgeConfig {
  pub static_secs: i64,
  pub dynamic_secs: i64,
  pub api_secs: i64,
}

impl Default for MaxAgeConfig {
  fn default() -> Self {
    Self {
      static_secs: 30 * 24 * 60 * 60,
      dynamic_secs: 7 * 24 * 60 * 60,
      api_secs: 60 * 60,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Background sync tag that triggers a queue drain
  pub tag: String,
  /// Endpoint receiving replayed submissions as a JSON POST
  pub replay_endpoint: String,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: "sync-forms".to_string(),
      replay_endpoint: "/api/leads".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./swcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/swcache/config.yaml
  ///
  /// Falls back to defaults when no file is found.
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
      None => {
        tracing::debug!("No configuration file found, using defaults");
        Config::default()
      }
    };

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("swcache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("swcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("In config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))
  }

  fn validate(&self) -> Result<()> {
    self.origin_url()?;
    if self.cache.prefix.is_empty() || self.cache.version.is_empty() {
      return Err(eyre!("cache.prefix and cache.version must not be empty"));
    }
    Ok(())
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Resolve an absolute URL, or a path relative to the origin.
  pub fn resolve(&self, target: &str) -> Result<Url> {
    if let Ok(url) = Url::parse(target) {
      return Ok(url);
    }
    self
      .origin_url()?
      .join(target)
      .map_err(|e| eyre!("Invalid URL '{}': {}", target, e))
  }

  pub fn replay_url(&self) -> Result<Url> {
    self.resolve(&self.sync.replay_endpoint)
  }

  /// App shell paths resolved against the origin.
  pub fn app_shell_urls(&self) -> Result<Vec<Url>> {
    self.cache.app_shell.iter().map(|p| self.resolve(p)).collect()
  }

  pub fn data_dir(&self) -> Result<PathBuf> {
    match &self.data_dir {
      Some(dir) => Ok(dir.clone()),
      None => crate::db::default_dir(),
    }
  }
}
