//! Core request/response types and the result wrapper for cache operations.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use sha2::{Digest, Sha256};
use url::Url;

/// How the page issued the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  /// Top-level page navigation
  Navigate,
  /// Subresource or script-initiated fetch
  #[default]
  Other,
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
  pub headers: BTreeMap<String, String>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  /// A plain GET for a subresource.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      mode: RequestMode::Other,
      headers: BTreeMap::new(),
      body: None,
    }
  }

  /// A GET issued as a page navigation.
  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  /// A POST carrying a JSON body.
  pub fn post_json(url: Url, payload: &serde_json::Value) -> Result<Self> {
    let body =
      serde_json::to_vec(payload).map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());

    Ok(Self {
      method: Method::POST,
      url,
      mode: RequestMode::Other,
      headers,
      body: Some(body),
    })
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  /// Only GET requests to http(s) origins go through the caching engine.
  pub fn is_interceptable(&self) -> bool {
    self.method == Method::GET && matches!(self.url.scheme(), "http" | "https")
  }

  /// URL used as the stored identity; fragments never reach the network.
  pub fn identity_url(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    url.to_string()
  }

  /// Stable, fixed-length key for the request identity (method + URL).
  pub fn cache_key(&self) -> String {
    let input = format!("{} {}", self.method, self.identity_url());

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A captured response. Header names are stored lowercased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name.to_lowercase(), value.into());
    self
  }

  /// Minimal page returned when neither network nor cache can answer.
  pub fn offline() -> Self {
    Self::new(503, "Offline").with_header("content-type", "text/plain")
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(&name.to_lowercase()).map(String::as_str)
  }

  /// Only a plain 200 is worth storing.
  pub fn is_cacheable(&self) -> bool {
    self.status == 200
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Capture time taken from the `date` header, if present and parseable.
  pub fn date(&self) -> Option<DateTime<Utc>> {
    self
      .header("date")
      .and_then(|s| DateTime::parse_from_rfc2822(s).ok())
      .map(|dt| dt.with_timezone(&Utc))
  }
}

/// Result from a cache operation, including data and metadata about the source.
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

  pub fn from_cache(data: T, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
    }
  }

  pub fn with_source(data: T, source: CacheSource) -> Self {
    Self { data, source }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, within its max age
  CacheFresh,
  /// Data from cache past its max age, served because the network failed
  CacheStale,
  /// The cached offline page, served for a failed navigation
  Fallback,
  /// Synthetic offline response, nothing else was available
  Offline,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::Network => "network",
      Self::CacheFresh => "cache",
      Self::CacheStale => "cache (stale)",
      Self::Fallback => "offline page",
      Self::Offline => "offline",
    };
    f.write_str(s)
  }
}
