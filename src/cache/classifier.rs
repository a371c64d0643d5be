//! Decides which fetch strategy and expiry class a request falls under.

use url::Url;

use crate::config::CacheConfig;

/// The three fetch strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  NetworkFirst,
  CacheFirst,
  StaleWhileRevalidate,
}

impl std::fmt::Display for Strategy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::NetworkFirst => "network-first",
      Self::CacheFirst => "cache-first",
      Self::StaleWhileRevalidate => "stale-while-revalidate",
    };
    f.write_str(s)
  }
}

/// Staleness class, recomputed from the URL on every read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryClass {
  Static,
  Dynamic,
  Api,
}

/// Pure URL-shape rules. Callers only hand it interceptable GET requests.
#[derive(Debug, Clone)]
pub struct Classifier {
  network_first: Vec<String>,
  app_shell: Vec<String>,
  assets_marker: String,
  api_marker: String,
}

impl Classifier {
  pub fn new(config: &CacheConfig) -> Self {
    Self {
      network_first: config.network_first.clone(),
      app_shell: config.app_shell.clone(),
      assets_marker: config.assets_marker.clone(),
      api_marker: config.api_marker.clone(),
    }
  }

  pub fn classify(&self, url: &Url) -> Strategy {
    let target = path_and_query(url);
    if self.network_first.iter().any(|p| target.contains(p.as_str())) {
      Strategy::NetworkFirst
    } else if self.is_static_asset(url) {
      Strategy::CacheFirst
    } else {
      Strategy::StaleWhileRevalidate
    }
  }

  /// App shell paths and anything under the assets marker.
  pub fn is_static_asset(&self, url: &Url) -> bool {
    let path = url.path();
    self.app_shell.iter().any(|p| p == path) || path.contains(self.assets_marker.as_str())
  }

  pub fn expiry_class(&self, url: &Url) -> ExpiryClass {
    if path_and_query(url).contains(self.api_marker.as_str()) {
      ExpiryClass::Api
    } else if self.is_static_asset(url) {
      ExpiryClass::Static
    } else {
      ExpiryClass::Dynamic
    }
  }
}

fn path_and_query(url: &Url) -> String {
  match url.query() {
    Some(q) => format!("{}?{}", url.path(), q),
    None => url.path().to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn classifier() -> Classifier {
    Classifier::new(&CacheConfig::default())
  }

  fn url(path: &str) -> Url {
    Url::parse("https://example.com").unwrap().join(path).unwrap()
  }

  #[test]
  fn test_api_is_network_first() {
    assert_eq!(
      classifier().classify(&url("/api/pricing")),
      Strategy::NetworkFirst
    );
  }

  #[test]
  fn test_fresh_marker_is_network_first() {
    assert_eq!(
      classifier().classify(&url("/pricing?fresh=true")),
      Strategy::NetworkFirst
    );
  }

  #[test]
  fn test_network_first_beats_app_shell() {
    // Matches both the assets marker and a network-first pattern
    assert_eq!(
      classifier().classify(&url("/assets/css/styles.css?fresh=true")),
      Strategy::NetworkFirst
    );
  }

  #[test]
  fn test_app_shell_and_assets_are_cache_first() {
    let c = classifier();
    assert_eq!(c.classify(&url("/")), Strategy::CacheFirst);
    assert_eq!(c.classify(&url("/index.html")), Strategy::CacheFirst);
    assert_eq!(c.classify(&url("/assets/img/hero.webp")), Strategy::CacheFirst);
  }

  #[test]
  fn test_other_pages_are_stale_while_revalidate() {
    let c = classifier();
    assert_eq!(c.classify(&url("/pricing")), Strategy::StaleWhileRevalidate);
    assert_eq!(c.classify(&url("/blog/launch.html")), Strategy::StaleWhileRevalidate);
  }

  #[test]
  fn test_expiry_classes() {
    let c = classifier();
    assert_eq!(c.expiry_class(&url("/api/roi")), ExpiryClass::Api);
    assert_eq!(c.expiry_class(&url("/assets/js/main.js")), ExpiryClass::Static);
    assert_eq!(c.expiry_class(&url("/pricing")), ExpiryClass::Dynamic);
  }
}
