//! Versioned partition naming, install-time pre-population, and the sweep of
//! partitions left behind by earlier deployments.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use tracing::{debug, info};
use url::Url;

use super::storage::CacheStorage;
use super::traits::Request;
use crate::config::CacheConfig;
use crate::network::Network;

/// Names of the current static and dynamic partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generations {
  prefix: String,
  static_name: String,
  dynamic_name: String,
}

impl Generations {
  pub fn new(prefix: &str, version: &str) -> Self {
    Self {
      prefix: format!("{}-", prefix),
      static_name: format!("{}-static-{}", prefix, version),
      dynamic_name: format!("{}-dynamic-{}", prefix, version),
    }
  }

  pub fn from_config(config: &CacheConfig) -> Self {
    Self::new(&config.prefix, &config.version)
  }

  pub fn static_name(&self) -> &str {
    &self.static_name
  }

  pub fn dynamic_name(&self) -> &str {
    &self.dynamic_name
  }

  /// Whether a partition belongs to this application at all.
  pub fn owns(&self, name: &str) -> bool {
    name.starts_with(&self.prefix)
  }

  /// Owned by this application but not one of the current partitions.
  pub fn is_superseded(&self, name: &str) -> bool {
    self.owns(name) && name != self.static_name && name != self.dynamic_name
  }

  /// Fetch every app shell URL and store them in the static partition.
  ///
  /// All-or-nothing: if any fetch fails, answers anything but 200, or cannot
  /// be stored, no entry is written and the install fails.
  pub async fn install<S, N>(&self, storage: &S, network: &N, app_shell: &[Url]) -> Result<usize>
  where
    S: CacheStorage,
    N: Network,
  {
    let requests: Vec<Request> = app_shell.iter().cloned().map(Request::get).collect();

    let results = join_all(requests.iter().map(|req| network.fetch(req))).await;

    let mut fetched = Vec::with_capacity(requests.len());
    for (request, result) in requests.into_iter().zip(results) {
      let response =
        result.map_err(|e| eyre!("Install failed to fetch {}: {}", request.url, e))?;
      if !response.is_cacheable() {
        return Err(eyre!(
          "Install failed: {} answered {}",
          request.url,
          response.status
        ));
      }
      fetched.push((request, response));
    }

    storage
      .open(&self.static_name)
      .put_all(&fetched)
      .map_err(|e| eyre!("Install failed to store app shell: {}", e))?;

    info!(
      partition = %self.static_name,
      count = fetched.len(),
      "Pre-populated app shell"
    );
    Ok(fetched.len())
  }

  /// Delete superseded partitions. Returns the names that were removed.
  pub fn sweep<S: CacheStorage>(&self, storage: &S) -> Result<Vec<String>> {
    let mut deleted = Vec::new();

    for name in storage.partition_names()? {
      if self.is_superseded(&name) {
        if storage.delete_partition(&name)? {
          info!(partition = %name, "Deleted old cache partition");
          deleted.push(name);
        }
      } else {
        debug!(partition = %name, "Keeping cache partition");
      }
    }

    Ok(deleted)
  }

  /// Delete every partition this application owns, current ones included.
  pub fn clear<S: CacheStorage>(&self, storage: &S) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for name in storage.partition_names()? {
      if self.owns(&name) && storage.delete_partition(&name)? {
        deleted.push(name);
      }
    }
    info!(count = deleted.len(), "Cleared cache partitions");
    Ok(deleted)
  }
}
