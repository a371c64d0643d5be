//! Enqueue and replay of offline form submissions.

use chrono::Utc;
use color_eyre::Result;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

use super::store::SubmissionStore;
use crate::cache::Request;
use crate::network::Network;

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Replayed and removed, in replay order
  pub replayed: Vec<i64>,
  /// Still queued for the next sync
  pub failed: Vec<i64>,
}

impl DrainReport {
  pub fn attempted(&self) -> usize {
    self.replayed.len() + self.failed.len()
  }
}

/// Durable queue of form submissions awaiting network replay.
pub struct OfflineQueue<Q: SubmissionStore, N: Network> {
  store: Arc<Q>,
  network: Arc<N>,
  endpoint: Url,
}

impl<Q: SubmissionStore, N: Network> OfflineQueue<Q, N> {
  pub fn new(store: Arc<Q>, network: Arc<N>, endpoint: Url) -> Self {
    Self {
      store,
      network,
      endpoint,
    }
  }

  pub fn store(&self) -> &Q {
    &self.store
  }

  /// Durably append a submission. Storage errors reach the caller.
  pub fn enqueue(&self, payload: &serde_json::Value) -> Result<i64> {
    let id = self.store.add(payload, Utc::now())?;
    info!(id, "Queued submission for background sync");
    Ok(id)
  }

  /// POST a payload to the replay endpoint. Ok(true) on a 2xx.
  pub async fn send(&self, payload: &serde_json::Value) -> Result<bool> {
    let request = Request::post_json(self.endpoint.clone(), payload)?;
    let response = self.network.fetch(&request).await?;
    if !response.is_success() {
      debug!(status = response.status, "Replay endpoint rejected submission");
    }
    Ok(response.is_success())
  }

  /// Replay every pending submission in insertion order.
  ///
  /// Each submission is removed only after its own replay succeeds; a failed
  /// replay stays queued and does not stop the rest. Only a failure to read
  /// the queue is returned as an error.
  pub async fn drain(&self) -> Result<DrainReport> {
    let pending = self.store.pending()?;
    let mut report = DrainReport::default();

    if pending.is_empty() {
      debug!("No pending submissions");
      return Ok(report);
    }

    for submission in pending {
      let id = submission.id;
      match self.send(&submission.payload).await {
        Ok(true) => match self.store.remove(id) {
          Ok(_) => {
            debug!(id, "Replayed submission");
            report.replayed.push(id);
          }
          Err(e) => {
            // Stays queued and will be sent again: at-least-once
            error!(id, error = %e, "Replayed submission but failed to remove it");
            report.failed.push(id);
          }
        },
        Ok(false) => {
          warn!(id, "Submission rejected, keeping it queued");
          report.failed.push(id);
        }
        Err(e) => {
          warn!(id, error = %e, "Submission replay failed, keeping it queued");
          report.failed.push(id);
        }
      }
    }

    info!(
      replayed = report.replayed.len(),
      failed = report.failed.len(),
      "Drained submission queue"
    );
    Ok(report)
  }
}
