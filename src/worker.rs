//! Event dispatch for the offline layer.
//!
//! The host hands every lifecycle, fetch, and sync event to
//! [`ServiceWorker::dispatch`] and awaits the result before treating the event
//! as handled.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheResult, CacheStorage, Request, Response};
use crate::config::Config;
use crate::network::Network;
use crate::queue::{DrainReport, OfflineQueue, SubmissionStore};

/// Events the host delivers.
#[derive(Debug)]
pub enum Event {
  /// New version deployed: pre-populate the static partition
  Install,
  /// Version takes over: sweep old partitions, claim open pages
  Activate,
  /// Intercepted request
  Fetch(Request),
  /// Background sync became runnable for `tag`
  Sync { tag: String },
  /// Control message from a page
  Message(Message),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
  /// Drop every partition this application owns
  ClearCache,
}

impl Event {
  pub fn kind(&self) -> &'static str {
    match self {
      Self::Install => "install",
      Self::Activate => "activate",
      Self::Fetch(_) => "fetch",
      Self::Sync { .. } => "sync",
      Self::Message(_) => "message",
    }
  }
}

/// What handling an event produced.
#[derive(Debug)]
pub enum Outcome {
  /// Lifecycle step finished; the host may signal readiness
  Ready,
  Response(CacheResult<Response>),
  Drained(DrainReport),
  Cleared(Vec<String>),
  /// Event was not meant for this worker
  Ignored,
}

/// Result of a live form submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
  Sent,
  /// Stored for background replay under this id
  Queued(i64),
}

/// Snapshot of what the layer currently holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
  pub partitions: Vec<(String, usize)>,
  pub pending_submissions: usize,
  /// When the oldest queued submission was made
  pub oldest_pending: Option<DateTime<Utc>>,
}

pub struct ServiceWorker<S: CacheStorage, Q: SubmissionStore, N: Network> {
  layer: CacheLayer<S, N>,
  queue: OfflineQueue<Q, N>,
  network: Arc<N>,
  app_shell: Vec<Url>,
  sync_tag: String,
}

impl<S: CacheStorage, Q: SubmissionStore, N: Network> ServiceWorker<S, Q, N> {
  pub fn new(config: &Config, storage: Arc<S>, submissions: Arc<Q>, network: Arc<N>) -> Result<Self> {
    Ok(Self {
      layer: CacheLayer::new(storage, Arc::clone(&network), &config.cache),
      queue: OfflineQueue::new(submissions, Arc::clone(&network), config.replay_url()?),
      network,
      app_shell: config.app_shell_urls()?,
      sync_tag: config.sync.tag.clone(),
    })
  }

  pub async fn dispatch(&self, event: Event) -> Result<Outcome> {
    debug!(kind = event.kind(), "Dispatching event");

    match event {
      Event::Install => self.on_install().await,
      Event::Activate => self.on_activate(),
      Event::Fetch(request) => self.on_fetch(request).await,
      Event::Sync { tag } => self.on_sync(&tag).await,
      Event::Message(message) => self.on_message(message),
    }
  }

  async fn on_install(&self) -> Result<Outcome> {
    let generations = self.layer.generations();
    generations
      .install(self.layer.storage(), self.network.as_ref(), &self.app_shell)
      .await?;
    Ok(Outcome::Ready)
  }

  fn on_activate(&self) -> Result<Outcome> {
    let generations = self.layer.generations();
    let deleted = generations.sweep(self.layer.storage())?;
    self.layer.storage().create_partition(generations.dynamic_name())?;
    info!(
      deleted = deleted.len(),
      "Activated, claiming open pages"
    );
    Ok(Outcome::Ready)
  }

  async fn on_fetch(&self, request: Request) -> Result<Outcome> {
    if !request.is_interceptable() {
      debug!(method = %request.method, url = %request.url, "Passing request through");
      let response = self.network.fetch(&request).await?;
      return Ok(Outcome::Response(CacheResult::from_network(response)));
    }

    let result = self.layer.handle(&request).await?;
    debug!(url = %request.url, source = %result.source, status = result.data.status, "Served");
    Ok(Outcome::Response(result))
  }

  async fn on_sync(&self, tag: &str) -> Result<Outcome> {
    if tag != self.sync_tag {
      debug!(tag, "Ignoring sync for unknown tag");
      return Ok(Outcome::Ignored);
    }
    Ok(Outcome::Drained(self.queue.drain().await?))
  }

  fn on_message(&self, message: Message) -> Result<Outcome> {
    match message {
      Message::ClearCache => {
        let deleted = self.layer.generations().clear(self.layer.storage())?;
        Ok(Outcome::Cleared(deleted))
      }
    }
  }

  /// Send a form submission now, queueing it if the network cannot take it.
  pub async fn submit(&self, payload: &serde_json::Value) -> Result<SubmitOutcome> {
    match self.queue.send(payload).await {
      Ok(true) => return Ok(SubmitOutcome::Sent),
      Ok(false) => warn!("Submission rejected, queueing for background sync"),
      Err(e) => warn!(error = %e, "Submission failed, queueing for background sync"),
    }
    Ok(SubmitOutcome::Queued(self.queue.enqueue(payload)?))
  }

  /// Let in-flight background refreshes write their results before the host
  /// goes away.
  pub async fn shutdown(&self) {
    let settled = self.layer.settle().await;
    debug!(settled, "Worker shut down");
  }

  pub fn status(&self) -> Result<Status> {
    let storage = self.layer.storage();
    let partitions = storage
      .partition_names()?
      .into_iter()
      .map(|name| -> Result<(String, usize)> {
        let count = storage.keys(&name)?.len();
        Ok((name, count))
      })
      .collect::<Result<Vec<_>>>()?;

    let pending = self.queue.store().pending()?;
    Ok(Status {
      partitions,
      pending_submissions: pending.len(),
      oldest_pending: pending.first().map(|s| s.timestamp),
    })
  }
}
