//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::cache::{Request, Response};
use crate::network::Network;
use crate::queue::{PendingSubmission, SubmissionStore};

type Responder = Box<dyn Fn(&Request) -> Result<Response> + Send + Sync>;

/// Scripted network that records every request it sees.
pub struct MockNetwork {
  responder: Mutex<Responder>,
  calls: Mutex<Vec<Request>>,
  gate: Mutex<Option<Arc<Notify>>>,
}

impl MockNetwork {
  pub fn new(responder: impl Fn(&Request) -> Result<Response> + Send + Sync + 'static) -> Self {
    Self {
      responder: Mutex::new(Box::new(responder)),
      calls: Mutex::new(Vec::new()),
      gate: Mutex::new(None),
    }
  }

  /// Every request answers 200 with `body`.
  pub fn serving(body: &'static str) -> Self {
    Self::new(move |_| Ok(Response::new(200, body)))
  }

  /// Every request fails as if the device were offline.
  pub fn offline() -> Self {
    Self::new(|req| Err(eyre!("network unreachable: {}", req.url)))
  }

  pub fn set_responder(
    &self,
    responder: impl Fn(&Request) -> Result<Response> + Send + Sync + 'static,
  ) {
    *self.responder.lock().unwrap() = Box::new(responder);
  }

  pub fn go_offline(&self) {
    self.set_responder(|req| Err(eyre!("network unreachable: {}", req.url)));
  }

  /// Hold every subsequent fetch until the returned notifier fires.
  pub fn hold(&self) -> Arc<Notify> {
    let gate = Arc::new(Notify::new());
    *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
    gate
  }

  pub fn calls(&self) -> Vec<Request> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }
}

#[async_trait]
impl Network for MockNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    self.calls.lock().unwrap().push(request.clone());

    let gate = self.gate.lock().unwrap().clone();
    if let Some(gate) = gate {
      gate.notified().await;
    }

    let responder = self.responder.lock().unwrap();
    (*responder)(request)
  }
}

/// Submission store whose disk is gone.
pub struct BrokenSubmissionStore;

impl SubmissionStore for BrokenSubmissionStore {
  fn add(&self, _payload: &serde_json::Value, _timestamp: DateTime<Utc>) -> Result<i64> {
    Err(eyre!("Failed to store submission: disk I/O error"))
  }

  fn pending(&self) -> Result<Vec<PendingSubmission>> {
    Err(eyre!("Failed to query submissions: disk I/O error"))
  }

  fn remove(&self, _id: i64) -> Result<bool> {
    Err(eyre!("Failed to delete submission: disk I/O error"))
  }
}

/// Format a timestamp the way servers send the `date` header.
pub fn http_date(at: DateTime<Utc>) -> String {
  at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
