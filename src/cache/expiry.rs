//! Per-class max-age policy for stored responses.

use chrono::{DateTime, Duration, Utc};

use super::classifier::ExpiryClass;
use super::traits::Response;
use crate::config::MaxAgeConfig;

#[derive(Debug, Clone, Copy)]
pub struct ExpiryPolicy {
  static_max_age: Duration,
  dynamic_max_age: Duration,
  api_max_age: Duration,
}

impl Default for ExpiryPolicy {
  fn default() -> Self {
    Self::new(&MaxAgeConfig::default())
  }
}

impl ExpiryPolicy {
  pub fn new(config: &MaxAgeConfig) -> Self {
    Self {
      static_max_age: Duration::seconds(config.static_secs),
      dynamic_max_age: Duration::seconds(config.dynamic_secs),
      api_max_age: Duration::seconds(config.api_secs),
    }
  }

  pub fn max_age(&self, class: ExpiryClass) -> Duration {
    match class {
      ExpiryClass::Static => self.static_max_age,
      ExpiryClass::Dynamic => self.dynamic_max_age,
      ExpiryClass::Api => self.api_max_age,
    }
  }

  pub fn is_expired(&self, class: ExpiryClass, response: &Response) -> bool {
    self.is_expired_at(class, response, Utc::now())
  }

  /// A response without a usable `date` header counts as captured just now.
  /// The max age itself is already expired.
  pub fn is_expired_at(&self, class: ExpiryClass, response: &Response, now: DateTime<Utc>) -> bool {
    let captured = response.date().unwrap_or(now);
    now - captured >= self.max_age(class)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::http_date;
  use chrono::TimeZone;

  fn now() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
  }

  fn captured_at(at: DateTime<Utc>) -> Response {
    Response::new(200, "body").with_header("date", http_date(at))
  }

  #[test]
  fn test_static_boundary() {
    let policy = ExpiryPolicy::default();
    let at_limit = captured_at(now() - Duration::days(30));
    let just_inside = captured_at(now() - (Duration::days(30) - Duration::seconds(1)));

    assert!(policy.is_expired_at(ExpiryClass::Static, &at_limit, now()));
    assert!(!policy.is_expired_at(ExpiryClass::Static, &just_inside, now()));
  }

  #[test]
  fn test_class_thresholds_differ() {
    let policy = ExpiryPolicy::default();
    let two_hours_old = captured_at(now() - Duration::hours(2));

    assert!(policy.is_expired_at(ExpiryClass::Api, &two_hours_old, now()));
    assert!(!policy.is_expired_at(ExpiryClass::Dynamic, &two_hours_old, now()));
    assert!(!policy.is_expired_at(ExpiryClass::Static, &two_hours_old, now()));

    let eight_days_old = captured_at(now() - Duration::days(8));
    assert!(policy.is_expired_at(ExpiryClass::Dynamic, &eight_days_old, now()));
    assert!(!policy.is_expired_at(ExpiryClass::Static, &eight_days_old, now()));
  }

  #[test]
  fn test_missing_date_is_fresh() {
    let policy = ExpiryPolicy::default();
    let undated = Response::new(200, "body");
    assert!(!policy.is_expired_at(ExpiryClass::Api, &undated, now()));

    let unparseable = Response::new(200, "body").with_header("date", "soon");
    assert!(!policy.is_expired_at(ExpiryClass::Api, &unparseable, now()));
  }

  #[test]
  fn test_custom_max_age() {
    let policy = ExpiryPolicy::new(&MaxAgeConfig {
      static_secs: 60,
      dynamic_secs: 60,
      api_secs: 0,
    });
    let fresh = captured_at(now());
    // Zero max age expires immediately
    assert!(policy.is_expired_at(ExpiryClass::Api, &fresh, now()));
    assert!(!policy.is_expired_at(ExpiryClass::Static, &fresh, now()));
  }
}
