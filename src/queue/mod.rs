//! Offline submission queue.
//!
//! Form submissions that cannot reach the network are persisted here and
//! replayed, oldest first, when a background sync fires.

mod replay;
mod store;

pub use replay::{DrainReport, OfflineQueue};
pub use store::{PendingSubmission, SqliteSubmissionStore, SubmissionStore};
