//! Offline action queue: capture while offline, persist, replay when back online.
//!
//! - [`QueueStore`] keeps the ordered list of pending actions in one durable slot
//! - [`ActionCapture`] turns submissions of opted-in forms into queued actions
//! - [`DrainWorker`] replays the queue and keeps only what failed

mod action;
mod capture;
mod drain;
mod store;

pub use action::QueuedAction;
pub use capture::{
  ActionCapture, ConsoleNotifier, FormField, FormSubmission, LogNotifier, SubmitOutcome,
  CSRF_FIELD,
};
pub use drain::{DrainReport, DrainTrigger, DrainWorker, RetryPolicy};
pub use store::{QueueStore, SlotStorage, SqliteSlots, DEAD_LETTER_SLOT};
