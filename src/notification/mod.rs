//! Run event log and completion notifications.
//!
//! - `RunEvent`: lifecycle events appended to `<state_dir>/logs/<run_id>.log`
//! - `CompletionNotification`: terminal payload sent to a webhook and/or hook command
//! - `Notifier`: delivery

mod events;
mod notifier;

pub use events::{CompletionMetadata, CompletionNotification, EventType, RunEvent};
pub use notifier::Notifier;
