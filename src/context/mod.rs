//! Per-run context record passed to agents through `PILOT_CONTEXT_FILE`.

mod record;
mod store;

pub use record::{ContextRecord, keys};
pub use store::{CONTEXT_FILE, ContextStore};
