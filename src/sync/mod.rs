//! Cross-context sync: follows writes made to the backing record by other
//! contexts and folds them into the local store without writing them back.

pub mod listener;

pub use listener::{apply_event, spawn_listener, SyncOutcome};
