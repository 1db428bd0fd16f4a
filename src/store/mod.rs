pub mod persisted;
pub mod subscription;

// Re-export the primary store items so code outside can do
// "use crate::store::{PersistedStore, Unsubscribe};"
pub use persisted::{PersistedStore, Subscriber, TokenStore};
pub use subscription::Unsubscribe;
