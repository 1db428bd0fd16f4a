use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::storage::{ContextId, StorageEvent};
use crate::store::persisted::WeakStore;
use crate::store::PersistedStore;

/// What the listener did with one change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The new value was decoded and taken over.
    Applied,
    /// The record was removed or the medium cleared; the store went back to
    /// its initial value.
    Reset,
    /// The event came from this context's own write.
    OwnWrite,
    /// The event concerned another key.
    OtherKey,
    /// The new value could not be decoded; local state was kept.
    Undecodable,
    /// The record changed again before the event was applied; the later
    /// change wins.
    Superseded,
}

/// Folds one change event into `store` without writing to storage.
///
/// `own_context` is the context the store writes as; its own events are
/// skipped, as is anything for another key, that fails to decode, or that the
/// record no longer holds.
pub fn apply_event<T>(
    store: &PersistedStore<T>,
    own_context: ContextId,
    event: &StorageEvent,
) -> SyncOutcome
where
    T: Clone + Send + Sync + 'static,
{
    if event.origin == own_context {
        return SyncOutcome::OwnWrite;
    }

    let key = match &event.key {
        Some(key) => key,
        None => {
            debug!(key = store.key(), "Medium cleared by another context");
            return reset(store);
        }
    };
    if key != store.key() {
        return SyncOutcome::OtherKey;
    }

    match &event.new_value {
        None => {
            debug!(key = store.key(), "Record removed by another context");
            reset(store)
        }
        Some(raw) => match store.decode(raw) {
            Ok(value) => {
                if !store.apply_external(value, Some(raw)) {
                    debug!(key = store.key(), "Change superseded by a later write");
                    return SyncOutcome::Superseded;
                }
                debug!(
                    event_name = "sync.value.applied",
                    event_domain = "sync",
                    key = store.key(),
                    origin = %event.origin,
                    "Took over value written by another context"
                );
                SyncOutcome::Applied
            }
            Err(e) => {
                warn!(
                    event_name = "sync.value.undecodable",
                    event_domain = "sync",
                    key = store.key(),
                    origin = %event.origin,
                    error = %e,
                    "Ignoring undecodable value written by another context"
                );
                SyncOutcome::Undecodable
            }
        },
    }
}

fn reset<T>(store: &PersistedStore<T>) -> SyncOutcome
where
    T: Clone + Send + Sync + 'static,
{
    if store.apply_external(store.initial().clone(), None) {
        SyncOutcome::Reset
    } else {
        SyncOutcome::Superseded
    }
}

/// Re-reads the record after missed events and takes it over as if it had
/// arrived as a change.
fn resync<T>(store: &PersistedStore<T>)
where
    T: Clone + Send + Sync + 'static,
{
    match store.read_record() {
        Some(raw) => match store.decode(&raw) {
            Ok(value) => {
                store.apply_external(value, Some(&raw));
            }
            Err(e) => warn!(
                key = store.key(),
                error = %e,
                "Record is undecodable after resync, keeping local value"
            ),
        },
        None => {
            store.apply_external(store.initial().clone(), None);
        }
    }
}

/// Starts the background task feeding `changes` into `store`.
///
/// Needs a tokio runtime; without one the store stays single-context and a
/// warning is logged. The task ends when the feed closes, the store is
/// disposed, or the last store handle is dropped.
pub fn spawn_listener<T>(
    store: &PersistedStore<T>,
    own_context: ContextId,
    changes: broadcast::Receiver<StorageEvent>,
) where
    T: Clone + Send + Sync + 'static,
{
    let runtime = match tokio::runtime::Handle::try_current() {
        Ok(runtime) => runtime,
        Err(_) => {
            warn!(
                event_name = "sync.listener.unavailable",
                event_domain = "sync",
                key = store.key(),
                "No tokio runtime; changes from other contexts will not be followed"
            );
            return;
        }
    };

    let task = runtime.spawn(listen(store.downgrade(), own_context, changes));
    store.set_listener(task);
}

async fn listen<T>(
    weak: WeakStore<T>,
    own_context: ContextId,
    mut changes: broadcast::Receiver<StorageEvent>,
) where
    T: Clone + Send + Sync + 'static,
{
    loop {
        let received = changes.recv().await;
        let Some(store) = weak.upgrade() else {
            break;
        };
        match received {
            Ok(event) => {
                apply_event(&store, own_context, &event);
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(
                    event_name = "sync.listener.lagged",
                    event_domain = "sync",
                    key = store.key(),
                    skipped,
                    "Missed change events, re-reading the record"
                );
                resync(&store);
            }
            Err(RecvError::Closed) => {
                debug!(key = store.key(), "Change feed closed, listener stopping");
                break;
            }
        }
    }
}
