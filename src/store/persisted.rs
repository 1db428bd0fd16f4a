//! The persisted reactive store.
//!
//! A [`PersistedStore`] holds one value, mirrors it into a single record of a
//! [`Persistence`] medium, and tells its subscribers about every change,
//! whether made locally through [`set`](PersistedStore::set) or by another
//! context writing the same record.
//!
//! # Consistency
//!
//! Within a context, every change and its notification happen as one turn:
//! a second thread changing the store waits for the first to finish, and a
//! subscriber that changes the store from inside its callback has its
//! notifications queued behind the ones still being delivered. Every
//! subscriber therefore ends on the value [`get`](PersistedStore::get)
//! returns.
//!
//! Contexts are not coordinated. When two of them write the same key at
//! about the same time the medium keeps the last write, and each context's
//! in-memory value may differ from the others' until the next change event
//! reaches it. The store guarantees nothing stronger than that.
//!
//! # Failures
//!
//! No method returns an error. An unreadable or corrupt record is replaced by
//! the initial value; a failed write is logged and the value lives on in
//! memory until the next successful write.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::subscription::Unsubscribe;
use crate::codec::{Codec, RawCodec};
use crate::error::CodecError;
use crate::storage::{Backend, Persistence};
use crate::sync;
use crate::utils::log_throttle::{self, should_emit};

const PERSIST_FAILURE_LOG_WINDOW: Duration = Duration::from_secs(60);

/// A registered change callback.
pub type Subscriber<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serializes changes with their notifications.
///
/// One thread at a time owns the turn. The owner may re-enter it (a
/// subscriber calling `set`); such nested changes only queue their
/// notifications, and the outermost caller delivers the queue in order.
struct Notifier<T> {
    owner: Mutex<Option<ThreadId>>,
    released: Condvar,
    queue: Mutex<VecDeque<(u64, Subscriber<T>, T)>>,
}

impl<T> Notifier<T> {
    fn new() -> Self {
        Self {
            owner: Mutex::new(None),
            released: Condvar::new(),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    fn enter(&self) -> Turn<'_, T> {
        let me = thread::current().id();
        let mut owner = lock(&self.owner);
        if *owner == Some(me) {
            return Turn {
                notifier: self,
                outermost: false,
            };
        }
        while owner.is_some() {
            owner = self
                .released
                .wait(owner)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *owner = Some(me);
        Turn {
            notifier: self,
            outermost: true,
        }
    }
}

struct Turn<'a, T> {
    notifier: &'a Notifier<T>,
    outermost: bool,
}

impl<T> Drop for Turn<'_, T> {
    fn drop(&mut self) {
        if !self.outermost {
            return;
        }
        // Left over only if a subscriber panicked.
        lock(&self.notifier.queue).clear();
        *lock(&self.notifier.owner) = None;
        self.notifier.released.notify_one();
    }
}

struct StoreShared<T> {
    key: String,
    initial: T,
    current: Mutex<T>,
    /// Kept in subscription order.
    subscribers: Mutex<Vec<(u64, Subscriber<T>)>>,
    next_subscriber_id: AtomicU64,
    notifier: Notifier<T>,
    persistence: Arc<dyn Persistence>,
    codec: Arc<dyn Codec<T>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl<T> Drop for StoreShared<T> {
    fn drop(&mut self) {
        if let Some(listener) = lock(&self.listener).take() {
            listener.abort();
        }
    }
}

/// An observable value bound to one record of a persistence medium.
///
/// Cloning yields another handle to the same store.
pub struct PersistedStore<T> {
    shared: Arc<StoreShared<T>>,
}

impl<T> Clone for PersistedStore<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

/// Non-owning reference held by the sync listener.
pub(crate) struct WeakStore<T> {
    shared: Weak<StoreShared<T>>,
}

impl<T> WeakStore<T> {
    pub(crate) fn upgrade(&self) -> Option<PersistedStore<T>> {
        self.shared.upgrade().map(|shared| PersistedStore { shared })
    }
}

/// The store used for the authorization header: raw strings, empty when
/// logged out.
pub type TokenStore = PersistedStore<String>;

impl PersistedStore<String> {
    /// A string store stored verbatim, following changes from other contexts.
    pub fn token(key: impl Into<String>, initial: impl Into<String>, backend: &Backend) -> Self {
        Self::open(key, initial.into(), backend, Arc::new(RawCodec))
    }
}

impl<T> PersistedStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a store bound to `key`, loading the existing record if there
    /// is a valid one. Otherwise the store starts at `initial`, which is
    /// written back so a corrupt record heals itself.
    ///
    /// The store does not follow other contexts; see [`open`](Self::open).
    pub fn create(
        key: impl Into<String>,
        initial: T,
        persistence: Arc<dyn Persistence>,
        codec: Arc<dyn Codec<T>>,
    ) -> Self {
        let key = key.into();

        if !persistence.is_enabled() {
            info!(
                event_name = "store.persistence.disabled",
                event_domain = "store",
                key = key.as_str(),
                "Storage is disabled; the value will not survive a restart"
            );
        }

        let loaded = match persistence.read(&key) {
            Some(raw) => match codec.decode(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(
                        event_name = "store.record.corrupt",
                        event_domain = "store",
                        key = key.as_str(),
                        error = %e,
                        "Stored record could not be decoded, falling back to the initial value"
                    );
                    None
                }
            },
            None => None,
        };

        let heal = loaded.is_none();
        let current = loaded.unwrap_or_else(|| initial.clone());

        let store = Self {
            shared: Arc::new(StoreShared {
                key,
                initial,
                current: Mutex::new(current),
                subscribers: Mutex::new(Vec::new()),
                next_subscriber_id: AtomicU64::new(0),
                notifier: Notifier::new(),
                persistence,
                codec,
                listener: Mutex::new(None),
                disposed: AtomicBool::new(false),
            }),
        };

        if heal {
            debug!(key = store.key(), "No usable record, writing the initial value");
            let value = store.get();
            store.persist(&value);
        }
        store
    }

    /// Creates the store and starts following changes made by other contexts
    /// sharing the backend's medium.
    pub fn open(
        key: impl Into<String>,
        initial: T,
        backend: &Backend,
        codec: Arc<dyn Codec<T>>,
    ) -> Self {
        // Subscribe before loading so no change between the two is lost.
        let changes = backend.changes.changes();
        let store = Self::create(key, initial, backend.persistence.clone(), codec);
        sync::spawn_listener(&store, backend.changes.context(), changes);
        store
    }

    pub fn key(&self) -> &str {
        &self.shared.key
    }

    /// The value used when the record is missing, corrupt or removed.
    pub fn initial(&self) -> &T {
        &self.shared.initial
    }

    /// The current value.
    pub fn get(&self) -> T {
        lock(&self.shared.current).clone()
    }

    /// Replaces the value, writes it through to storage, then notifies every
    /// subscriber in subscription order before returning.
    ///
    /// Called from inside a subscriber, the new value is delivered after the
    /// notifications already under way.
    pub fn set(&self, value: T) {
        let turn = self.shared.notifier.enter();
        self.replace(value, true, &turn);
    }

    /// Sets the value computed from the current one. No other change can
    /// slip in between reading and setting.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let turn = self.shared.notifier.enter();
        let next = f(&self.get());
        self.replace(next, true, &turn);
    }

    /// Registers `callback` and immediately calls it with the current value.
    pub fn subscribe<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let callback: Subscriber<T> = Arc::new(callback);

        if self.is_disposed() {
            callback(&self.get());
            return Unsubscribe::inert();
        }

        let turn = self.shared.notifier.enter();
        let id = self
            .shared
            .next_subscriber_id
            .fetch_add(1, Ordering::SeqCst);
        lock(&self.shared.subscribers).push((id, callback.clone()));

        let weak = Arc::downgrade(&self.shared);
        let handle = Unsubscribe::new(move || {
            if let Some(shared) = weak.upgrade() {
                lock(&shared.subscribers).retain(|(sid, _)| *sid != id);
            }
        });

        callback(&self.get());
        self.deliver(&turn);
        handle
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.shared.subscribers).len()
    }

    /// Stops following other contexts and drops every subscriber.
    /// `get` and `set` keep working afterwards.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(listener) = lock(&self.shared.listener).take() {
            listener.abort();
        }
        let dropped = std::mem::take(&mut *lock(&self.shared.subscribers)).len();
        debug!(key = self.key(), subscribers = dropped, "Store disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::SeqCst)
    }

    /// Whether a sync listener is currently attached.
    pub fn is_syncing(&self) -> bool {
        lock(&self.shared.listener)
            .as_ref()
            .map(|listener| !listener.is_finished())
            .unwrap_or(false)
    }

    /// Takes a value that another context already made durable: updates and
    /// notifies like `set`, but never writes.
    ///
    /// `raw` is the record content the value came from (`None` for a removed
    /// record). If the record holds something else by the time this store's
    /// turn comes, a later write superseded it and nothing is applied; the
    /// later write is either this store's own or arrives as its own event.
    pub(crate) fn apply_external(&self, value: T, raw: Option<&str>) -> bool {
        let turn = self.shared.notifier.enter();
        if self.read_record().as_deref() != raw {
            return false;
        }
        self.replace(value, false, &turn);
        true
    }

    pub(crate) fn decode(&self, raw: &str) -> Result<T, CodecError> {
        self.shared.codec.decode(raw)
    }

    pub(crate) fn read_record(&self) -> Option<String> {
        self.shared.persistence.read(&self.shared.key)
    }

    pub(crate) fn downgrade(&self) -> WeakStore<T> {
        WeakStore {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub(crate) fn set_listener(&self, listener: JoinHandle<()>) {
        if self.is_disposed() {
            listener.abort();
            return;
        }
        if let Some(previous) = lock(&self.shared.listener).replace(listener) {
            previous.abort();
        }
    }

    fn persist(&self, value: &T) {
        let shared = &self.shared;
        if !shared.persistence.is_enabled() {
            return;
        }

        let throttle_key = format!("store.persist.failed.{}", shared.key);
        let result = shared
            .codec
            .encode(value)
            .map_err(|e| e.to_string())
            .and_then(|raw| {
                shared
                    .persistence
                    .write(&shared.key, &raw)
                    .map_err(|e| e.to_string())
            });

        match result {
            Ok(()) => log_throttle::reset(&throttle_key),
            Err(error) => {
                if let Some(suppressed_count) =
                    should_emit(&throttle_key, PERSIST_FAILURE_LOG_WINDOW)
                {
                    warn!(
                        event_name = "store.persist.failed",
                        event_domain = "store",
                        key = shared.key.as_str(),
                        error = error.as_str(),
                        suppressed_count,
                        "Could not persist value; it is kept in memory only"
                    );
                }
            }
        }
    }

    fn replace(&self, value: T, write: bool, turn: &Turn<'_, T>) {
        *lock(&self.shared.current) = value.clone();
        if write {
            self.persist(&value);
        }
        {
            let subscribers = lock(&self.shared.subscribers);
            let mut queue = lock(&self.shared.notifier.queue);
            for (id, subscriber) in subscribers.iter() {
                queue.push_back((*id, subscriber.clone(), value.clone()));
            }
        }
        self.deliver(turn);
    }

    /// Runs queued notifications; only the outermost turn does.
    fn deliver(&self, turn: &Turn<'_, T>) {
        if !turn.outermost {
            return;
        }
        loop {
            let next = lock(&self.shared.notifier.queue).pop_front();
            let Some((id, subscriber, value)) = next else {
                break;
            };
            // Unsubscribed since the change was queued.
            if !self.is_subscribed(id) {
                continue;
            }
            subscriber(&value);
        }
    }

    fn is_subscribed(&self, id: u64) -> bool {
        lock(&self.shared.subscribers)
            .iter()
            .any(|(sid, _)| *sid == id)
    }
}
