use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Handle returned by [`PersistedStore::subscribe`](super::PersistedStore::subscribe).
///
/// Calling [`unsubscribe`](Unsubscribe::unsubscribe) removes the callback;
/// further calls do nothing. Clones share the same subscription, so a clone
/// can be moved into the callback itself. Dropping the handle does not
/// unsubscribe.
#[derive(Clone)]
#[must_use = "the subscription stays active until `unsubscribe` is called"]
pub struct Unsubscribe {
    inner: Arc<Inner>,
}

struct Inner {
    remove: Option<Box<dyn Fn() + Send + Sync>>,
    done: AtomicBool,
}

impl Unsubscribe {
    pub(crate) fn new(remove: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                remove: Some(Box::new(remove)),
                done: AtomicBool::new(false),
            }),
        }
    }

    /// A handle for a callback that was never registered.
    pub(crate) fn inert() -> Self {
        Self {
            inner: Arc::new(Inner {
                remove: None,
                done: AtomicBool::new(true),
            }),
        }
    }

    pub fn unsubscribe(&self) {
        if self.inner.done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(remove) = &self.inner.remove {
            remove();
        }
    }

    pub fn is_active(&self) -> bool {
        !self.inner.done.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("active", &self.is_active())
            .finish()
    }
}
