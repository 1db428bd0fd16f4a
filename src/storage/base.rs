use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, info};
use uuid::Uuid;

use super::file_storage::FileStorage;
use super::memory_storage::MemoryStorage;
use super::no_storage::{NoChangeSource, NoStorage};
use crate::config::{StorageBackend, StorageConfig};
use crate::error::StorageError;

/// Identity of one execution context (a tab, a process) sharing a medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(Uuid);

impl ContextId {
    pub fn new() -> Self {
        ContextId(Uuid::new_v4())
    }

    /// Origin used for changes whose writer cannot be identified.
    pub fn unknown() -> Self {
        ContextId(Uuid::nil())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A change to the backing medium, as observed by every context sharing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    /// The record that changed; `None` when the whole medium was cleared.
    pub key: Option<String>,
    pub old_value: Option<String>,
    /// The new raw value; `None` when the record was removed.
    pub new_value: Option<String>,
    /// The context that performed the write.
    pub origin: ContextId,
}

/// Read/write access to the durable string records.
///
/// `read` returns `None` both for a missing record and for an unusable medium;
/// callers treat the two identically.
pub trait Persistence: Send + Sync {
    fn read(&self, key: &str) -> Option<String>;
    fn write(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn is_enabled(&self) -> bool {
        // NoStorage overrides this so the store can log a clearer message
        true
    }
}

/// Platform channel announcing writes made to the medium by any context.
pub trait ChangeSource: Send + Sync {
    /// The context that local writes through the paired `Persistence` are
    /// attributed to.
    fn context(&self) -> ContextId;
    /// A fresh receiver of change events. A closed receiver means the medium
    /// never reports changes.
    fn changes(&self) -> broadcast::Receiver<StorageEvent>;
}

/// A persistence adapter paired with the change feed of the same medium.
#[derive(Clone)]
pub struct Backend {
    pub persistence: Arc<dyn Persistence>,
    pub changes: Arc<dyn ChangeSource>,
}

impl Backend {
    pub fn new(persistence: Arc<dyn Persistence>, changes: Arc<dyn ChangeSource>) -> Self {
        Self {
            persistence,
            changes,
        }
    }

    /// A backend that persists nothing and never reports changes.
    pub fn disabled() -> Self {
        Self::new(Arc::new(NoStorage::new()), Arc::new(NoChangeSource::new()))
    }
}

/// Creates a concrete backend from the StorageConfig.
/// If `storage.enabled = false`, returns NoStorage. A missing backend also
/// degrades to NoStorage rather than aborting.
pub fn create_backend(config: &StorageConfig) -> Backend {
    if !config.enabled {
        info!(
            event_name = "storage.backend.disabled",
            event_domain = "storage",
            "Storage is disabled. Values will live in memory only."
        );
        return Backend::disabled();
    }

    let backend = match &config.backend {
        Some(StorageBackend::Memory(memory_config)) => {
            let storage = Arc::new(MemoryStorage::from_config(memory_config));
            info!(
                event_name = "storage.backend.created",
                event_domain = "storage",
                backend = "memory",
                context = %storage.context(),
                "Created in-memory storage."
            );
            Backend::new(storage.clone(), storage)
        }
        Some(StorageBackend::File(file_config)) => {
            let storage = Arc::new(FileStorage::from_config(file_config));
            info!(
                event_name = "storage.backend.created",
                event_domain = "storage",
                backend = "file",
                path = %file_config.path.display(),
                context = %storage.context(),
                "Created file storage."
            );
            Backend::new(storage.clone(), storage)
        }
        None => {
            error!(
                event_name = "storage.backend.missing",
                event_domain = "storage",
                "Storage is enabled, but no backend config is provided! Falling back to memory-only."
            );
            return Backend::disabled();
        }
    };

    if config.cross_context_sync {
        backend
    } else {
        info!(
            event_name = "storage.sync.disabled",
            event_domain = "storage",
            "Cross-context sync is disabled."
        );
        Backend::new(backend.persistence, Arc::new(NoChangeSource::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryStorageConfig;

    fn memory_config(enabled: bool, cross_context_sync: bool) -> StorageConfig {
        StorageConfig {
            enabled,
            cross_context_sync,
            backend: Some(StorageBackend::Memory(MemoryStorageConfig { quota_bytes: None })),
        }
    }

    /// Disabled storage yields a backend that neither persists nor notifies.
    #[test]
    fn test_create_backend_disabled() {
        let backend = create_backend(&memory_config(false, true));
        assert!(!backend.persistence.is_enabled());
        assert!(backend.persistence.write("k", "v").is_err());
        assert_eq!(backend.persistence.read("k"), None);
    }

    /// Enabled storage without a backend degrades instead of exiting.
    #[test]
    fn test_create_backend_missing_backend() {
        let config = StorageConfig {
            enabled: true,
            cross_context_sync: true,
            backend: None,
        };
        let backend = create_backend(&config);
        assert!(!backend.persistence.is_enabled());
    }

    /// The memory backend persists through the returned adapter.
    #[test]
    fn test_create_backend_memory() {
        let backend = create_backend(&memory_config(true, true));
        assert!(backend.persistence.is_enabled());
        backend.persistence.write("k", "v").unwrap();
        assert_eq!(backend.persistence.read("k").as_deref(), Some("v"));
    }

    /// Turning sync off swaps in a change feed that is already closed.
    #[tokio::test]
    async fn test_create_backend_without_sync() {
        let backend = create_backend(&memory_config(true, false));
        let mut rx = backend.changes.changes();
        backend.persistence.write("k", "v").unwrap();
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[test]
    fn test_context_ids_are_unique() {
        assert_ne!(ContextId::new(), ContextId::new());
        assert_eq!(ContextId::unknown(), ContextId::unknown());
    }
}
