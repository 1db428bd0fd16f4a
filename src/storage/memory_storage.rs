use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use super::{ChangeSource, ContextId, Persistence, StorageEvent};
use crate::error::StorageError;

const EVENT_CAPACITY: usize = 64;

/// The config struct for in-memory storage.
#[derive(Deserialize, Serialize, JsonSchema, Debug, Clone, Default)]
pub struct MemoryStorageConfig {
    /// Maximum total size of all keys and values in bytes.
    #[serde(default)]
    pub quota_bytes: Option<usize>,
}

/// A key-value medium held in process memory and shared by any number of
/// [`MemoryStorage`] handles, each of which acts as a separate context.
///
/// Every write that changes a record is broadcast to all handles, the same
/// way a browser raises a storage event in every other tab.
pub struct MemoryMedium {
    records: Mutex<HashMap<String, String>>,
    events: broadcast::Sender<StorageEvent>,
    quota_bytes: Option<usize>,
    available: AtomicBool,
}

impl MemoryMedium {
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    pub fn with_quota(quota_bytes: usize) -> Arc<Self> {
        Self::build(Some(quota_bytes))
    }

    fn build(quota_bytes: Option<usize>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            records: Mutex::new(HashMap::new()),
            events,
            quota_bytes,
            available: AtomicBool::new(true),
        })
    }

    /// Opens a new context on this medium.
    pub fn context(self: &Arc<Self>) -> MemoryStorage {
        MemoryStorage {
            medium: self.clone(),
            context: ContextId::new(),
        }
    }

    /// Switches the medium between working and unavailable, as when a user
    /// blocks site storage.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Returns the raw record, regardless of availability.
    pub fn peek(&self, key: &str) -> Option<String> {
        self.records().get(key).cloned()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_available(&self) -> Result<(), StorageError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StorageError::Unavailable("memory medium is blocked".into()))
        }
    }

    fn publish(&self, event: StorageEvent) {
        // No receivers just means nobody is listening yet.
        let _ = self.events.send(event);
    }
}

/// One context's handle onto a [`MemoryMedium`].
pub struct MemoryStorage {
    medium: Arc<MemoryMedium>,
    context: ContextId,
}

impl MemoryStorage {
    /// A handle on a fresh, private medium.
    pub fn new() -> Self {
        MemoryMedium::new().context()
    }

    pub fn from_config(config: &MemoryStorageConfig) -> Self {
        match config.quota_bytes {
            Some(quota) => MemoryMedium::with_quota(quota).context(),
            None => Self::new(),
        }
    }

    pub fn medium(&self) -> &Arc<MemoryMedium> {
        &self.medium
    }

    /// Deletes a record, notifying the other contexts.
    pub fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.medium.ensure_available()?;
        let old_value = self.medium.records().remove(key);
        if old_value.is_some() {
            self.medium.publish(StorageEvent {
                key: Some(key.to_string()),
                old_value,
                new_value: None,
                origin: self.context,
            });
        }
        Ok(())
    }

    /// Deletes every record, notifying the other contexts once.
    pub fn clear(&self) -> Result<(), StorageError> {
        self.medium.ensure_available()?;
        let had_records = {
            let mut records = self.medium.records();
            let had_records = !records.is_empty();
            records.clear();
            had_records
        };
        if had_records {
            self.medium.publish(StorageEvent {
                key: None,
                old_value: None,
                new_value: None,
                origin: self.context,
            });
        }
        Ok(())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Persistence for MemoryStorage {
    fn read(&self, key: &str) -> Option<String> {
        if !self.medium.is_available() {
            return None;
        }
        self.medium.peek(key)
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.medium.ensure_available()?;

        let old_value = {
            let mut records = self.medium.records();
            if let Some(quota) = self.medium.quota_bytes {
                let others: usize = records
                    .iter()
                    .filter(|(k, _)| k.as_str() != key)
                    .map(|(k, v)| k.len() + v.len())
                    .sum();
                let needed = others + key.len() + value.len();
                if needed > quota {
                    return Err(StorageError::QuotaExceeded {
                        key: key.to_string(),
                        needed,
                        quota,
                    });
                }
            }
            records.insert(key.to_string(), value.to_string())
        };

        if old_value.as_deref() == Some(value) {
            debug!(key, "Value unchanged, no change event raised");
            return Ok(());
        }

        self.medium.publish(StorageEvent {
            key: Some(key.to_string()),
            old_value,
            new_value: Some(value.to_string()),
            origin: self.context,
        });
        Ok(())
    }
}

impl ChangeSource for MemoryStorage {
    fn context(&self) -> ContextId {
        self.context
    }

    fn changes(&self) -> broadcast::Receiver<StorageEvent> {
        self.medium.events.subscribe()
    }
}
