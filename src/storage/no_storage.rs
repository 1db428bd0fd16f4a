use tokio::sync::broadcast;

use super::{ChangeSource, ContextId, Persistence, StorageEvent};
use crate::error::StorageError;

/// A no-op medium: nothing is ever found and every write fails,
/// indicating storage is disabled.
pub struct NoStorage;

impl NoStorage {
    pub fn new() -> Self {
        NoStorage
    }
}

impl Default for NoStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Persistence for NoStorage {
    fn read(&self, _key: &str) -> Option<String> {
        None
    }

    fn write(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
        Err(StorageError::Unavailable("storage is disabled".into()))
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

/// Change feed for single-context deployments: it never fires.
pub struct NoChangeSource {
    context: ContextId,
}

impl NoChangeSource {
    pub fn new() -> Self {
        Self {
            context: ContextId::new(),
        }
    }
}

impl Default for NoChangeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeSource for NoChangeSource {
    fn context(&self) -> ContextId {
        self.context
    }

    fn changes(&self) -> broadcast::Receiver<StorageEvent> {
        // Dropping the only sender closes the receiver straight away.
        let (_tx, rx) = broadcast::channel(1);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_storage_read_is_absent() {
        let storage = NoStorage::new();
        assert_eq!(storage.read("authHeader"), None);
    }

    #[test]
    fn test_no_storage_write_fails() {
        let storage = NoStorage::new();
        let res = storage.write("authHeader", "Bearer abc");
        assert!(matches!(res, Err(StorageError::Unavailable(_))));
        assert!(!storage.is_enabled());
    }

    #[tokio::test]
    async fn test_no_change_source_is_closed() {
        let mut rx = NoChangeSource::new().changes();
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
