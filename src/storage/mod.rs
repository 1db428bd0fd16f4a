pub mod base;
pub mod file_storage;
pub mod memory_storage;
pub mod no_storage;

// Re-export the primary storage items so code outside can do
// "use crate::storage::{Persistence, create_backend};"
pub use base::{create_backend, Backend, ChangeSource, ContextId, Persistence, StorageEvent};
pub use file_storage::{FileStorage, FileStorageConfig};
pub use memory_storage::{MemoryMedium, MemoryStorage, MemoryStorageConfig};
pub use no_storage::{NoChangeSource, NoStorage};
