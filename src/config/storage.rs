use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use crate::storage::file_storage::FileStorageConfig;
pub use crate::storage::memory_storage::MemoryStorageConfig;

fn default_true() -> bool {
    true
}

/// A wrapper for the storage configuration:
/// - enabled: if false, storage is effectively disabled (NoStorage).
/// - cross_context_sync: if false, changes by other contexts are not followed.
/// - backend: the actual storage backend (file, memory).
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct StorageConfig {
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub cross_context_sync: bool,
    #[serde(flatten)]
    pub backend: Option<StorageBackend>,
}

/// The existing storage backends. We differentiate them via a "type" tag in the YAML.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
#[serde(tag = "type")]
pub enum StorageBackend {
    #[serde(rename = "memory")]
    Memory(MemoryStorageConfig),
    #[serde(rename = "file")]
    File(FileStorageConfig),
}
