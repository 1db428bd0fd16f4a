use std::collections::HashMap;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{ChangeSource, ContextId, Persistence, StorageEvent};
use crate::error::StorageError;
use crate::utils::log_throttle::should_emit;

const EVENT_CAPACITY: usize = 64;
const READ_FAILURE_LOG_WINDOW: Duration = Duration::from_secs(60);

fn default_poll_interval_ms() -> u64 {
    500
}

/// The config struct for file storage.
#[derive(Deserialize, Serialize, JsonSchema, Debug, Clone)]
pub struct FileStorageConfig {
    /// Directory holding one file per key.
    pub path: PathBuf,
    /// How often other processes' writes are looked for.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// A `Persistence` implementation keeping each record in its own file.
///
/// Every process opening the same directory is a separate context. Changes
/// made by other processes are discovered by polling the files of the keys
/// this handle has read or written.
pub struct FileStorage {
    shared: Arc<FileShared>,
}

struct FileShared {
    root: PathBuf,
    context: ContextId,
    poll_interval: Duration,
    /// Last content seen or written per key. Guards all file I/O so that a
    /// scan never reports this handle's own writes.
    known: Mutex<HashMap<String, Option<String>>>,
    events: broadcast::Sender<StorageEvent>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Maps a key onto a file name that cannot escape the root directory.
fn file_name_for(key: &str) -> String {
    let mut name = String::with_capacity(key.len() + 6);
    for byte in key.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' => name.push(byte as char),
            other => name.push_str(&format!("_{:02x}", other)),
        }
    }
    name.push_str(".value");
    name
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(FileShared {
                root: root.into(),
                context: ContextId::new(),
                poll_interval,
                known: Mutex::new(HashMap::new()),
                events,
                poller: Mutex::new(None),
            }),
        }
    }

    pub fn from_config(config: &FileStorageConfig) -> Self {
        Self::new(
            config.path.clone(),
            Duration::from_millis(config.poll_interval_ms.max(1)),
        )
    }

    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    /// Checks the watched files once and publishes any change found.
    pub fn poll_now(&self) {
        for event in self.shared.scan() {
            let _ = self.shared.events.send(event);
        }
    }

    fn ensure_poller(&self) {
        let mut poller = lock(&self.shared.poller);
        if poller.is_some() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let weak = Arc::downgrade(&self.shared);
                *poller = Some(handle.spawn(poll_loop(weak, self.shared.poll_interval)));
                debug!(
                    root = %self.shared.root.display(),
                    interval_ms = self.shared.poll_interval.as_millis() as u64,
                    "Started file change poller"
                );
            }
            Err(_) => {
                warn!(
                    event_name = "storage.file.poller.unavailable",
                    event_domain = "storage",
                    root = %self.shared.root.display(),
                    "No tokio runtime; changes by other processes will not be observed"
                );
            }
        }
    }
}

impl FileShared {
    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(file_name_for(key))
    }

    fn read_file(&self, key: &str) -> Option<String> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(content) => Some(content),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                let throttle_key = format!("storage.file.read_failed.{}", key);
                if let Some(suppressed_count) =
                    should_emit(&throttle_key, READ_FAILURE_LOG_WINDOW)
                {
                    warn!(
                        event_name = "storage.file.read_failed",
                        event_domain = "storage",
                        key,
                        error = %e,
                        suppressed_count,
                        "Could not read stored record, treating it as absent"
                    );
                }
                None
            }
        }
    }

    fn write_file(&self, key: &str, value: &str) -> io::Result<()> {
        fs::create_dir_all(&self.root)?;
        let tmp_path = self
            .root
            .join(format!(".{}.{}.tmp", file_name_for(key), self.context));
        fs::write(&tmp_path, value)?;
        if let Err(e) = fs::rename(&tmp_path, self.path_for(key)) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
        Ok(())
    }

    /// Compares every watched file against what was last seen.
    fn scan(&self) -> Vec<StorageEvent> {
        let mut known = lock(&self.known);
        let keys: Vec<String> = known.keys().cloned().collect();
        let mut events = Vec::new();
        for key in keys {
            let current = self.read_file(&key);
            let previous = known.insert(key.clone(), current.clone()).flatten();
            if previous != current {
                events.push(StorageEvent {
                    key: Some(key),
                    old_value: previous,
                    new_value: current,
                    origin: ContextId::unknown(),
                });
            }
        }
        events
    }
}

impl Drop for FileShared {
    fn drop(&mut self) {
        if let Some(poller) = lock(&self.poller).take() {
            poller.abort();
        }
    }
}

async fn poll_loop(shared: Weak<FileShared>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(strong) = shared.upgrade() else {
            break;
        };
        let scanned = tokio::task::spawn_blocking(move || {
            let events = strong.scan();
            (strong, events)
        })
        .await;
        match scanned {
            Ok((strong, events)) => {
                for event in events {
                    let _ = strong.events.send(event);
                }
            }
            Err(e) => {
                warn!(error = %e, "File change scan did not complete");
            }
        }
    }
}

impl Persistence for FileStorage {
    fn read(&self, key: &str) -> Option<String> {
        let mut known = lock(&self.shared.known);
        let value = self.shared.read_file(key);
        known.insert(key.to_string(), value.clone());
        value
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut known = lock(&self.shared.known);
        match self.shared.write_file(key, value) {
            Ok(()) => {
                known.insert(key.to_string(), Some(value.to_string()));
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                Err(StorageError::Unavailable(format!(
                    "{}: {}",
                    self.shared.root.display(),
                    e
                )))
            }
            Err(e) => Err(StorageError::WriteFailed {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

impl ChangeSource for FileStorage {
    fn context(&self) -> ContextId {
        self.shared.context
    }

    fn changes(&self) -> broadcast::Receiver<StorageEvent> {
        let rx = self.shared.events.subscribe();
        self.ensure_poller();
        rx
    }
}
