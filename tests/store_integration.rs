mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{load_test_config, recorder, settle, wait_until};
use serde::{Deserialize, Serialize};
use tokenkeeper::codec::JsonCodec;
use tokenkeeper::error::StorageError;
use tokenkeeper::state::AppContext;
use tokenkeeper::storage::{Backend, ChangeSource, MemoryMedium, MemoryStorage, Persistence};
use tokenkeeper::store::{PersistedStore, TokenStore};

fn backend_for(storage: MemoryStorage) -> Backend {
    let storage = Arc::new(storage);
    Backend::new(storage.clone(), storage)
}

fn token_store(storage: MemoryStorage) -> TokenStore {
    TokenStore::token("authHeader", "", &backend_for(storage))
}

/// Wraps a context handle and counts the writes going through it.
struct CountingStorage {
    inner: MemoryStorage,
    writes: AtomicUsize,
}

impl Persistence for CountingStorage {
    fn read(&self, key: &str) -> Option<String> {
        self.inner.read(key)
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write(key, value)
    }
}

impl ChangeSource for CountingStorage {
    fn context(&self) -> tokenkeeper::storage::ContextId {
        self.inner.context()
    }

    fn changes(&self) -> tokio::sync::broadcast::Receiver<tokenkeeper::storage::StorageEvent> {
        self.inner.changes()
    }
}

/// Empty backing store yields the empty token.
#[tokio::test]
async fn test_empty_store_returns_empty_token() {
    let store = token_store(MemoryStorage::new());
    assert_eq!(store.get(), "");
}

/// A set is written through and survives a "reload".
#[tokio::test]
async fn test_set_persists_across_reload() {
    let medium = MemoryMedium::new();
    let store = token_store(medium.context());

    store.set("Bearer abc123".to_string());
    assert_eq!(medium.peek("authHeader").as_deref(), Some("Bearer abc123"));
    assert_eq!(store.get(), "Bearer abc123");

    store.dispose();
    drop(store);

    let reloaded = token_store(medium.context());
    assert_eq!(reloaded.get(), "Bearer abc123");
}

/// A write from another context reaches local subscribers.
#[tokio::test]
async fn test_external_write_reaches_subscribers() {
    let medium = MemoryMedium::new();
    let store = token_store(medium.context());
    let (seen, callback) = recorder::<String>();
    let _handle = store.subscribe(callback);

    let other_tab = medium.context();
    other_tab.write("authHeader", "Bearer xyz").unwrap();

    wait_until(|| store.get() == "Bearer xyz").await;
    assert_eq!(*seen.lock().unwrap(), vec!["", "Bearer xyz"]);
}

/// A blocked medium still leaves a working in-memory store.
#[tokio::test]
async fn test_blocked_medium_keeps_working_in_memory() {
    let medium = MemoryMedium::new();
    let store = token_store(medium.context());
    medium.set_available(false);

    store.set("token".to_string());
    assert_eq!(store.get(), "token");

    medium.set_available(true);
    let reloaded = token_store(medium.context());
    assert_eq!(reloaded.get(), "");
}

/// Taking over another context's value never writes.
#[tokio::test]
async fn test_external_change_does_not_write() {
    let medium = MemoryMedium::new();
    let counting = Arc::new(CountingStorage {
        inner: medium.context(),
        writes: AtomicUsize::new(0),
    });
    let backend = Backend::new(counting.clone(), counting.clone());
    let store = TokenStore::token("authHeader", "", &backend);
    let writes_before = counting.writes.load(Ordering::SeqCst);

    medium.context().write("authHeader", "Bearer v2").unwrap();
    wait_until(|| store.get() == "Bearer v2").await;
    settle().await;

    assert_eq!(counting.writes.load(Ordering::SeqCst), writes_before);
}

/// Two live stores converge without echoing each other's writes.
#[tokio::test]
async fn test_two_contexts_converge_without_loops() {
    let medium = MemoryMedium::new();
    let tab_a = token_store(medium.context());
    let tab_b = token_store(medium.context());
    let (seen_a, callback_a) = recorder::<String>();
    let (seen_b, callback_b) = recorder::<String>();
    let _a = tab_a.subscribe(callback_a);
    let _b = tab_b.subscribe(callback_b);

    let observer = medium.context();
    let mut events = observer.changes();

    tab_a.set("Bearer one".to_string());
    wait_until(|| tab_b.get() == "Bearer one").await;
    settle().await;

    // Only tab A's own write hit the medium.
    assert!(events.try_recv().is_ok());
    assert!(events.try_recv().is_err());

    assert_eq!(*seen_a.lock().unwrap(), vec!["", "Bearer one"]);
    assert_eq!(*seen_b.lock().unwrap(), vec!["", "Bearer one"]);

    tab_b.set(String::new());
    wait_until(|| tab_a.get().is_empty()).await;
    settle().await;
    assert_eq!(*seen_a.lock().unwrap(), vec!["", "Bearer one", ""]);
}

/// Removing the record elsewhere logs this context out.
#[tokio::test]
async fn test_external_removal_resets_to_initial() {
    let medium = MemoryMedium::new();
    let store = token_store(medium.context());
    store.set("Bearer abc".to_string());

    medium.context().remove("authHeader").unwrap();
    wait_until(|| store.get().is_empty()).await;
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
struct Session {
    user: String,
    roles: Vec<String>,
}

/// Garbage written by another context is ignored.
#[tokio::test]
async fn test_undecodable_external_write_is_ignored() {
    let medium = MemoryMedium::new();
    let backend = backend_for(medium.context());
    let initial = Session {
        user: String::new(),
        roles: vec![],
    };
    let store = PersistedStore::open(
        "session",
        initial,
        &backend,
        Arc::new(JsonCodec::<Session>::new()),
    );
    let adam = Session {
        user: "adam".to_string(),
        roles: vec!["admin".to_string()],
    };
    store.set(adam.clone());
    let (seen, callback) = recorder::<Session>();
    let _handle = store.subscribe(callback);

    let other_tab = medium.context();
    other_tab.write("session", "{not json").unwrap();
    other_tab.write("unrelated", "whatever").unwrap();
    settle().await;

    assert_eq!(store.get(), adam);
    assert_eq!(seen.lock().unwrap().len(), 1);

    let eve = Session {
        user: "eve".to_string(),
        roles: vec![],
    };
    other_tab
        .write("session", &serde_json::to_string(&eve).unwrap())
        .unwrap();
    wait_until(|| store.get() == eve).await;
}

/// Missed events are recovered by re-reading the record.
#[tokio::test]
async fn test_lagged_listener_resyncs() {
    let medium = MemoryMedium::new();
    let store = token_store(medium.context());
    let other_tab = medium.context();

    // The listener cannot run until we yield, so the channel overflows.
    for i in 0..200 {
        other_tab
            .write("authHeader", &format!("Bearer {}", i))
            .unwrap();
    }

    wait_until(|| store.get() == "Bearer 199").await;
}

/// After dispose the store no longer follows other contexts.
#[tokio::test]
async fn test_dispose_stops_sync() {
    let medium = MemoryMedium::new();
    let store = token_store(medium.context());
    assert!(store.is_syncing());

    store.dispose();
    assert!(!store.is_syncing());

    medium.context().write("authHeader", "Bearer late").unwrap();
    settle().await;
    assert_eq!(store.get(), "");

    store.set("still works".to_string());
    assert_eq!(store.get(), "still works");
}

const FILE_CONFIG: &str = r#"
version: "1.0.0"
storage:
  enabled: true
  type: file
  path: "{path}"
  poll_interval_ms: 10
"#;

/// Two processes sharing a directory follow each other's writes.
#[tokio::test]
async fn test_file_backend_across_contexts() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = FILE_CONFIG.replace("{path}", dir.path().to_str().unwrap());
    let config = Arc::new(load_test_config(&yaml));

    let first = AppContext::new(config.clone());
    assert_eq!(first.authorization_header(), None);
    let (seen, callback) = recorder::<String>();
    let _handle = first.auth_header.subscribe(callback);

    let second = AppContext::new(config.clone());
    second.auth_header.set("Bearer xyz".to_string());

    wait_until(|| first.auth_header.get() == "Bearer xyz").await;
    assert_eq!(first.authorization_header().as_deref(), Some("Bearer xyz"));

    first.auth_header.set("Bearer from-first".to_string());
    wait_until(|| second.auth_header.get() == "Bearer from-first").await;
    settle().await;

    // The first context never hears its own write back.
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["", "Bearer xyz", "Bearer from-first"]
    );

    first.shutdown();
    second.shutdown();

    let reloaded = AppContext::new(config);
    assert_eq!(reloaded.auth_header.get(), "Bearer from-first");
}

/// Disabled storage still gives a working, memory-only token.
#[tokio::test]
async fn test_disabled_storage_context() {
    let config = Arc::new(load_test_config(
        r#"
version: "1.0.0"
storage:
  enabled: false
token:
  key: session
"#,
    ));
    let context = AppContext::new(config);
    assert_eq!(context.auth_header.key(), "session");

    context.auth_header.set("Bearer mem".to_string());
    assert_eq!(context.authorization_header().as_deref(), Some("Bearer mem"));
    context.auth_header.set(String::new());
    assert_eq!(context.authorization_header(), None);
}
