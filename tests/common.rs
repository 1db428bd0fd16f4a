#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use figment::{
    providers::{Format, Yaml},
    Figment,
};
use tokenkeeper::config::{load_config_from, ConfigV1};

/// Parses a YAML test configuration.
pub fn load_test_config(yaml: &str) -> ConfigV1 {
    load_config_from(Figment::new().merge(Yaml::string(yaml)))
        .expect("Failed to parse test config YAML")
}

/// Collects every value a subscriber receives.
pub fn recorder<T: Clone + Send + 'static>(
) -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |value: &T| sink.lock().unwrap().push(value.clone()))
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Lets spawned tasks drain whatever they have queued.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}
