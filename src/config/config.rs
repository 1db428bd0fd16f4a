use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};

use super::logging::LoggingConfig;
use super::storage::StorageConfig;
use crate::error::ConfigError;

/// Environment variable naming an alternative config file.
pub const CONFIG_PATH_ENV: &str = "TOKENKEEPER_CONFIG";
/// Prefix for environment overrides, e.g. `TOKENKEEPER_TOKEN__KEY=session`.
pub const ENV_PREFIX: &str = "TOKENKEEPER_";

/// A top-level enum for versioned configurations.
#[derive(Deserialize, Serialize, JsonSchema)]
#[serde(tag = "version")]
pub enum Config {
    #[serde(rename = "1.0.0")]
    ConfigV1(ConfigV1),
}

/// Main config for v1.0.0, containing logging, storage and the token record.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct ConfigV1 {
    #[serde(default)]
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub token: TokenConfig,
}

fn default_token_key() -> String {
    "authHeader".to_string()
}

/// The record holding the authorization header value.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct TokenConfig {
    /// Backing key of the record.
    #[serde(default = "default_token_key")]
    pub key: String,
    /// Value used when nothing valid is stored; the empty string means "logged out".
    #[serde(default)]
    pub initial: String,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            key: default_token_key(),
            initial: String::new(),
        }
    }
}

/// The YAML file (from `TOKENKEEPER_CONFIG`, default "./config.yaml")
/// overlaid with `TOKENKEEPER_`-prefixed environment variables.
pub fn default_figment() -> Figment {
    let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "./config.yaml".to_string());
    Figment::new()
        .merge(Yaml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Extract a configuration from any figment.
pub fn load_config_from(figment: Figment) -> Result<ConfigV1, ConfigError> {
    match figment.extract::<Config>()? {
        Config::ConfigV1(c) => Ok(c),
    }
}

/// Load the configuration, exiting the process if it is invalid.
pub fn load_config() -> ConfigV1 {
    match load_config_from(default_figment()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}

/// Print the JSON schema for the configuration to stdout.
pub fn print_schema() {
    let schema = schema_for!(Config);
    match serde_json::to_string_pretty(&schema) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to render schema: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemoryStorageConfig, StorageBackend};

    fn parse(yaml: &str) -> Result<ConfigV1, ConfigError> {
        load_config_from(Figment::new().merge(Yaml::string(yaml)))
    }

    /// Test a full file-backed configuration.
    #[test]
    fn test_parse_file_config() {
        let config = parse(
            r#"
version: "1.0.0"
logging:
  level: debug
  format: json
storage:
  enabled: true
  type: file
  path: /tmp/tokenkeeper
  poll_interval_ms: 250
token:
  key: session
  initial: anonymous
"#,
        )
        .unwrap();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.service_name, "tokenkeeper");
        assert!(config.storage.enabled);
        assert!(config.storage.cross_context_sync);
        match config.storage.backend {
            Some(StorageBackend::File(file)) => {
                assert_eq!(file.path.to_str(), Some("/tmp/tokenkeeper"));
                assert_eq!(file.poll_interval_ms, 250);
            }
            other => panic!("expected file backend, got {:?}", other),
        }
        assert_eq!(config.token.key, "session");
        assert_eq!(config.token.initial, "anonymous");
    }

    /// Test that omitted sections fall back to the authHeader defaults.
    #[test]
    fn test_parse_minimal_config() {
        let config = parse(
            r#"
version: "1.0.0"
storage:
  enabled: true
  cross_context_sync: false
  type: memory
"#,
        )
        .unwrap();

        assert_eq!(config.token.key, "authHeader");
        assert_eq!(config.token.initial, "");
        assert_eq!(config.logging.level, "info");
        assert!(!config.storage.cross_context_sync);
        assert!(matches!(
            config.storage.backend,
            Some(StorageBackend::Memory(MemoryStorageConfig { quota_bytes: None }))
        ));
    }

    /// Disabled storage needs no backend.
    #[test]
    fn test_parse_disabled_storage() {
        let config = parse(
            r#"
version: "1.0.0"
storage:
  enabled: false
"#,
        )
        .unwrap();
        assert!(!config.storage.enabled);
        assert!(config.storage.backend.is_none());
    }

    /// Unknown versions are rejected.
    #[test]
    fn test_parse_unknown_version() {
        let res = parse(
            r#"
version: "9.9.9"
storage:
  enabled: false
"#,
        );
        assert!(res.is_err());
    }

    /// Environment variables override the file.
    #[test]
    fn test_env_override() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "config.yaml",
                r#"
version: "1.0.0"
storage:
  enabled: false
"#,
            )?;
            jail.set_env("TOKENKEEPER_TOKEN__KEY", "otherHeader");
            let config = load_config_from(default_figment()).map_err(|e| e.to_string())?;
            assert_eq!(config.token.key, "otherHeader");
            Ok(())
        });
    }
}
