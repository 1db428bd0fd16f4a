//! Shared application context.
//!
//! Consumers receive the token store through this object instead of a
//! process-wide global, so tests can build isolated instances.

use std::sync::Arc;

use crate::config::ConfigV1;
use crate::storage::{create_backend, Backend};
use crate::store::TokenStore;

/// Everything a consumer of the authorization token needs.
#[derive(Clone)]
pub struct AppContext {
    /// Application configuration loaded at startup.
    pub config: Arc<ConfigV1>,
    /// The storage medium and its change feed.
    pub backend: Backend,
    /// The persisted authorization header; empty when logged out.
    pub auth_header: TokenStore,
}

impl AppContext {
    /// Builds the backend from config and opens the token store on it.
    pub fn new(config: Arc<ConfigV1>) -> Self {
        let backend = create_backend(&config.storage);
        Self::with_backend(config, backend)
    }

    /// Opens the token store on an already constructed backend.
    pub fn with_backend(config: Arc<ConfigV1>, backend: Backend) -> Self {
        let auth_header = TokenStore::token(
            config.token.key.clone(),
            config.token.initial.clone(),
            &backend,
        );
        Self {
            config,
            backend,
            auth_header,
        }
    }

    /// The value for an outgoing `Authorization` header, if logged in.
    pub fn authorization_header(&self) -> Option<String> {
        let value = self.auth_header.get();
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }

    /// Releases the store's listener and subscribers.
    pub fn shutdown(&self) {
        self.auth_header.dispose();
    }
}
