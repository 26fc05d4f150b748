//! Application state management

use std::sync::Arc;

use crate::auth::Authenticator;
use crate::config::Config;
use crate::identity::IdentityHasher;
use crate::storage::FileStore;

/// Shared application state.
///
/// Everything in here is read-only once the server is running.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    hasher: IdentityHasher,
    store: FileStore,
    authenticator: Arc<dyn Authenticator>,
}

impl AppState {
    /// Create a new application state
    pub fn new(config: Config, hasher: IdentityHasher, authenticator: Arc<dyn Authenticator>) -> Self {
        let store = FileStore::new(config.storage.state_dir.clone());

        tracing::info!(
            state_dir = %config.storage.state_dir.display(),
            auth = authenticator.name(),
            max_upload_size = config.upload.max_upload_size,
            "Application state initialized"
        );

        Self {
            inner: Arc::new(AppStateInner {
                config,
                hasher,
                store,
                authenticator,
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the identity hasher
    pub fn hasher(&self) -> &IdentityHasher {
        &self.inner.hasher
    }

    /// Get the file store
    pub fn store(&self) -> &FileStore {
        &self.inner.store
    }

    pub fn authenticator(&self) -> &dyn Authenticator {
        self.inner.authenticator.as_ref()
    }
}
