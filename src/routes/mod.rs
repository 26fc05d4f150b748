//! Route modules for the Filesender server

pub mod download;
pub mod health;
pub mod upload;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the full application router, mounted under the configured app root
pub fn app(state: AppState) -> Router {
    let api = Router::new()
        .merge(upload::router(&state))
        .merge(download::router())
        .nest("/health", health::router());

    let root = state.config().server.app_root.trim_end_matches('/').to_string();
    let router = if root.is_empty() {
        api
    } else {
        Router::new().nest(&root, api)
    };

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use axum_test::TestServer;
    use tempfile::TempDir;

    use crate::auth;
    use crate::config::{AuthMethod, Config};
    use crate::identity::IdentityHasher;
    use crate::state::AppState;

    pub const TEST_KEY: [u8; 32] = [42u8; 32];

    pub struct TestApp {
        pub server: TestServer,
        pub state: AppState,
        /// Owner ID of the development identity
        pub owner_id: String,
        _dir: TempDir,
    }

    /// Spin up the router over a fresh state directory
    pub fn test_server(method: AuthMethod, configure: impl FnOnce(&mut Config)) -> TestApp {
        let dir = TempDir::new().unwrap();

        let mut config = Config::default();
        config.storage.state_dir = dir.path().to_path_buf();
        config.auth.method = method;
        configure(&mut config);

        let hasher = IdentityHasher::from_key(TEST_KEY);
        let owner_id = hasher.pseudonymize("dev");
        let authenticator = auth::from_config(&config.auth);
        let state = AppState::new(config, hasher, authenticator);

        let server = TestServer::new(super::app(state.clone())).unwrap();

        TestApp {
            server,
            state,
            owner_id,
            _dir: dir,
        }
    }
}
