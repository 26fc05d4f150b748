//! Resumable transfer client
//!
//! Uploads are cut into fixed-size chunks and sent one at a time; a chunk
//! that fails in transit is resent at the same offset. Downloads resume from
//! the last byte written to the sink.

mod download;
mod error;
mod upload;

use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{redirect, Url};

pub use download::Downloader;
pub use error::ClientError;
pub use upload::Uploader;

/// Default chunk size: 1 MiB
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Size of every non-final upload chunk
    pub chunk_size: usize,

    /// Retries per chunk (or per download stretch) after the first attempt
    pub max_retries: u32,

    /// Fixed pause between attempts
    pub retry_delay: Duration,

    /// Timeout for a single request
    pub request_timeout: Duration,

    /// Sent with every request, e.g. an identity header or session cookie
    pub headers: HeaderMap,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: 3,
            retry_delay: Duration::from_secs(3),
            request_timeout: Duration::from_secs(300),
            headers: HeaderMap::new(),
        }
    }
}

/// HTTP client bound to one server
#[derive(Debug, Clone)]
pub struct TransferClient {
    http: reqwest::Client,
    base: Url,
    config: ClientConfig,
}

impl TransferClient {
    /// Create a client for the server at `base_url` (including the app root)
    pub fn new(base_url: &str, config: ClientConfig) -> Result<Self, ClientError> {
        let mut base = Url::parse(base_url)
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {}", base_url, e)))?;

        // Url::join replaces the last segment unless the path ends in '/'
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        if config.chunk_size == 0 {
            return Err(ClientError::Protocol("chunk size must be positive".to_string()));
        }

        let http = reqwest::Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(config.request_timeout)
            .default_headers(config.headers.clone())
            .build()?;

        Ok(Self { http, base, config })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Start a new upload
    pub fn uploader(&self) -> Uploader<'_> {
        Uploader::new(self)
    }

    /// Start a new download
    pub fn downloader(&self) -> Downloader<'_> {
        Downloader::new(self)
    }

    /// Resolve a path or URL handed out by the server
    pub(crate) fn resolve(&self, location: &str) -> Result<Url, ClientError> {
        self.base
            .join(location)
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {}", location, e)))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::net::SocketAddr;
    use std::time::Duration;

    use axum::Router;
    use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    use super::ClientConfig;
    use crate::auth;
    use crate::config::Config;
    use crate::identity::IdentityHasher;
    use crate::state::AppState;

    pub struct RunningServer {
        pub addr: SocketAddr,
        pub state: AppState,
        pub owner_id: String,
        _dir: TempDir,
    }

    impl RunningServer {
        pub fn url(&self) -> String {
            format!("http://{}/", self.addr)
        }
    }

    /// Serve the real router on a loopback port, authenticating through the
    /// proxy header
    pub async fn spawn_server() -> RunningServer {
        spawn_server_with(|router| router).await
    }

    /// Like `spawn_server`, with extra layers wrapped around the router
    pub async fn spawn_server_with<F>(wrap: F) -> RunningServer
    where
        F: FnOnce(Router) -> Router,
    {
        let dir = TempDir::new().unwrap();

        let mut config = Config::default();
        config.storage.state_dir = dir.path().to_path_buf();

        let hasher = IdentityHasher::from_key([9u8; 32]);
        let owner_id = hasher.pseudonymize("alice");
        let authenticator = auth::from_config(&config.auth);
        let state = AppState::new(config, hasher, authenticator);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = wrap(crate::routes::app(state.clone()));

        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        RunningServer {
            addr,
            state,
            owner_id,
            _dir: dir,
        }
    }

    /// Client settings for tests: small chunks, fast retries, alice's header
    pub fn client_config(chunk_size: usize) -> ClientConfig {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-remote-user"),
            HeaderValue::from_static("alice"),
        );

        ClientConfig {
            chunk_size,
            retry_delay: Duration::from_millis(10),
            request_timeout: Duration::from_secs(10),
            headers,
            ..Default::default()
        }
    }
}
