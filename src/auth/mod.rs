//! Pluggable authentication
//!
//! The protocol code only knows the [`Authenticator`] contract: hand it the
//! request head, get back an external identity or an error. Which concrete
//! provider runs is decided once at startup.

mod providers;

use std::net::IpAddr;
use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderName;

use crate::config::{AuthConfig, AuthMethod};
use crate::error::AppError;
use crate::state::AppState;

pub use providers::{CookieAuth, FixedAuth, ProxyAuth};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("HTTP header {0} is not set")]
    MissingHeader(String),

    #[error("Peer {0} is not a trusted proxy")]
    UntrustedPeer(IpAddr),

    #[error("Peer address is unknown")]
    MissingPeerAddress,

    #[error("Cookie {0} is not set")]
    MissingCookie(String),
}

/// Resolves the external identity of a request
pub trait Authenticator: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    fn authenticate(&self, parts: &Parts) -> Result<String, AuthError>;
}

/// Build the configured authenticator
pub fn from_config(config: &AuthConfig) -> Arc<dyn Authenticator> {
    match config.method {
        AuthMethod::Proxy => {
            let header = HeaderName::try_from(config.header.as_str()).unwrap_or_else(|_| {
                tracing::warn!(header = %config.header, "Invalid auth header name, using X-Remote-User");
                HeaderName::from_static("x-remote-user")
            });
            Arc::new(ProxyAuth::new(header))
        }
        AuthMethod::Cookie => Arc::new(CookieAuth::default()),
        AuthMethod::Dummy => Arc::new(FixedAuth::default()),
    }
}

/// An authenticated caller, identified only by its pseudonymous owner ID.
///
/// Extracting this re-runs authentication and pseudonymization on every
/// request; nothing about the caller is cached between requests.
#[derive(Debug, Clone)]
pub struct Caller {
    pub owner_id: String,
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let authenticator = state.authenticator();

        let external_id = authenticator.authenticate(parts).map_err(|e| {
            tracing::info!(method = authenticator.name(), error = %e, "Unable to authenticate user");
            AppError::Unauthorized("You're not authenticated".to_string())
        })?;

        let owner_id = state.hasher().pseudonymize(&external_id);
        tracing::debug!(owner_id = %owner_id, "User authenticated");

        Ok(Caller { owner_id })
    }
}
