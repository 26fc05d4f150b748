//! Authenticator implementations

use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use axum::http::header::COOKIE;
use axum::http::request::Parts;
use axum::http::HeaderName;

use super::{AuthError, Authenticator};

/// Trusts an identity header set by a reverse proxy on the same host.
///
/// The header is only honoured when the TCP peer is a loopback address, so
/// a remote caller cannot forge it by talking to the server directly.
#[derive(Debug, Clone)]
pub struct ProxyAuth {
    header: HeaderName,
}

impl ProxyAuth {
    pub fn new(header: HeaderName) -> Self {
        Self { header }
    }
}

impl Default for ProxyAuth {
    fn default() -> Self {
        Self::new(HeaderName::from_static("x-remote-user"))
    }
}

impl Authenticator for ProxyAuth {
    fn name(&self) -> &'static str {
        "proxy"
    }

    fn authenticate(&self, parts: &Parts) -> Result<String, AuthError> {
        let ConnectInfo(peer) = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .ok_or(AuthError::MissingPeerAddress)?;

        if !peer.ip().is_loopback() {
            return Err(AuthError::UntrustedPeer(peer.ip()));
        }

        parts
            .headers
            .get(&self.header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| AuthError::MissingHeader(self.header.to_string()))
    }
}

/// Reads the identity from a session cookie
#[derive(Debug, Clone)]
pub struct CookieAuth {
    cookie_name: String,
}

impl CookieAuth {
    pub fn new(cookie_name: impl Into<String>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
        }
    }
}

impl Default for CookieAuth {
    fn default() -> Self {
        Self::new("session")
    }
}

impl Authenticator for CookieAuth {
    fn name(&self) -> &'static str {
        "cookie"
    }

    fn authenticate(&self, parts: &Parts) -> Result<String, AuthError> {
        parts
            .headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == self.cookie_name)
            .map(|(_, value)| value.trim())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or_else(|| AuthError::MissingCookie(self.cookie_name.clone()))
    }
}

/// Hands out one hardcoded identity. Development and testing only.
#[derive(Debug, Clone)]
pub struct FixedAuth {
    identity: String,
}

impl FixedAuth {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
        }
    }
}

impl Default for FixedAuth {
    fn default() -> Self {
        Self::new("dev")
    }
}

impl Authenticator for FixedAuth {
    fn name(&self) -> &'static str {
        "dummy"
    }

    fn authenticate(&self, _parts: &Parts) -> Result<String, AuthError> {
        Ok(self.identity.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(builder: axum::http::request::Builder) -> Parts {
        builder.body(()).unwrap().into_parts().0
    }

    fn from_peer(addr: &str) -> axum::http::request::Builder {
        let addr: SocketAddr = addr.parse().unwrap();
        Request::builder().extension(ConnectInfo(addr))
    }

    #[test]
    fn test_fixed_auth() {
        let auth = FixedAuth::default();
        let id = auth.authenticate(&parts(Request::builder())).unwrap();
        assert_eq!(id, "dev");
    }

    #[test]
    fn test_proxy_requires_peer_address() {
        let auth = ProxyAuth::default();
        let result = auth.authenticate(&parts(Request::builder().header("x-remote-user", "dev")));
        assert!(matches!(result, Err(AuthError::MissingPeerAddress)));
    }

    #[test]
    fn test_proxy_rejects_remote_peer() {
        let auth = ProxyAuth::default();
        let result = auth.authenticate(&parts(
            from_peer("192.168.1.1:5678").header("x-remote-user", "dev"),
        ));
        assert!(matches!(result, Err(AuthError::UntrustedPeer(_))));
    }

    #[test]
    fn test_proxy_requires_header() {
        let auth = ProxyAuth::default();

        let missing = auth.authenticate(&parts(from_peer("127.0.0.1:5678")));
        assert!(matches!(missing, Err(AuthError::MissingHeader(_))));

        let empty = auth.authenticate(&parts(
            from_peer("127.0.0.1:5678").header("x-remote-user", ""),
        ));
        assert!(matches!(empty, Err(AuthError::MissingHeader(_))));
    }

    #[test]
    fn test_proxy_success() {
        let auth = ProxyAuth::default();
        let id = auth
            .authenticate(&parts(
                from_peer("[::1]:5678").header("X-Remote-User", "alice@example.org"),
            ))
            .unwrap();
        assert_eq!(id, "alice@example.org");
    }

    #[test]
    fn test_cookie_auth() {
        let auth = CookieAuth::default();

        let id = auth
            .authenticate(&parts(
                Request::builder().header("cookie", "theme=dark; session=abc123"),
            ))
            .unwrap();
        assert_eq!(id, "abc123");

        let missing = auth.authenticate(&parts(Request::builder().header("cookie", "theme=dark")));
        assert!(matches!(missing, Err(AuthError::MissingCookie(_))));

        let empty = auth.authenticate(&parts(Request::builder().header("cookie", "session=")));
        assert!(matches!(empty, Err(AuthError::MissingCookie(_))));
    }
}
