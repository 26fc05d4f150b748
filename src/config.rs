//! Configuration management for the Filesender server

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Default maximum request body: 2 GiB
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 2 * 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub upload: UploadConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Prefix of every URL handed back to clients, always ending in `/`
    pub app_root: String,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub state_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Cap on a single request body
    pub max_upload_size: u64,
    pub default_expiry_days: i64,
    pub max_expiry_days: i64,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub method: AuthMethod,
    /// Identity header trusted by the proxy method
    pub header: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Proxy,
    Cookie,
    Dummy,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable {0} not set")]
    Missing(&'static str),

    #[error("environment variable {name} is invalid: {value}")]
    Invalid { name: &'static str, value: String },
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
                app_root: "/".to_string(),
            },
            storage: StorageConfig {
                state_dir: PathBuf::from("./state"),
            },
            upload: UploadConfig {
                max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
                default_expiry_days: 7,
                max_expiry_days: 30,
            },
            auth: AuthConfig {
                method: AuthMethod::Proxy,
                header: "X-Remote-User".to_string(),
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let listen = match env::var("LISTEN_ADDR") {
            Ok(value) => value.parse().map_err(|_| ConfigError::Invalid {
                name: "LISTEN_ADDR",
                value,
            })?,
            Err(_) => defaults.server.listen,
        };

        let state_dir = env::var("STATE_DIRECTORY")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .ok_or(ConfigError::Missing("STATE_DIRECTORY"))?;

        let method = match env::var("FILESENDER_AUTH_METHOD")
            .unwrap_or_else(|_| "proxy".to_string())
            .as_str()
        {
            "dummy" => AuthMethod::Dummy,
            "cookie" => AuthMethod::Cookie,
            _ => AuthMethod::Proxy,
        };

        Ok(Config {
            server: ServerConfig {
                listen,
                app_root: normalize_app_root(
                    &env::var("FILESENDER_APP_ROOT").unwrap_or_else(|_| "/".to_string()),
                ),
            },
            storage: StorageConfig { state_dir },
            upload: UploadConfig {
                max_upload_size: env::var("MAX_UPLOAD_SIZE")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_MAX_UPLOAD_SIZE),
                default_expiry_days: env::var("DEFAULT_EXPIRY_DAYS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.upload.default_expiry_days),
                max_expiry_days: env::var("MAX_EXPIRY_DAYS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.upload.max_expiry_days),
            },
            auth: AuthConfig {
                method,
                header: env::var("FILESENDER_AUTH_HEADER").unwrap_or(defaults.auth.header),
            },
        })
    }
}

/// Make sure the app root starts and ends with a slash
pub fn normalize_app_root(root: &str) -> String {
    let trimmed = root.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_app_root() {
        assert_eq!(normalize_app_root(""), "/");
        assert_eq!(normalize_app_root("/"), "/");
        assert_eq!(normalize_app_root("files"), "/files/");
        assert_eq!(normalize_app_root("/files/"), "/files/");
        assert_eq!(normalize_app_root("/a/b"), "/a/b/");
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.upload.max_upload_size, 2 * 1024 * 1024 * 1024);
        assert_eq!(config.auth.method, AuthMethod::Proxy);
        assert_eq!(config.server.app_root, "/");
    }
}
