//! Identity pseudonymization
//!
//! Turns an external identity (whatever the authenticator hands us) into an
//! opaque owner ID. The HMAC key is generated once, persisted to the state
//! directory and reloaded on every start, so the same caller keeps the same
//! owner ID across restarts.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// File name of the persisted key inside the state directory
pub const KEY_FILE_NAME: &str = "hmac.key";

/// Key length in bytes
pub const KEY_LEN: usize = 32;

/// Errors raised while loading or creating the HMAC key
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("HMAC key file {path} is malformed: expected {KEY_LEN} bytes, found {found}")]
    MalformedKey { path: PathBuf, found: usize },

    #[error("Failed to access HMAC key file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Keyed, deterministic identity hasher
#[derive(Clone)]
pub struct IdentityHasher {
    key: [u8; KEY_LEN],
}

impl std::fmt::Debug for IdentityHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityHasher").finish_non_exhaustive()
    }
}

impl IdentityHasher {
    /// Load the key from `{state_dir}/hmac.key`, generating it on first run.
    ///
    /// A key file of the wrong length is never repaired or replaced: doing so
    /// would silently give every existing user a new owner ID.
    pub fn load_or_create(state_dir: &Path) -> Result<Self, IdentityError> {
        let path = state_dir.join(KEY_FILE_NAME);

        match fs::read(&path) {
            Ok(bytes) => {
                let key: [u8; KEY_LEN] =
                    bytes
                        .as_slice()
                        .try_into()
                        .map_err(|_| IdentityError::MalformedKey {
                            path: path.clone(),
                            found: bytes.len(),
                        })?;

                tracing::info!(path = %path.display(), "Loaded HMAC key");
                Ok(Self { key })
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let key: [u8; KEY_LEN] = rand::random();
                write_new_key(&path, &key)?;

                tracing::info!(path = %path.display(), "Generated new HMAC key");
                Ok(Self { key })
            }
            Err(source) => Err(IdentityError::Io { path, source }),
        }
    }

    /// Build a hasher from an in-memory key
    pub fn from_key(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// Map an external identity to its opaque owner ID.
    ///
    /// The result is always 43 characters (a 256-bit digest, base64url
    /// without padding) regardless of the input.
    pub fn pseudonymize(&self, external_id: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts keys of any length");
        mac.update(external_id.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }
}

fn write_new_key(path: &Path, key: &[u8; KEY_LEN]) -> Result<(), IdentityError> {
    let io_err = |source| IdentityError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path).map_err(io_err)?;
    file.write_all(key).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    Ok(())
}
