//! On-disk persistence for OpenID token details.
//!
//! Stored at `$XDG_DATA_HOME/remora/tokens` (falling back to
//! `$HOME/.local/share/remora/tokens`), file mode 0600, as versioned JSON.
//! Unknown versions are rejected rather than guessed at.

use super::AuthError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const STORE_VERSION: u32 = 1;

/// The OpenID token pair plus identity, as held in memory and on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenDetails {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    /// Registry-assigned user id.
    pub gr_uid: String,
}

#[derive(Serialize, Deserialize)]
struct StoredTokens {
    version: u32,
    #[serde(flatten)]
    details: TokenDetails,
}

pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        TokenStore { path: path.into() }
    }

    /// `$XDG_DATA_HOME/remora/tokens`, or `$HOME/.local/share/remora/tokens`
    /// when `XDG_DATA_HOME` is unset or empty.
    pub fn default_path() -> PathBuf {
        let base = std::env::var_os("XDG_DATA_HOME")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = std::env::var_os("HOME").unwrap_or_else(|| ".".into());
                Path::new(&home).join(".local").join("share")
            });
        base.join("remora").join("tokens")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read persisted token details. A missing file is not an error.
    pub fn load(&self) -> Result<Option<TokenDetails>, AuthError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(AuthError::TokenStore(format!(
                    "reading {}: {e}",
                    self.path.display()
                )));
            }
        };
        let stored: StoredTokens = serde_json::from_str(&text)
            .map_err(|e| AuthError::TokenStore(format!("parsing {}: {e}", self.path.display())))?;
        if stored.version != STORE_VERSION {
            return Err(AuthError::UnsupportedTokenVersion(stored.version));
        }
        Ok(Some(stored.details))
    }

    /// Persist token details with file mode 0600.
    pub fn save(&self, details: &TokenDetails) -> Result<(), AuthError> {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                AuthError::TokenStore(format!("creating {}: {e}", parent.display()))
            })?;
        }
        let stored = StoredTokens {
            version: STORE_VERSION,
            details: details.clone(),
        };
        let json = serde_json::to_string_pretty(&stored)
            .map_err(|e| AuthError::TokenStore(format!("encoding tokens: {e}")))?;

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&self.path)
            .map_err(|e| {
                AuthError::TokenStore(format!("opening {}: {e}", self.path.display()))
            })?;
        file.write_all(json.as_bytes())
            .map_err(|e| AuthError::TokenStore(format!("writing {}: {e}", self.path.display())))?;
        Ok(())
    }
}
