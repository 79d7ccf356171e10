//! Token storage and management
//!
//! One bearer token per logical name (`teams`, `skype`, `chatsvcagg`), stored
//! as `token-<name>.jwt` in a private per-user directory. The API client reads
//! these files independently, possibly from another process, so every write
//! goes through a temp file and a rename.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use super::error::AuthError;

const TOKEN_FILE_PREFIX: &str = "token-";
const TOKEN_FILE_SUFFIX: &str = ".jwt";

/// Consider a token expired if fewer than this many seconds remain.
const EXPIRY_MARGIN_SECS: i64 = 300;

/// File-backed token store.
#[derive(Debug, Clone)]
pub struct TokenStore {
    dir: PathBuf,
}

impl TokenStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `$HOME/.config/fossteams`, shared with the other fossteams tools.
    pub fn default_dir() -> Option<PathBuf> {
        home::home_dir().map(|home| home.join(".config").join("fossteams"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}{}", TOKEN_FILE_PREFIX, name, TOKEN_FILE_SUFFIX))
    }

    /// Atomically replace the token stored under `name`.
    pub fn write(&self, name: &str, token: &str) -> Result<(), AuthError> {
        self.write_inner(name, token)
            .map_err(|source| AuthError::Persistence {
                name: name.to_string(),
                source,
            })?;
        tracing::debug!(token_name = name, "token persisted");
        Ok(())
    }

    fn write_inner(&self, name: &str, token: &str) -> io::Result<()> {
        create_private_dir(&self.dir)?;

        let path = self.path(name);
        let tmp = self.dir.join(format!(
            ".{}{}{}.{}.tmp",
            TOKEN_FILE_PREFIX,
            name,
            TOKEN_FILE_SUFFIX,
            uuid::Uuid::new_v4().simple()
        ));

        let result = write_private_file(&tmp, token.as_bytes()).and_then(|()| fs::rename(&tmp, &path));
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }

    /// Read the token stored under `name`, `None` if it was never written.
    pub fn read(&self, name: &str) -> io::Result<Option<String>> {
        match fs::read_to_string(self.path(name)) {
            Ok(raw) => Ok(Some(raw.trim().to_string())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

fn create_private_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir)
    }
}

fn write_private_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[derive(Deserialize)]
struct Claims {
    exp: Option<i64>,
}

/// Expiry metadata decoded from a JWT, used for diagnostics only.
///
/// The signature is not verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenInfo {
    /// Decode the `exp` claim. Returns `None` when the token is not a JWT.
    pub fn inspect(token: &str) -> Option<Self> {
        let payload = token.split('.').nth(1)?;
        let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
        let claims: Claims = serde_json::from_slice(&bytes).ok()?;
        Some(Self {
            expires_at: claims
                .exp
                .and_then(|exp| DateTime::<Utc>::from_timestamp(exp, 0)),
        })
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(exp) => now + Duration::seconds(EXPIRY_MARGIN_SECS) >= exp,
            None => false,
        }
    }

    pub fn minutes_left(&self) -> Option<i64> {
        self.expires_at
            .map(|exp| (exp - Utc::now()).num_minutes())
    }
}
