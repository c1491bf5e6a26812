//! Session-scoped cache of the decryption passphrase.
//!
//! Repeated CLI invocations from one terminal share a cached key so the
//! user is prompted once per shell, not once per command. The session is
//! identified by the parent process id (the shell), so concurrent terminals
//! never see each other's keys.
//!
//! Lookup order for `SessionKeyCache::get`:
//! 1. the in-process override, seeded from `HEIMDELL_SESSION_KEY`
//! 2. `{temp_dir}/.heimdell_session_{ppid}`
//!
//! ## Accepted risk
//!
//! The cached passphrase is stored unencrypted. The side file is created
//! owner read/write only and lives in the OS temp directory, so it is
//! protected by file permissions and disappears with the temp dir. This is
//! a convenience cache, not a secret store.
//!
//! The side file is always written as a fresh regular file that replaces
//! whatever is at the path. A symlink planted there is replaced, never
//! followed, and a symlink is never read as a cached key.
//!
//! Off Unix there is no portable parent process id, so the session id is the
//! process's own id. Each invocation then gets its own side file and the
//! cache never hits across commands; only `HEIMDELL_SESSION_KEY` persists a
//! key there.

use std::fs;
use std::path::{Path, PathBuf};

use zeroize::Zeroizing;

use crate::error::Result;
use crate::store;

/// Environment variable consulted before the side file.
pub const SESSION_ENV_VAR: &str = "HEIMDELL_SESSION_KEY";

const SESSION_FILE_PREFIX: &str = ".heimdell_session_";

/// A place to remember a passphrase that is known to work.
pub trait KeyCache {
    /// The cached passphrase, if any.
    fn get(&self) -> Option<Zeroizing<String>>;

    /// Remember `key`, replacing any previous value.
    fn set(&mut self, key: &str) -> Result<()>;

    /// Forget the cached passphrase.
    fn clear(&mut self);
}

/// The production cache: environment override plus a per-shell temp file.
#[derive(Debug)]
pub struct SessionKeyCache {
    override_key: Option<Zeroizing<String>>,
    file: PathBuf,
}

impl SessionKeyCache {
    /// Cache for the current shell session.
    pub fn from_env() -> Self {
        let override_key = std::env::var(SESSION_ENV_VAR)
            .ok()
            .filter(|k| !k.is_empty())
            .map(Zeroizing::new);

        Self {
            override_key,
            file: session_file_path(session_id()),
        }
    }

    /// Cache backed by an explicit side file and no environment override.
    pub fn with_file(file: impl Into<PathBuf>) -> Self {
        Self {
            override_key: None,
            file: file.into(),
        }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    fn read_file(&self) -> Option<Zeroizing<String>> {
        // Missing, unreadable, linked or half-written files all mean "no key".
        let meta = fs::symlink_metadata(&self.file).ok()?;
        if !meta.file_type().is_file() {
            return None;
        }
        let content = Zeroizing::new(fs::read_to_string(&self.file).ok()?);
        let key = content.trim();
        (!key.is_empty()).then(|| Zeroizing::new(key.to_string()))
    }
}

impl KeyCache for SessionKeyCache {
    fn get(&self) -> Option<Zeroizing<String>> {
        self.override_key.clone().or_else(|| self.read_file())
    }

    fn set(&mut self, key: &str) -> Result<()> {
        self.override_key = Some(Zeroizing::new(key.to_string()));
        store::write_private(&self.file, key.as_bytes())?;
        tracing::debug!(file = %self.file.display(), "cached session key");
        Ok(())
    }

    fn clear(&mut self) {
        self.override_key = None;
        match fs::remove_file(&self.file) {
            Ok(()) => tracing::debug!(file = %self.file.display(), "cleared session key"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                file = %self.file.display(),
                error = %e,
                "failed to remove session key file"
            ),
        }
    }
}

/// An in-memory cache, for tests and for embedding without a shell.
#[derive(Debug, Default)]
pub struct MemoryKeyCache {
    key: Option<Zeroizing<String>>,
}

impl MemoryKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(key: &str) -> Self {
        Self {
            key: Some(Zeroizing::new(key.to_string())),
        }
    }
}

impl KeyCache for MemoryKeyCache {
    fn get(&self) -> Option<Zeroizing<String>> {
        self.key.clone()
    }

    fn set(&mut self, key: &str) -> Result<()> {
        self.key = Some(Zeroizing::new(key.to_string()));
        Ok(())
    }

    fn clear(&mut self) {
        self.key = None;
    }
}

/// Identity of the enclosing shell session.
#[cfg(unix)]
fn session_id() -> u32 {
    std::os::unix::process::parent_id()
}

#[cfg(not(unix))]
fn session_id() -> u32 {
    std::process::id()
}

fn session_file_path(id: u32) -> PathBuf {
    std::env::temp_dir().join(format!("{SESSION_FILE_PREFIX}{id}"))
}
