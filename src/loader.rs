//! Credential loading for one command invocation.
//!
//! ```text
//! NoFile                     -> unauthenticated
//! PlainFile                  -> Loaded
//! Encrypted + no key         -> NeedsKey
//! Encrypted + cached key     -> Loaded | NeedsKey (cache cleared)
//! NeedsKey + entered key     -> Loaded (key cached) | NeedsKey ("Invalid encryption key")
//! ```
//!
//! A successful load produces a `Session` that the command body receives
//! explicitly. Nothing is stored in process-global state.

use std::path::{Path, PathBuf};

use crate::config::Layout;
use crate::error::{HeimdellError, Result};
use crate::prompt::{KeyPrompt, TerminalPrompt};
use crate::session::{KeyCache, SessionKeyCache};
use crate::store::{self, Credentials};

/// Shown after an entered key fails to decrypt.
pub const INVALID_KEY_MESSAGE: &str = "Invalid encryption key";

/// The credentials a command runs with.
///
/// Valid for one command. Do not hold on to it across an environment switch
/// or a re-encryption.
#[derive(Debug, Clone)]
pub struct Session {
    credentials: Credentials,
    source: PathBuf,
}

impl Session {
    pub fn new(credentials: Credentials, source: impl Into<PathBuf>) -> Self {
        Self {
            credentials,
            source: source.into(),
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// The file the credentials were read from.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// The environment the credentials belong to. `None` is the default.
    pub fn environment(&self) -> Option<&str> {
        self.credentials.environment.as_deref()
    }

    pub fn into_credentials(self) -> Credentials {
        self.credentials
    }
}

/// Load the credentials at `path`, decrypting with `key` if needed.
///
/// Fails with `NotFound` when the file is absent and `MissingKey` when it is
/// encrypted and no key was given.
pub fn load_credentials(path: &Path, key: Option<&str>) -> Result<Credentials> {
    store::read(path, key)
}

/// Load with whatever key `cache` holds.
///
/// A cached key that fails to decrypt is cleared before `InvalidKey` is
/// returned, so a stale key is never tried twice.
pub fn load_with_cached_key(path: &Path, cache: &mut dyn KeyCache) -> Result<Credentials> {
    let key = cache.get();
    match store::read(path, key.as_ref().map(|k| k.as_str())) {
        Err(HeimdellError::InvalidKey) => {
            tracing::warn!("cached encryption key is invalid, clearing it");
            cache.clear();
            Err(HeimdellError::InvalidKey)
        }
        other => other,
    }
}

/// Best-effort load of the active credentials without prompting.
///
/// Returns `None` when the project is not logged in or the credentials
/// cannot be read with the cached key. Never fails.
pub fn autoload_credentials(layout: &Layout, cache: &mut dyn KeyCache) -> Option<Session> {
    let path = layout.credentials_path();
    if !path.exists() {
        return None;
    }

    match load_with_cached_key(&path, cache) {
        Ok(credentials) => Some(Session::new(credentials, path)),
        Err(e) => {
            tracing::debug!(error = %e, "autoload skipped");
            None
        }
    }
}

/// Resolves credentials for a command, prompting for a key when required.
pub struct CredentialLoader<C, P> {
    path: PathBuf,
    cache: C,
    prompt: P,
}

impl CredentialLoader<SessionKeyCache, TerminalPrompt> {
    /// Loader for the project's active credentials, using the shell session
    /// cache and terminal prompts.
    pub fn for_terminal(layout: &Layout) -> Self {
        Self::new(
            layout.credentials_path(),
            SessionKeyCache::from_env(),
            TerminalPrompt::new(),
        )
    }
}

impl<C: KeyCache, P: KeyPrompt> CredentialLoader<C, P> {
    pub fn new(path: impl Into<PathBuf>, cache: C, prompt: P) -> Self {
        Self {
            path: path.into(),
            cache,
            prompt,
        }
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    pub fn prompt(&self) -> &P {
        &self.prompt
    }

    /// Run the loading state machine.
    ///
    /// `Ok(None)` means no credentials file exists (not logged in). Only
    /// key errors lead to prompting; every other failure is returned as-is.
    pub fn resolve(&mut self, command_name: &str) -> Result<Option<Session>> {
        if !self.path.exists() {
            tracing::debug!(path = %self.path.display(), "no credentials file");
            return Ok(None);
        }

        match load_with_cached_key(&self.path, &mut self.cache) {
            Ok(credentials) => return Ok(Some(Session::new(credentials, &self.path))),
            Err(e) if e.is_key_error() => {
                tracing::debug!(error = %e, "credentials need an encryption key");
            }
            Err(e) => return Err(e),
        }

        let credentials = self.prompt_until_valid(command_name)?;
        Ok(Some(Session::new(credentials, &self.path)))
    }

    /// Prompt until an entered key decrypts the file. There is no retry
    /// limit; aborting the prompt aborts the command.
    fn prompt_until_valid(&mut self, command_name: &str) -> Result<Credentials> {
        let message = format!(
            "Command '{command_name}' requires encrypted credentials. Please enter your encryption key"
        );
        let mut error: Option<&str> = None;

        loop {
            let key = self.prompt.prompt_key(&message, error)?;
            match store::read(&self.path, Some(key.as_str())) {
                Ok(credentials) => {
                    if let Err(e) = self.cache.set(&key) {
                        tracing::warn!(error = %e, "failed to cache session key");
                    }
                    return Ok(credentials);
                }
                Err(HeimdellError::InvalidKey) => {
                    tracing::debug!("entered encryption key is invalid");
                    error = Some(INVALID_KEY_MESSAGE);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run `body` with resolved credentials.
    ///
    /// The body runs exactly once, after a valid key has been supplied if
    /// one was needed. A missing credentials file yields `NotFound`.
    pub fn execute_protected_command<T, E, F>(
        &mut self,
        command_name: &str,
        body: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(&Session) -> std::result::Result<T, E>,
        E: From<HeimdellError>,
    {
        let session = self
            .resolve(command_name)?
            .ok_or_else(|| HeimdellError::NotFound(self.path.clone()))?;
        tracing::debug!(command = command_name, environment = ?session.environment(), "running protected command");
        body(&session)
    }
}

/// Run `body` against the project's active credentials from a terminal.
pub fn execute_protected_command<T, E, F>(
    layout: &Layout,
    command_name: &str,
    body: F,
) -> std::result::Result<T, E>
where
    F: FnOnce(&Session) -> std::result::Result<T, E>,
    E: From<HeimdellError>,
{
    CredentialLoader::for_terminal(layout).execute_protected_command(command_name, body)
}
