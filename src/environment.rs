//! Named environments and the active-credentials pointer.
//!
//! Each environment owns `{store}/{name}/credentials.json`. The canonical
//! path `{store}/credentials.json` points at exactly one of them, either as
//! a relative symlink or, where links cannot be created, as a plain copy.
//! A genuine default credentials file found at the canonical path is moved
//! to `{store}/.temp/` before being replaced and restored on the way back
//! to the default environment.
//!
//! A regular canonical file counts as a copy only when `.current-env` names
//! an environment and the file either matches that environment's bytes or
//! is a plaintext document tagged with that environment. Anything else is
//! treated as a genuine default and is never deleted. An existing backup is
//! never overwritten; a second displaced file is parked next to it.
//!
//! Switching is best-effort, not transactional: an interruption between
//! removing the old pointer and creating the new one leaves the canonical
//! path absent. The backup is never deleted by a switch, so no user data is
//! lost and re-running the switch repairs the pointer.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::Layout;
use crate::error::{HeimdellError, Result};
use crate::store::{self, Credentials};

/// Longest accepted environment name, after sanitisation.
pub const MAX_ENVIRONMENT_NAME_LEN: usize = 30;

const GITIGNORE_CONTENTS: &str = "credentials.json\n.temp\n";

/// Strip an environment name down to `[a-z0-9_]`.
///
/// The name is lowercased, each run of whitespace becomes a single `_`, and
/// every other character outside the allowed set is dropped. The result may
/// be empty.
pub fn sanitize_environment_name(name: &str) -> String {
    let mut sanitized = String::with_capacity(name.len());
    let mut in_whitespace = false;

    for ch in name.trim().to_lowercase().chars() {
        if ch.is_whitespace() {
            if !in_whitespace {
                sanitized.push('_');
            }
            in_whitespace = true;
            continue;
        }

        in_whitespace = false;
        if ch.is_ascii_alphanumeric() || ch == '_' {
            sanitized.push(ch);
        }
    }

    sanitized
}

/// Validate a user-supplied environment name and return its sanitised form.
pub fn validate_environment_name(name: &str) -> Result<String> {
    if name.trim().is_empty() {
        return Err(HeimdellError::InvalidEnvironmentName(
            "The environment name cannot be empty".to_string(),
        ));
    }

    let sanitized = sanitize_environment_name(name);
    if sanitized.is_empty() {
        return Err(HeimdellError::InvalidEnvironmentName(format!(
            "The environment name is invalid: \"{name}\" contains no letters, numbers or underscores"
        )));
    }

    if sanitized.len() > MAX_ENVIRONMENT_NAME_LEN {
        return Err(HeimdellError::InvalidEnvironmentName(format!(
            "The environment name is too long (max {MAX_ENVIRONMENT_NAME_LEN} characters)"
        )));
    }

    Ok(sanitized)
}

/// How the canonical path ended up pointing at an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerMode {
    /// A relative symlink: edits to the environment file show up live.
    Symlinked,
    /// A byte copy: edits to the environment file are not reflected until
    /// the next switch.
    Copied,
}

impl PointerMode {
    /// True when the canonical path stays in sync with the environment file.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Symlinked)
    }
}

/// Result of a switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchOutcome {
    /// The environment now active. `None` is the default.
    pub environment: Option<String>,
    /// Pointer mode for a named environment. `None` when switching to the
    /// default.
    pub mode: Option<PointerMode>,
    /// Whether a previously backed-up default file was put back.
    pub restored_backup: bool,
}

impl SwitchOutcome {
    /// True when the caller must warn that the copy will not track edits.
    pub fn is_copy_fallback(&self) -> bool {
        self.mode == Some(PointerMode::Copied)
    }
}

/// Creates a symlink at `link` whose content is `original`.
pub type SymlinkFn = fn(original: &Path, link: &Path) -> io::Result<()>;

/// The platform's file symlink primitive.
pub fn system_symlink(original: &Path, link: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(original, link)
    }
    #[cfg(windows)]
    {
        std::os::windows::fs::symlink_file(original, link)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (original, link);
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "symlinks are not supported on this platform",
        ))
    }
}

/// Manages the environments of one credential store.
#[derive(Clone)]
pub struct EnvironmentManager {
    layout: Layout,
    symlink: SymlinkFn,
}

impl std::fmt::Debug for EnvironmentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentManager")
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl EnvironmentManager {
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            symlink: system_symlink,
        }
    }

    /// Replace the symlink primitive, e.g. to simulate a filesystem that
    /// refuses links.
    pub fn with_symlink(mut self, symlink: SymlinkFn) -> Self {
        self.symlink = symlink;
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// The active environment recorded in the marker file.
    ///
    /// A missing, empty or unreadable marker means the default.
    pub fn current_environment(&self) -> Option<String> {
        let marker = self.layout.current_env_marker();
        match fs::read_to_string(&marker) {
            Ok(content) => Some(content.trim().to_string()).filter(|name| !name.is_empty()),
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::debug!(marker = %marker.display(), error = %e, "unreadable environment marker");
                }
                None
            }
        }
    }

    fn set_current_environment(&self, environment: Option<&str>) -> Result<()> {
        let marker = self.layout.current_env_marker();
        match environment {
            Some(name) => store::write_atomic(&marker, name.as_bytes()),
            None => remove_if_exists(&marker),
        }
    }

    /// Names of every environment that has a credentials file, sorted.
    pub fn list_environments(&self) -> Result<Vec<String>> {
        let store_dir = self.layout.store_dir();
        let entries = match fs::read_dir(store_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(HeimdellError::io("list", store_dir, e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| HeimdellError::io("list", store_dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            if self.layout.environment_credentials(&name).is_file() {
                names.push(name);
            }
        }

        names.sort();
        Ok(names)
    }

    /// Write the store's `.gitignore`.
    pub fn write_gitignore(&self) -> Result<()> {
        let path = self.layout.gitignore_path();
        fs::create_dir_all(self.layout.store_dir())
            .map_err(|e| HeimdellError::io("create", self.layout.store_dir(), e))?;
        fs::write(&path, GITIGNORE_CONTENTS).map_err(|e| HeimdellError::io("write", &path, e))
    }

    /// Persist freshly entered login credentials and make them active.
    ///
    /// With an environment, the document is written to that environment's
    /// directory (replacing any previous login there) and the store is
    /// switched to it. Without one, the store is first reset to the default
    /// and the canonical file is replaced. When `key` is given the document
    /// is written encrypted.
    pub fn save_login(
        &self,
        environment: Option<&str>,
        mut credentials: Credentials,
        key: Option<&str>,
    ) -> Result<SwitchOutcome> {
        let (path, environment) = match environment {
            Some(name) => {
                let name = validate_environment_name(name)?;
                // The copy can only be recognised while it still matches
                // the file about to be replaced.
                let canonical = self.layout.credentials_path();
                let active = self.current_environment();
                if active.as_deref() == Some(name.as_str())
                    && fs::symlink_metadata(&canonical).is_ok_and(|m| m.file_type().is_file())
                    && self.is_active_copy(&canonical, active.as_deref())
                {
                    remove_if_exists(&canonical)?;
                }
                (self.layout.environment_credentials(&name), Some(name))
            }
            None => {
                self.switch_to(None)?;
                (self.layout.credentials_path(), None)
            }
        };

        credentials.environment = environment.clone();
        remove_if_exists(&path)?;
        match key {
            Some(key) => store::write_encrypted(&path, &credentials, key)?,
            None => store::write(&path, &credentials)?,
        }
        self.write_gitignore()?;
        tracing::info!(path = %path.display(), encrypted = key.is_some(), "saved login credentials");

        match environment {
            Some(name) => self.switch_to(Some(&name)),
            None => Ok(SwitchOutcome {
                environment: None,
                mode: None,
                restored_backup: false,
            }),
        }
    }

    /// Make `environment` the active one, or the default for `None`.
    pub fn switch_to(&self, environment: Option<&str>) -> Result<SwitchOutcome> {
        match environment {
            Some(name) => self.switch_to_named(name),
            None => self.switch_to_default(),
        }
    }

    fn switch_to_named(&self, name: &str) -> Result<SwitchOutcome> {
        let name = validate_environment_name(name)?;
        let target = self.layout.environment_credentials(&name);
        if !target.is_file() {
            return Err(HeimdellError::EnvironmentNotFound(name));
        }

        self.sync_environment_field(&target, &name)?;
        let mode = self.activate_pointer(&target)?;
        self.set_current_environment(Some(&name))?;

        tracing::info!(environment = %name, ?mode, "switched environment");
        Ok(SwitchOutcome {
            environment: Some(name),
            mode: Some(mode),
            restored_backup: false,
        })
    }

    fn switch_to_default(&self) -> Result<SwitchOutcome> {
        let canonical = self.layout.credentials_path();
        let active = self.current_environment();

        match fs::symlink_metadata(&canonical) {
            Ok(meta) if meta.file_type().is_symlink() => remove_if_exists(&canonical)?,
            Ok(_) if self.is_active_copy(&canonical, active.as_deref()) => {
                remove_if_exists(&canonical)?
            }
            Ok(_) => tracing::debug!("keeping default credentials at the canonical path"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(HeimdellError::io("inspect", &canonical, e)),
        }

        let backup = self.layout.backup_path(&canonical);
        let restored_backup = backup.is_file() && !exists_no_follow(&canonical);
        if restored_backup {
            move_file(&backup, &canonical)?;
            self.strip_environment_field(&canonical);
            tracing::info!(path = %canonical.display(), "restored default credentials");
        } else {
            tracing::debug!("no default credentials backup to restore");
        }

        self.set_current_environment(None)?;
        Ok(SwitchOutcome {
            environment: None,
            mode: None,
            restored_backup,
        })
    }

    /// Point the canonical path at `target`.
    ///
    /// An existing link or copy is removed. Any other regular file is moved
    /// to its backup location first, without overwriting an older backup. A relative
    /// symlink is attempted; if the filesystem refuses, the bytes are copied
    /// and `PointerMode::Copied` is returned.
    pub fn activate_pointer(&self, target: &Path) -> Result<PointerMode> {
        let store_dir = self.layout.store_dir();
        fs::create_dir_all(store_dir).map_err(|e| HeimdellError::io("create", store_dir, e))?;

        let canonical = self.layout.credentials_path();
        match fs::symlink_metadata(&canonical) {
            Ok(meta) if meta.file_type().is_symlink() => remove_if_exists(&canonical)?,
            Ok(_) if self.is_active_copy(&canonical, self.current_environment().as_deref()) => {
                remove_if_exists(&canonical)?
            }
            Ok(_) => self.backup(&canonical)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(HeimdellError::io("inspect", &canonical, e)),
        }

        let link_target = target.strip_prefix(store_dir).unwrap_or(target);
        match (self.symlink)(link_target, &canonical) {
            Ok(()) => Ok(PointerMode::Symlinked),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "symlink creation failed, copying credentials instead; edits will not sync"
                );
                let bytes = fs::read(target).map_err(|e| HeimdellError::io("read", target, e))?;
                store::write_atomic(&canonical, &bytes)?;
                Ok(PointerMode::Copied)
            }
        }
    }

    /// Whether the regular file at `canonical` is a copy of `active`.
    fn is_active_copy(&self, canonical: &Path, active: Option<&str>) -> bool {
        let Some(name) = active else {
            return false;
        };

        let target = self.layout.environment_credentials(name);
        if let (Ok(copy), Ok(original)) = (fs::read(canonical), fs::read(&target)) {
            if copy == original {
                return true;
            }
        }

        // A copy whose environment file changed since the switch still
        // carries the environment it was copied from.
        matches!(
            store::read_plain(canonical),
            Ok(credentials) if credentials.environment.as_deref() == Some(name)
        )
    }

    /// Move `path` into the backup slot.
    ///
    /// An existing backup is kept; the newcomer goes to the first free
    /// numbered slot beside it instead.
    fn backup(&self, path: &Path) -> Result<()> {
        let primary = self.layout.backup_path(path);
        let temp_dir = self.layout.temp_dir();
        fs::create_dir_all(&temp_dir).map_err(|e| HeimdellError::io("create", &temp_dir, e))?;

        let mut backup = primary.clone();
        let mut slot = 1u32;
        while exists_no_follow(&backup) {
            backup = primary.with_extension(format!("bak.{slot}"));
            slot += 1;
        }
        if backup != primary {
            tracing::warn!(
                existing = %primary.display(),
                parked = %backup.display(),
                "a backup already exists, keeping both"
            );
        }

        move_file(path, &backup)?;
        tracing::debug!(from = %path.display(), to = %backup.display(), "backed up credentials");
        Ok(())
    }

    /// Every unencrypted credentials file in this store.
    ///
    /// That is each environment file, the canonical file when it is a
    /// genuine default login, and a backed-up default login. A canonical
    /// symlink or copy is left out: it follows its environment file (see
    /// `refresh_copy`).
    pub fn unencrypted_files(&self) -> Result<Vec<PathBuf>> {
        let mut found = store::find_unencrypted(self.layout.store_dir())?;

        let canonical = self.layout.credentials_path();
        let is_regular = fs::symlink_metadata(&canonical)
            .map(|meta| meta.file_type().is_file())
            .unwrap_or(false);
        if is_regular
            && !self.is_active_copy(&canonical, self.current_environment().as_deref())
            && !store::is_encrypted(&canonical)
        {
            found.push(canonical.clone());
        }

        let backup = self.layout.backup_path(&canonical);
        if backup.is_file() && !store::is_encrypted(&backup) {
            found.push(backup);
        }

        Ok(found)
    }

    /// Re-copy the active environment over a canonical copy that has fallen
    /// behind its environment file.
    ///
    /// Used after the environment file changed on disk, e.g. when it was
    /// encrypted, so the copy never lags behind in plaintext. Returns `None`
    /// when there is no copy or it is already current.
    pub fn refresh_copy(&self) -> Result<Option<SwitchOutcome>> {
        let Some(name) = self.current_environment() else {
            return Ok(None);
        };

        let canonical = self.layout.credentials_path();
        let is_regular = fs::symlink_metadata(&canonical)
            .map(|meta| meta.file_type().is_file())
            .unwrap_or(false);
        if !is_regular || !self.is_active_copy(&canonical, Some(&name)) {
            return Ok(None);
        }

        let target = self.layout.environment_credentials(&name);
        if let (Ok(copy), Ok(original)) = (fs::read(&canonical), fs::read(&target)) {
            if copy == original {
                return Ok(None);
            }
        }

        tracing::debug!(environment = %name, "refreshing canonical copy");
        self.switch_to(Some(&name)).map(Some)
    }

    /// Keep a plaintext environment file self-describing.
    fn sync_environment_field(&self, path: &Path, name: &str) -> Result<()> {
        if store::is_encrypted(path) {
            tracing::debug!(path = %path.display(), "encrypted environment file left as-is");
            return Ok(());
        }

        let mut credentials = store::read_plain(path)?;
        if credentials.environment.as_deref() != Some(name) {
            credentials.environment = Some(name.to_string());
            store::write(path, &credentials)?;
        }
        Ok(())
    }

    /// Drop `environment` from a restored default file, if it has one.
    ///
    /// Files without the field are left byte-for-byte as restored.
    fn strip_environment_field(&self, path: &Path) {
        if store::is_encrypted(path) {
            return;
        }

        let result = store::read_plain(path).and_then(|mut credentials| {
            if credentials.environment.take().is_some() {
                store::write(path, &credentials)?;
            }
            Ok(())
        });

        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "restored credentials left unchanged");
        }
    }
}

fn exists_no_follow(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(HeimdellError::io("remove", path, e)),
    }
}

/// Rename `from` to `to`, copying across filesystems when rename cannot.
fn move_file(from: &Path, to: &Path) -> Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            tracing::debug!(from = %from.display(), to = %to.display(), "cross-device move, copying");
            fs::copy(from, to).map_err(|e| HeimdellError::io("copy", to, e))?;
            fs::remove_file(from).map_err(|e| HeimdellError::io("remove", from, e))
        }
        Err(e) => Err(HeimdellError::io("move", from, e)),
    }
}

/// `path` relative to the project root, for display.
pub fn display_path(layout: &Layout, path: &Path) -> PathBuf {
    path.strip_prefix(layout.root())
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| path.to_path_buf())
}
