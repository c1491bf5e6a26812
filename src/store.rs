//! Credential documents and the files that hold them.
//!
//! A credentials file is either a plaintext JSON document or an
//! `EncryptedEnvelope` wrapping one. Every read detects which shape is on
//! disk, so plaintext files stay readable forever and callers never need to
//! know up front whether a key is required.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::CREDENTIALS_FILE;
use crate::crypto::{self, EncryptedEnvelope};
use crate::error::{HeimdellError, Result};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

/// A target platform for over-the-air bundles.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Android => write!(f, "android"),
            Self::Ios => write!(f, "ios"),
        }
    }
}

/// The credential document for one environment.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    /// Server origin.
    pub base_url: String,
    pub username: String,
    /// Server password. This is not the encryption key.
    pub password: String,
    /// Project identifier on the server.
    pub tag: String,
    pub platforms: Vec<Platform>,
    /// Owning environment. `None` is the default environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("tag", &self.tag)
            .field("platforms", &self.platforms)
            .field("environment", &self.environment)
            .finish()
    }
}

impl Credentials {
    /// Check invariants and normalise the platform set.
    fn validated(mut self, path: &Path) -> Result<Self> {
        if self.platforms.is_empty() {
            return Err(HeimdellError::malformed(path, "no platforms selected"));
        }

        let mut seen = Vec::with_capacity(self.platforms.len());
        self.platforms.retain(|p| {
            if seen.contains(p) {
                false
            } else {
                seen.push(*p);
                true
            }
        });

        Ok(self)
    }

    fn from_json(text: &str, path: &Path) -> Result<Self> {
        let credentials: Self =
            serde_json::from_str(text).map_err(|e| HeimdellError::malformed(path, e))?;
        credentials.validated(path)
    }
}

/// What a credentials file holds, before any decryption.
enum Stored {
    Plain(String),
    Encrypted(EncryptedEnvelope),
}

fn read_to_string(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => HeimdellError::NotFound(path.to_path_buf()),
        _ => HeimdellError::io("read", path, e),
    })
}

fn read_stored(path: &Path) -> Result<Stored> {
    let text = read_to_string(path)?;
    let value: Value = serde_json::from_str(&text).map_err(|e| HeimdellError::malformed(path, e))?;

    Ok(match EncryptedEnvelope::from_json(&value) {
        Some(envelope) => Stored::Encrypted(envelope),
        None => Stored::Plain(text),
    })
}

/// True iff `path` exists and holds an encrypted envelope.
///
/// Never fails: unreadable or unparsable files count as not encrypted.
pub fn is_encrypted(path: &Path) -> bool {
    matches!(read_stored(path), Ok(Stored::Encrypted(_)))
}

/// Read a plaintext credentials file.
///
/// An encrypted file yields `MissingKey`.
pub fn read_plain(path: &Path) -> Result<Credentials> {
    read(path, None)
}

/// Read a credentials file with `passphrase`.
///
/// Plaintext files are returned as-is; the passphrase is only used when the
/// file is an envelope.
pub fn read_encrypted(path: &Path, passphrase: &str) -> Result<Credentials> {
    read(path, Some(passphrase))
}

/// Read a credentials file of either shape.
pub fn read(path: &Path, passphrase: Option<&str>) -> Result<Credentials> {
    match read_stored(path)? {
        Stored::Plain(text) => Credentials::from_json(&text, path),
        Stored::Encrypted(envelope) => {
            let passphrase =
                passphrase.ok_or_else(|| HeimdellError::MissingKey(path.to_path_buf()))?;
            let text = crypto::decrypt(&envelope, passphrase).map_err(|e| match e {
                HeimdellError::MalformedDocument { reason, .. } => {
                    HeimdellError::malformed(path, reason)
                }
                other => other,
            })?;
            Credentials::from_json(&text, path)
        }
    }
}

/// Write `credentials` as pretty-printed plaintext JSON.
pub fn write(path: &Path, credentials: &Credentials) -> Result<()> {
    let json = serde_json::to_string_pretty(credentials)
        .map_err(|e| HeimdellError::malformed(path, e))?;
    write_atomic(path, json.as_bytes())
}

/// Encrypt `credentials` under `passphrase` and write the envelope.
///
/// Fails with `AlreadyEncrypted`, leaving the file untouched, if `path`
/// already holds an envelope. Encryption is one-way: there is no re-keying.
pub fn write_encrypted(path: &Path, credentials: &Credentials, passphrase: &str) -> Result<()> {
    if is_encrypted(path) {
        return Err(HeimdellError::AlreadyEncrypted(path.to_path_buf()));
    }

    let plaintext =
        serde_json::to_string(credentials).map_err(|e| HeimdellError::malformed(path, e))?;
    write_envelope(path, &crypto::encrypt(&plaintext, passphrase)?)
}

/// Encrypt an existing plaintext credentials file in place.
pub fn encrypt_file(path: &Path, passphrase: &str) -> Result<()> {
    let credentials = match read_stored(path)? {
        Stored::Encrypted(_) => return Err(HeimdellError::AlreadyEncrypted(path.to_path_buf())),
        Stored::Plain(text) => Credentials::from_json(&text, path)?,
    };

    write_encrypted(path, &credentials, passphrase)?;
    tracing::debug!(path = %path.display(), "encrypted credentials file");
    Ok(())
}

fn write_envelope(path: &Path, envelope: &EncryptedEnvelope) -> Result<()> {
    let json =
        serde_json::to_string_pretty(envelope).map_err(|e| HeimdellError::malformed(path, e))?;
    write_atomic(path, json.as_bytes())
}

/// Every `{store_dir}/*/credentials.json` that is not encrypted, sorted.
pub fn find_unencrypted(store_dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(store_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(HeimdellError::io("list", store_dir, e)),
    };

    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| HeimdellError::io("list", store_dir, e))?;
        if !entry.path().is_dir() {
            continue;
        }

        let candidate = entry.path().join(CREDENTIALS_FILE);
        if candidate.is_file() && !is_encrypted(&candidate) {
            found.push(candidate);
        }
    }

    found.sort();
    Ok(found)
}

/// Resolve where a write to `path` should land.
///
/// A symlinked path is followed to its target so the link survives the
/// rename that completes the write.
fn write_destination(path: &Path) -> PathBuf {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => fs::canonicalize(path)
            .or_else(|_| {
                fs::read_link(path).map(|target| match path.parent() {
                    Some(parent) => parent.join(target),
                    None => target,
                })
            })
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

/// Write `bytes` to a sibling temp file, then rename it over `path`.
///
/// A symlink at `path` is followed, so the link survives. Files are created
/// owner read/write only on Unix.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    replace_file(&write_destination(path), bytes)
}

/// Like `write_atomic`, but never follows a symlink at `path`.
///
/// Whatever sits at `path` (file or link) is replaced by a new regular file.
/// For paths in shared directories such as the OS temp dir.
pub(crate) fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    replace_file(path, bytes)
}

fn replace_file(destination: &Path, bytes: &[u8]) -> Result<()> {
    let parent = destination
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| HeimdellError::io("create", parent, e))?;

    let file_name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| CREDENTIALS_FILE.to_string());
    let temp = parent.join(format!(".{file_name}.{}.tmp", std::process::id()));

    // Leftover from an interrupted write by a process with the same pid.
    if fs::symlink_metadata(&temp).is_ok() {
        fs::remove_file(&temp).map_err(|e| HeimdellError::io("remove", &temp, e))?;
    }

    let written = write_new_file(&temp, bytes)
        .and_then(|()| fs::rename(&temp, destination))
        .map_err(|e| HeimdellError::io("write", destination, e));

    if written.is_err() {
        let _ = fs::remove_file(&temp);
    }
    written
}

/// Create `path` exclusively. Fails if anything, including a dangling
/// symlink, already exists there.
fn write_new_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Credentials {
        Credentials {
            base_url: "https://ota.example.com".into(),
            username: "deploy".into(),
            password: "hunter2".into(),
            tag: "mobile-app".into(),
            platforms: vec![Platform::Android, Platform::Ios],
            environment: None,
        }
    }

    #[test]
    fn test_json_shape_uses_camel_case_and_omits_default_environment() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["baseUrl"], "https://ota.example.com");
        assert_eq!(value["platforms"], serde_json::json!(["android", "ios"]));
        assert!(value.get("environment").is_none());
    }

    #[test]
    fn test_null_environment_reads_as_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        fs::write(
            &path,
            r#"{"baseUrl":"https://s","username":"u","password":"p","tag":"t","platforms":["ios"],"environment":null}"#,
        )
        .unwrap();

        assert_eq!(read_plain(&path).unwrap().environment, None);
    }

    #[test]
    fn test_empty_platforms_is_malformed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        fs::write(
            &path,
            r#"{"baseUrl":"https://s","username":"u","password":"p","tag":"t","platforms":[]}"#,
        )
        .unwrap();

        assert!(matches!(
            read_plain(&path),
            Err(HeimdellError::MalformedDocument { .. })
        ));
    }

    #[test]
    fn test_duplicate_platforms_collapse() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        fs::write(
            &path,
            r#"{"baseUrl":"https://s","username":"u","password":"p","tag":"t","platforms":["ios","android","ios"]}"#,
        )
        .unwrap();

        assert_eq!(
            read_plain(&path).unwrap().platforms,
            vec![Platform::Ios, Platform::Android]
        );
    }

    #[test]
    fn test_debug_redacts_password() {
        let rendered = format!("{:?}", sample());
        assert!(!rendered.contains("hunter2"));
    }

    #[cfg(unix)]
    #[test]
    fn test_write_is_owner_only_and_follows_symlinks() {
        use std::os::unix::fs::{symlink, PermissionsExt};

        let dir = TempDir::new().unwrap();
        let target = dir.path().join("target.json");
        let link = dir.path().join("link.json");
        write(&target, &sample()).unwrap();
        symlink("target.json", &link).unwrap();

        let mut changed = sample();
        changed.tag = "changed".into();
        write(&link, &changed).unwrap();

        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(read_plain(&target).unwrap().tag, "changed");
        let mode = fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
