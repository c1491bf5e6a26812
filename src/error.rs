//! Error types for heimdell.
//!
//! Every variant is a distinct failure mode of the credential subsystem.
//! Callers branch on the variant, never on the rendered message. Messages
//! name the operation and path involved but never include key material or
//! decrypted content.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HeimdellError>;

/// The single error type for all heimdell operations.
#[derive(Debug, Error)]
pub enum HeimdellError {
    /// No credentials file at the expected path.
    #[error("credentials not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Decryption failed authentication. Either the key is wrong or the
    /// ciphertext, IV or tag has been tampered with.
    #[error("Invalid encryption key")]
    InvalidKey,

    /// The credentials are encrypted and no key was supplied.
    #[error("credentials at {} require an encryption key", .0.display())]
    MissingKey(PathBuf),

    /// The file exists (and decrypted, if encrypted) but is not a valid
    /// credential document.
    #[error("malformed credentials at {}: {reason}", .path.display())]
    MalformedDocument { path: PathBuf, reason: String },

    /// Encryption was requested for a file that is already an envelope.
    #[error("credentials at {} are already encrypted", .0.display())]
    AlreadyEncrypted(PathBuf),

    /// A switch or login referenced an environment with no on-disk entry.
    #[error("no credentials found for environment \"{0}\"")]
    EnvironmentNotFound(String),

    /// An environment name failed validation.
    #[error("{0}")]
    InvalidEnvironmentName(String),

    /// A filesystem operation failed.
    #[error("failed to {op} {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Sealing the plaintext failed. The underlying cipher returned an error.
    #[error("encryption failed")]
    EncryptionFailure,

    /// PBKDF2 could not produce a key (zero iterations or bad output length).
    #[error("key derivation failed")]
    KeyDerivation,

    /// The system's random number generator failed to produce bytes.
    #[error("randomness source failed")]
    Randomness,

    /// Reading interactive input failed or was interrupted.
    #[error("failed to read input: {0}")]
    Prompt(String),
}

impl HeimdellError {
    /// Wrap an I/O error with the operation and path it came from.
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn malformed(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::MalformedDocument {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// True for the two failures that a new encryption key can resolve.
    ///
    /// This is the only classification the protected-command retry loop
    /// looks at.
    pub fn is_key_error(&self) -> bool {
        matches!(self, Self::InvalidKey | Self::MissingKey(_))
    }
}
