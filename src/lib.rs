//! # heimdell
//!
//! Credential storage, encryption and multi-environment switching for the
//! Heimdell over-the-air update CLI.
//!
//! Credentials live in a project-local store at `{project}/.heimdell`. Each
//! named environment owns its own credentials file, and the canonical
//! `credentials.json` points at whichever environment is active. Any file
//! may be encrypted under a user passphrase; protected commands prompt for
//! the passphrase once per shell session.
//!
//! ## Public API
//!
//! - `store`: read and write credential documents of either shape
//! - `crypto`: the passphrase cipher behind encrypted files
//! - `environment`: environment naming and switching
//! - `loader`: resolving credentials for a command, with key prompting
//! - `session`: the per-shell key cache
//!
//! Key derivation is internal to `crypto`.

pub mod config;
pub mod crypto;
pub mod environment;
pub mod error;
pub(crate) mod keys;
pub mod loader;
pub mod prompt;
pub mod session;
pub mod store;

pub use config::{Layout, ProjectConfig};
pub use crypto::EncryptedEnvelope;
pub use environment::{EnvironmentManager, PointerMode, SwitchOutcome};
pub use error::{HeimdellError, Result};
pub use loader::{
    autoload_credentials, execute_protected_command, load_credentials, CredentialLoader, Session,
};
pub use prompt::{KeyPrompt, TerminalPrompt};
pub use session::{KeyCache, MemoryKeyCache, SessionKeyCache};
pub use store::{Credentials, Platform};
