//! Passphrase-based key derivation and key ownership.
//!
//! This module owns two responsibilities:
//! 1. Stretching a user passphrase into an AES-256 key with
//!    PBKDF2-HMAC-SHA256.
//! 2. Holding the derived key in a type that is opaque, non-cloneable and
//!    zeroised on drop.
//!
//! Together with `crypto` this is one of exactly two modules that touch
//! `ring`. The derivation lives here because it operates on key material,
//! not on ciphertexts.
//!
//! ## Derivation parameters
//!
//! ```text
//! PBKDF2-HMAC-SHA256(
//!     password   = passphrase (UTF-8 bytes),
//!     salt       = 32 random bytes stored in the envelope,
//!     iterations = 100_000,
//!     dkLen      = 32
//! )
//! ```
//!
//! These parameters are part of the on-disk format. Changing any of them
//! makes existing envelopes undecryptable.

use std::num::NonZeroU32;

use ring::pbkdf2;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{HeimdellError, Result};

/// Size of a derived key in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// Size of the per-envelope salt in bytes.
pub const SALT_LEN: usize = 32;

/// PBKDF2 iteration count.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// A key derived from a passphrase and a salt.
///
/// - Not `Clone`. Each key is scoped to one encrypt or decrypt call.
/// - Zeroised on drop.
/// - Raw bytes never leave the crate.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey {
    bytes: [u8; KEY_LEN],
}

impl DerivedKey {
    /// Borrow the raw key bytes for use in encrypt/decrypt operations.
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

/// Derive the envelope key for `passphrase` under `salt`.
///
/// Deliberately slow: one call costs 100k HMAC-SHA256 rounds. The same
/// passphrase and salt always produce the same key.
pub(crate) fn derive_key(passphrase: &str, salt: &[u8]) -> Result<DerivedKey> {
    let iterations = NonZeroU32::new(PBKDF2_ITERATIONS).ok_or(HeimdellError::KeyDerivation)?;

    let mut bytes = [0u8; KEY_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        passphrase.as_bytes(),
        &mut bytes,
    );

    Ok(DerivedKey { bytes })
}
