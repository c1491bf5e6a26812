//! Secret cipher: authenticated encryption of credential documents.
//!
//! All other modules encrypt and decrypt exclusively through the two
//! functions exposed here, `encrypt` and `decrypt`.
//!
//! Primitive choices:
//! - **Cipher**: AES-256-GCM with a 128-bit (16 byte) IV
//! - **Key**: PBKDF2-HMAC-SHA256 over the passphrase, see `keys`
//! - **Salt**: 256 bits, fresh per encryption
//! - **Associated data**: the constant `heimdell-credentials`
//! - **Encoding**: lowercase hex for every binary field
//!
//! The 16-byte IV is part of the on-disk format, so GCM runs with its
//! GHASH-derived counter block rather than the 12-byte fast path.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HeimdellError, Result};
use crate::keys::{self, SALT_LEN};

/// AES-256-GCM parameterised with a 16-byte nonce.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

/// Size of the IV in bytes.
pub const IV_LEN: usize = 16;

/// Size of the GCM authentication tag in bytes.
pub const TAG_LEN: usize = 16;

/// Associated data bound into every envelope.
pub const ASSOCIATED_DATA: &[u8] = b"heimdell-credentials";

/// Field names of the envelope, in on-disk order.
const ENVELOPE_FIELDS: [&str; 4] = ["encrypted", "iv", "tag", "salt"];

/// The on-disk form of an encrypted credential document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// Hex ciphertext, without the tag.
    pub encrypted: String,
    /// Hex IV, 16 bytes.
    pub iv: String,
    /// Hex GCM authentication tag, 16 bytes.
    pub tag: String,
    /// Hex PBKDF2 salt, 32 bytes.
    pub salt: String,
}

impl EncryptedEnvelope {
    /// Interpret a parsed JSON value as an envelope.
    ///
    /// Returns `None` unless the value is an object with exactly the four
    /// envelope keys, each a hex string of the right length. Anything else
    /// is treated as a plaintext document by the caller.
    pub fn from_json(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        if object.len() != ENVELOPE_FIELDS.len() {
            return None;
        }

        let field = |name: &str| -> Option<String> {
            object.get(name)?.as_str().map(str::to_owned)
        };
        let envelope = Self {
            encrypted: field("encrypted")?,
            iv: field("iv")?,
            tag: field("tag")?,
            salt: field("salt")?,
        };

        envelope.decode().ok().map(|_| envelope)
    }

    /// Decode every field from hex and check fixed lengths.
    fn decode(&self) -> Result<RawEnvelope> {
        let ciphertext = hex::decode(&self.encrypted).map_err(|_| HeimdellError::InvalidKey)?;
        let iv: [u8; IV_LEN] = decode_fixed(&self.iv)?;
        let tag: [u8; TAG_LEN] = decode_fixed(&self.tag)?;
        let salt: [u8; SALT_LEN] = decode_fixed(&self.salt)?;

        if ciphertext.is_empty() {
            return Err(HeimdellError::InvalidKey);
        }

        Ok(RawEnvelope {
            ciphertext,
            iv,
            tag,
            salt,
        })
    }
}

struct RawEnvelope {
    ciphertext: Vec<u8>,
    iv: [u8; IV_LEN],
    tag: [u8; TAG_LEN],
    salt: [u8; SALT_LEN],
}

fn decode_fixed<const N: usize>(field: &str) -> Result<[u8; N]> {
    hex::decode(field)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(HeimdellError::InvalidKey)
}

/// Fill a fixed-size buffer from the system CSPRNG.
///
/// `ring::rand::SystemRandom` is the only source of randomness in the crate.
fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let rng = SystemRandom::new();
    let mut buf = [0u8; N];
    rng.fill(&mut buf).map_err(|_| HeimdellError::Randomness)?;
    Ok(buf)
}

fn cipher_for(passphrase: &str, salt: &[u8]) -> Result<Aes256Gcm16> {
    let key = keys::derive_key(passphrase, salt)?;
    Aes256Gcm16::new_from_slice(key.as_bytes()).map_err(|_| HeimdellError::KeyDerivation)
}

/// Encrypt `plaintext` under `passphrase`.
///
/// A fresh salt and IV are drawn for every call, so encrypting the same
/// plaintext twice never yields the same envelope.
pub fn encrypt(plaintext: &str, passphrase: &str) -> Result<EncryptedEnvelope> {
    let salt: [u8; SALT_LEN] = random_bytes()?;
    let iv: [u8; IV_LEN] = random_bytes()?;
    let cipher = cipher_for(passphrase, &salt)?;

    let payload = Payload {
        msg: plaintext.as_bytes(),
        aad: ASSOCIATED_DATA,
    };
    let mut sealed = cipher
        .encrypt(Nonce::<U16>::from_slice(&iv), payload)
        .map_err(|_| HeimdellError::EncryptionFailure)?;

    // `aes-gcm` appends the tag; the envelope stores it separately.
    let tag = sealed.split_off(sealed.len() - TAG_LEN);

    Ok(EncryptedEnvelope {
        encrypted: hex::encode(sealed),
        iv: hex::encode(iv),
        tag: hex::encode(tag),
        salt: hex::encode(salt),
    })
}

/// Decrypt an envelope with `passphrase`.
///
/// A wrong passphrase, a modified field or a corrupt encoding all fail the
/// GCM check and return `InvalidKey`. No partial plaintext is returned.
pub fn decrypt(envelope: &EncryptedEnvelope, passphrase: &str) -> Result<String> {
    let raw = envelope.decode()?;
    let cipher = cipher_for(passphrase, &raw.salt)?;

    let mut sealed = raw.ciphertext;
    sealed.extend_from_slice(&raw.tag);

    let payload = Payload {
        msg: &sealed,
        aad: ASSOCIATED_DATA,
    };
    let plaintext = cipher
        .decrypt(Nonce::<U16>::from_slice(&raw.iv), payload)
        .map_err(|_| HeimdellError::InvalidKey)?;

    String::from_utf8(plaintext)
        .map_err(|_| HeimdellError::malformed("<envelope>", "decrypted payload is not UTF-8"))
}
