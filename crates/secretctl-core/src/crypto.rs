//! Cryptographic primitives for `secretctl`.
//!
//! Provides Argon2id master-key derivation, HKDF-SHA256 subkey splitting,
//! AES-256-GCM authenticated encryption, and zeroize-on-drop key newtypes.
//! All key material is automatically cleared from memory when dropped.
//!
//! # Security model
//!
//! - The master key is derived from the password on each unlock and lives
//!   only in process memory.
//! - Every encryption generates a fresh 96-bit nonce via `OsRng`.
//! - Ciphertext format: `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
//! - Subkeys are split from the master with HKDF-SHA256 under fixed,
//!   purpose-specific info strings. Changing any KDF parameter is a vault
//!   format break.
//! - Decryption failures are uniform: wrong key, tampering, and truncation
//!   all surface as the same [`CryptoError::AuthFailure`].

use std::fmt;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Length of the random salt persisted at vault creation.
pub const SALT_LEN: usize = 16;

/// Nonce length for AES-256-GCM (96 bits).
const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length (128 bits).
const TAG_LEN: usize = 16;

/// Minimum ciphertext length: nonce + tag.
const MIN_CIPHERTEXT_LEN: usize = NONCE_LEN + TAG_LEN;

/// Argon2id memory cost in KiB (64 MiB).
pub const ARGON2_MEMORY_KIB: u32 = 64 * 1024;

/// Argon2id iteration count.
pub const ARGON2_ITERATIONS: u32 = 3;

/// Argon2id lane count.
pub const ARGON2_PARALLELISM: u32 = 4;

/// HKDF info string for the record-encryption subkey.
pub const INFO_RECORD: &[u8] = b"secretctl/record-encryption/v1";

/// HKDF info string for the audit-chain HMAC subkey.
pub const INFO_AUDIT: &[u8] = b"secretctl/audit-hmac/v1";

/// HKDF info string for the key-name HMAC subkey.
pub const INFO_KEY_NAME: &[u8] = b"secretctl/key-name-hmac/v1";

/// A 256-bit key that is zeroized on drop.
///
/// Used for the master key and every HKDF-derived subkey. The inner bytes
/// are never exposed in `Debug` output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; 32]);

impl SecretKey {
    /// Wrap raw key bytes, zeroizing the caller's copy.
    #[must_use]
    pub fn from_bytes(mut bytes: [u8; 32]) -> Self {
        let key = Self(bytes);
        bytes.zeroize();
        key
    }

    /// Generate a random key from the OS CSPRNG. Test helper — production
    /// keys come from [`derive_master`] and [`derive_sub`].
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    /// Borrow the raw key bytes.
    ///
    /// Use with care — the caller must not log or persist these bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random vault salt.
#[must_use]
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive the master key from the password and vault salt with Argon2id.
///
/// Deterministic in (password, salt). The parameters are format constants —
/// changing them breaks every existing vault.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if the Argon2 computation fails.
pub fn derive_master(password: &[u8], salt: &[u8; SALT_LEN]) -> Result<SecretKey, CryptoError> {
    let params = Params::new(ARGON2_MEMORY_KIB, ARGON2_ITERATIONS, ARGON2_PARALLELISM, Some(32))
        .map_err(|e| CryptoError::KeyDerivation {
            context: "argon2id-params".to_owned(),
            reason: e.to_string(),
        })?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut out = [0u8; 32];
    argon
        .hash_password_into(password, salt, &mut out)
        .map_err(|e| CryptoError::KeyDerivation {
            context: "argon2id".to_owned(),
            reason: e.to_string(),
        })?;
    Ok(SecretKey::from_bytes(out))
}

/// Split a purpose-specific subkey from the master key with HKDF-SHA256.
///
/// The `info` string must be one of the fixed `INFO_*` constants — each
/// consumer gets its own domain-separated key.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if HKDF expansion fails (only
/// possible if the output length exceeded 255 × hash length).
pub fn derive_sub(master: &SecretKey, info: &[u8]) -> Result<SecretKey, CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, master.as_bytes());
    let mut derived = [0u8; 32];
    hk.expand(info, &mut derived)
        .map_err(|e| CryptoError::KeyDerivation {
            context: String::from_utf8_lossy(info).into_owned(),
            reason: e.to_string(),
        })?;
    Ok(SecretKey::from_bytes(derived))
}

/// Encrypt plaintext with AES-256-GCM under a fresh random nonce.
///
/// Returns `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
pub fn encrypt(key: &SecretKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::Encryption {
            reason: e.to_string(),
        })?;

    // nonce || ciphertext (tag appended by aes-gcm)
    let mut combined = Vec::with_capacity(NONCE_LEN.saturating_add(ciphertext.len()));
    combined.extend_from_slice(&nonce);
    combined.extend_from_slice(&ciphertext);
    Ok(combined)
}

/// Decrypt ciphertext produced by [`encrypt`].
///
/// The plaintext comes back in a [`Zeroizing`] buffer so it is wiped when
/// the caller drops it.
///
/// # Errors
///
/// Returns [`CryptoError::AuthFailure`] for every failure mode — wrong key,
/// modified or truncated ciphertext, or input shorter than nonce + tag.
/// The cases are indistinguishable on purpose.
pub fn decrypt(key: &SecretKey, combined: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if combined.len() < MIN_CIPHERTEXT_LEN {
        return Err(CryptoError::AuthFailure);
    }

    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    cipher
        .decrypt(nonce, ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::AuthFailure)
}

/// HMAC-SHA256 of `data` under `key`, hex-encoded.
///
/// Used for the audit chain and for privacy-preserving key-name hashing.
#[must_use]
#[allow(clippy::missing_panics_doc)]
pub fn hmac_sha256_hex(key: &SecretKey, data: &[u8]) -> String {
    #[allow(clippy::unwrap_used)]
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
        // SAFETY: HMAC-SHA256 accepts any key length — this never fails.
        .unwrap();
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// Mask a value for read-only introspection.
///
/// All asterisks for ≤4 characters; the last two characters visible for
/// 5–8; the last four for ≥9.
#[must_use]
pub fn mask_value(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    let len = chars.len();
    let visible = match len {
        0..=4 => 0,
        5..=8 => 2,
        _ => 4,
    };
    let mut masked = "*".repeat(len - visible);
    masked.extend(&chars[len - visible..]);
    masked
}
