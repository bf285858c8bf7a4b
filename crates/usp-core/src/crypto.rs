//! Cryptographic primitives for USP.
//!
//! Provides AES-256-GCM authenticated encryption with associated data,
//! HKDF-SHA256 subkey derivation, and a zeroize-on-drop key newtype. All key
//! material is cleared from memory when dropped.
//!
//! # Security model
//!
//! - Every encryption generates a fresh 96-bit nonce from the OS CSPRNG.
//!   A CSPRNG failure aborts the process rather than degrading to weaker
//!   randomness.
//! - Associated data carries a domain-separation string so a blob encrypted
//!   for one purpose (`kv|v2|<path>|<version>`) can never be replayed into
//!   another (`transit|<key>|<version>`).
//! - Wire AEAD format: `nonce (12) || ciphertext || tag (16)`.
//! - At-rest field format: a leading format-version byte, then the wire
//!   format, so the algorithm can be upgraded without a migration flag day.
//! - Subkey derivation uses HKDF-SHA256 with a unique `info` per purpose.

use std::fmt;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Nonce length for AES-256-GCM (96 bits).
pub const NONCE_LEN: usize = 12;

/// Tag length for AES-256-GCM (128 bits).
pub const TAG_LEN: usize = 16;

/// Minimum wire ciphertext length: nonce + tag.
const MIN_CIPHERTEXT_LEN: usize = NONCE_LEN + TAG_LEN;

/// Current at-rest blob format version.
const BLOB_VERSION: u8 = 0x01;

/// A 256-bit symmetric key that is zeroized on drop.
///
/// Used for the KEK, the DMK, and every HKDF-derived subkey. The inner bytes
/// are never exposed in `Debug` output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Create a key from a byte slice.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if the slice is not 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: 32,
                actual: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    /// Generate a new random key using the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&key);
        Self(bytes)
    }

    /// Borrow the raw key bytes.
    ///
    /// Use with care — the caller must not log or persist these bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Encrypt plaintext with AES-256-GCM, binding the associated data.
///
/// Returns the wire format `nonce (12) || ciphertext || tag (16)`.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
pub fn encrypt_aead(
    key: &EncryptionKey,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::Encryption {
            reason: e.to_string(),
        })?;

    // nonce || ciphertext (tag appended by aes-gcm)
    let mut combined = Vec::with_capacity(NONCE_LEN.saturating_add(ciphertext.len()));
    combined.extend_from_slice(&nonce);
    combined.extend_from_slice(&ciphertext);
    Ok(combined)
}

/// Decrypt the wire format produced by [`encrypt_aead`].
///
/// The same associated data used at encryption time must be supplied.
///
/// # Errors
///
/// Returns [`CryptoError::CiphertextTooShort`] if the input cannot contain a
/// nonce + tag, and [`CryptoError::DecryptionFailed`] if authentication
/// fails (wrong key, wrong associated data, corrupted data, tampered tag).
pub fn decrypt_aead(
    key: &EncryptionKey,
    combined: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if combined.len() < MIN_CIPHERTEXT_LEN {
        return Err(CryptoError::CiphertextTooShort {
            expected: MIN_CIPHERTEXT_LEN,
            actual: combined.len(),
        });
    }

    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|e| CryptoError::DecryptionFailed {
            reason: e.to_string(),
        })
}

/// Encrypt a field for persistence: a format-version byte followed by the
/// wire format.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
pub fn seal_field(
    key: &EncryptionKey,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let wire = encrypt_aead(key, plaintext, aad)?;
    let mut blob = Vec::with_capacity(wire.len().saturating_add(1));
    blob.push(BLOB_VERSION);
    blob.extend_from_slice(&wire);
    Ok(blob)
}

/// Decrypt a persisted field produced by [`seal_field`].
///
/// # Errors
///
/// Returns [`CryptoError::UnsupportedBlobVersion`] if the leading byte is
/// not a known format version, plus the failure modes of [`decrypt_aead`].
pub fn open_field(key: &EncryptionKey, blob: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let (&version, wire) = blob.split_first().ok_or(CryptoError::CiphertextTooShort {
        expected: MIN_CIPHERTEXT_LEN + 1,
        actual: 0,
    })?;
    if version != BLOB_VERSION {
        return Err(CryptoError::UnsupportedBlobVersion { version });
    }
    decrypt_aead(key, wire, aad)
}

/// Derive a purpose-bound subkey from a root key using HKDF-SHA256.
///
/// The `info` string must be unique per purpose (e.g. `b"secret"`,
/// `b"transit:payments"`, `b"audit"`).
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if HKDF expansion fails (only
/// possible if output length exceeds 255 * hash length).
pub fn derive_key(
    root_key: &EncryptionKey,
    salt: Option<&[u8]>,
    info: &[u8],
) -> Result<EncryptionKey, CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, root_key.as_bytes());
    let mut derived = [0u8; 32];
    hk.expand(info, &mut derived)
        .map_err(|e| CryptoError::KeyDerivation {
            purpose: String::from_utf8_lossy(info).into_owned(),
            reason: e.to_string(),
        })?;
    Ok(EncryptionKey::from_bytes(derived))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = EncryptionKey::generate();
        let plaintext = b"secret data";
        let aad = b"kv|v2|app/db|1";
        let ciphertext = encrypt_aead(&key, plaintext, aad).unwrap();
        let decrypted = decrypt_aead(&key, &ciphertext, aad).unwrap();
        assert_eq!(plaintext.as_slice(), decrypted.as_slice());
    }

    #[test]
    fn decrypt_with_wrong_aad_fails() {
        let key = EncryptionKey::generate();
        let ciphertext = encrypt_aead(&key, b"secret", b"kv|v2|app/db|1").unwrap();
        let result = decrypt_aead(&key, &ciphertext, b"kv|v2|app/db|2");
        assert!(matches!(result, Err(CryptoError::DecryptionFailed { .. })));
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let key1 = EncryptionKey::generate();
        let key2 = EncryptionKey::generate();
        let ciphertext = encrypt_aead(&key1, b"secret", b"ctx").unwrap();
        let result = decrypt_aead(&key2, &ciphertext, b"ctx");
        assert!(matches!(result, Err(CryptoError::DecryptionFailed { .. })));
    }

    #[test]
    fn decrypt_too_short_fails() {
        let key = EncryptionKey::generate();
        let result = decrypt_aead(&key, &[0u8; 10], b"");
        assert!(matches!(
            result,
            Err(CryptoError::CiphertextTooShort {
                expected: 28,
                actual: 10
            })
        ));
    }

    #[test]
    fn decrypt_tampered_ciphertext_fails() {
        let key = EncryptionKey::generate();
        let mut ciphertext = encrypt_aead(&key, b"secret", b"ctx").unwrap();
        if let Some(byte) = ciphertext.get_mut(NONCE_LEN) {
            *byte ^= 0xFF;
        }
        let result = decrypt_aead(&key, &ciphertext, b"ctx");
        assert!(matches!(result, Err(CryptoError::DecryptionFailed { .. })));
    }

    #[test]
    fn two_encryptions_produce_different_ciphertext() {
        let key = EncryptionKey::generate();
        let ct1 = encrypt_aead(&key, b"same data", b"ctx").unwrap();
        let ct2 = encrypt_aead(&key, b"same data", b"ctx").unwrap();
        assert_ne!(ct1, ct2);
    }

    #[test]
    fn sealed_field_leads_with_version_byte() {
        let key = EncryptionKey::generate();
        let blob = seal_field(&key, b"data", b"ctx").unwrap();
        assert_eq!(blob[0], 0x01);
        let plaintext = open_field(&key, &blob, b"ctx").unwrap();
        assert_eq!(plaintext, b"data");
    }

    #[test]
    fn open_field_rejects_unknown_version() {
        let key = EncryptionKey::generate();
        let mut blob = seal_field(&key, b"data", b"ctx").unwrap();
        blob[0] = 0x7F;
        let result = open_field(&key, &blob, b"ctx");
        assert!(matches!(
            result,
            Err(CryptoError::UnsupportedBlobVersion { version: 0x7F })
        ));
    }

    #[test]
    fn open_field_rejects_empty_blob() {
        let key = EncryptionKey::generate();
        let result = open_field(&key, &[], b"ctx");
        assert!(matches!(result, Err(CryptoError::CiphertextTooShort { .. })));
    }

    #[test]
    fn derive_key_is_deterministic() {
        let root = EncryptionKey::generate();
        let k1 = derive_key(&root, None, b"secret").unwrap();
        let k2 = derive_key(&root, None, b"secret").unwrap();
        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn derive_key_distinct_per_purpose() {
        let root = EncryptionKey::generate();
        let k1 = derive_key(&root, None, b"secret").unwrap();
        let k2 = derive_key(&root, None, b"transit:payments").unwrap();
        let k3 = derive_key(&root, None, b"audit").unwrap();
        assert_ne!(k1.as_bytes(), k2.as_bytes());
        assert_ne!(k2.as_bytes(), k3.as_bytes());
    }

    #[test]
    fn derive_key_salt_changes_output() {
        let root = EncryptionKey::generate();
        let k1 = derive_key(&root, Some(b"a"), b"secret").unwrap();
        let k2 = derive_key(&root, Some(b"b"), b"secret").unwrap();
        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn from_slice_rejects_wrong_length() {
        let result = EncryptionKey::from_slice(&[0u8; 16]);
        assert!(matches!(
            result,
            Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 16
            })
        ));
    }

    #[test]
    fn encryption_key_debug_redacts_bytes() {
        let key = EncryptionKey::generate();
        let debug = format!("{key:?}");
        assert!(debug.contains("[REDACTED]"));
    }
}
