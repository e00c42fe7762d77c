//! Passphrase encryption of sync snapshots.
//!
//! A 256-bit key is derived with PBKDF2-HMAC-SHA256 over a random salt and the
//! snapshot JSON is sealed with AES-256-GCM. The envelope carries everything
//! except the passphrase, so any device that knows it can decrypt.

use aes_gcm::aead::{Aead, OsRng, rand_core::RngCore};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::snapshot::{SNAPSHOT_VERSION, SyncSnapshot};

pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 200_000;
/// Envelopes asking for more work than this are rejected before deriving a key.
pub const MAX_PBKDF2_ITERATIONS: u32 = 10_000_000;
pub const ENVELOPE_VERSION: u8 = 1;
const KDF_NAME: &str = "pbkdf2-sha256";
const SALT_LEN: usize = 16;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// Wrong passphrase, tampered data and truncated uploads all look the same.
    #[error("could not decrypt backup: wrong passphrase or corrupted data")]
    Decryption,
    /// The backup opened fine but was written by a newer app.
    #[error("backup format version {found} is newer than this app supports ({supported}); update nutrilog")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("sync passphrase must not be empty")]
    EmptyPassphrase,
    #[error("encryption failed")]
    Encryption,
    #[error("failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoEnvelope {
    pub v: u8,
    pub kdf: String,
    pub iterations: u32,
    pub salt: String,
    pub iv: String,
    pub tag: String,
    pub data: String,
}

#[must_use]
pub fn derive_key(passphrase: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, iterations, &mut key);
    key
}

pub fn encrypt_bytes(
    plaintext: &[u8],
    passphrase: &str,
    iterations: u32,
) -> Result<CryptoEnvelope, CryptoError> {
    if passphrase.is_empty() {
        return Err(CryptoError::EmptyPassphrase);
    }
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let key = derive_key(passphrase, &salt, iterations);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::Encryption)?;
    let sealed = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| CryptoError::Encryption)?;
    if sealed.len() < TAG_LEN {
        return Err(CryptoError::Encryption);
    }
    let (data, tag) = sealed.split_at(sealed.len() - TAG_LEN);

    Ok(CryptoEnvelope {
        v: ENVELOPE_VERSION,
        kdf: KDF_NAME.to_string(),
        iterations,
        salt: B64.encode(salt),
        iv: B64.encode(iv),
        tag: B64.encode(tag),
        data: B64.encode(data),
    })
}

pub fn decrypt_bytes(envelope: &CryptoEnvelope, passphrase: &str) -> Result<Vec<u8>, CryptoError> {
    if passphrase.is_empty() {
        return Err(CryptoError::EmptyPassphrase);
    }
    if envelope.v > ENVELOPE_VERSION {
        return Err(CryptoError::UnsupportedVersion {
            found: u32::from(envelope.v),
            supported: u32::from(ENVELOPE_VERSION),
        });
    }
    if envelope.v == 0
        || envelope.kdf != KDF_NAME
        || envelope.iterations == 0
        || envelope.iterations > MAX_PBKDF2_ITERATIONS
    {
        return Err(CryptoError::Decryption);
    }
    let decode = |value: &str| B64.decode(value).map_err(|_| CryptoError::Decryption);
    let salt = decode(&envelope.salt)?;
    let iv = decode(&envelope.iv)?;
    let tag = decode(&envelope.tag)?;
    let data = decode(&envelope.data)?;
    if iv.len() != IV_LEN || tag.len() != TAG_LEN {
        return Err(CryptoError::Decryption);
    }

    let key = derive_key(passphrase, &salt, envelope.iterations);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::Decryption)?;
    let mut combined = Vec::with_capacity(data.len() + tag.len());
    combined.extend_from_slice(&data);
    combined.extend_from_slice(&tag);
    cipher
        .decrypt(Nonce::from_slice(&iv), combined.as_slice())
        .map_err(|_| CryptoError::Decryption)
}

/// Serialize a snapshot canonically and seal it. Returns the envelope as JSON bytes,
/// ready to upload or write to disk.
pub fn encrypt_snapshot(
    snapshot: &SyncSnapshot,
    passphrase: &str,
    iterations: u32,
) -> Result<Vec<u8>, CryptoError> {
    let mut canonical = snapshot.clone();
    canonical.canonicalize();
    let plaintext = serde_json::to_vec(&canonical)?;
    let envelope = encrypt_bytes(&plaintext, passphrase, iterations)?;
    Ok(serde_json::to_vec(&envelope)?)
}

#[derive(Deserialize)]
struct FormatVersion {
    #[serde(default)]
    version: u32,
}

/// Open an uploaded envelope. A malformed envelope or an unreadable snapshot
/// inside it is a [`CryptoError::Decryption`]; a backup from a newer app is
/// [`CryptoError::UnsupportedVersion`].
pub fn decrypt_snapshot(blob: &[u8], passphrase: &str) -> Result<SyncSnapshot, CryptoError> {
    let envelope: CryptoEnvelope =
        serde_json::from_slice(blob).map_err(|_| CryptoError::Decryption)?;
    let plaintext = decrypt_bytes(&envelope, passphrase)?;
    let format: FormatVersion =
        serde_json::from_slice(&plaintext).map_err(|_| CryptoError::Decryption)?;
    if format.version > SNAPSHOT_VERSION {
        return Err(CryptoError::UnsupportedVersion {
            found: format.version,
            supported: SNAPSHOT_VERSION,
        });
    }
    SyncSnapshot::from_json(&plaintext).map_err(|_| CryptoError::Decryption)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MealEntry, Nutrients};

    const FAST: u32 = 1_000;

    fn snapshot() -> SyncSnapshot {
        let mut s = SyncSnapshot::new(Some("device-a".to_string()));
        s.exported_at = "2024-01-10T12:00:00+00:00".to_string();
        s.entries = vec![
            MealEntry {
                id: "b".to_string(),
                date: "2024-01-10".to_string(),
                meal_type: "lunch".to_string(),
                product_id: None,
                name: "Salad".to_string(),
                amount_g: Some(250.5),
                nutrients: Nutrients {
                    calories: Some(312.25),
                    sodium: Some(0.4),
                    ..Nutrients::default()
                },
                created_at: 1,
                updated_at: 2,
            },
            MealEntry {
                id: "a".to_string(),
                date: "2024-01-09".to_string(),
                meal_type: "dinner".to_string(),
                product_id: Some("p1".to_string()),
                name: "Soup".to_string(),
                amount_g: None,
                nutrients: Nutrients::calories(180.0),
                created_at: 3,
                updated_at: 4,
            },
        ];
        s
    }

    #[test]
    fn test_decrypt_reproduces_canonical_bytes() {
        let original = snapshot();
        let blob = encrypt_snapshot(&original, "correct horse", FAST).unwrap();
        let decrypted = decrypt_snapshot(&blob, "correct horse").unwrap();
        assert_eq!(
            decrypted.to_canonical_json().unwrap(),
            original.to_canonical_json().unwrap()
        );
    }

    #[test]
    fn test_wrong_passphrase_is_decryption_error() {
        let blob = encrypt_snapshot(&snapshot(), "correct horse", FAST).unwrap();
        let err = decrypt_snapshot(&blob, "battery staple").unwrap_err();
        assert!(matches!(err, CryptoError::Decryption));
    }

    #[test]
    fn test_tampered_ciphertext_is_decryption_error() {
        let blob = encrypt_snapshot(&snapshot(), "pw", FAST).unwrap();
        let mut envelope: CryptoEnvelope = serde_json::from_slice(&blob).unwrap();
        let mut data = B64.decode(&envelope.data).unwrap();
        data[0] ^= 0xff;
        envelope.data = B64.encode(data);
        let tampered = serde_json::to_vec(&envelope).unwrap();
        assert!(matches!(
            decrypt_snapshot(&tampered, "pw"),
            Err(CryptoError::Decryption)
        ));
    }

    #[test]
    fn test_garbage_blob_is_decryption_error() {
        assert!(matches!(
            decrypt_snapshot(b"not json at all", "pw"),
            Err(CryptoError::Decryption)
        ));
    }

    #[test]
    fn test_newer_snapshot_version_is_not_a_decryption_error() {
        let mut newer = snapshot();
        newer.version = SNAPSHOT_VERSION + 1;
        let envelope = encrypt_bytes(&serde_json::to_vec(&newer).unwrap(), "pw", FAST).unwrap();
        let blob = serde_json::to_vec(&envelope).unwrap();
        match decrypt_snapshot(&blob, "pw") {
            Err(CryptoError::UnsupportedVersion { found, supported }) => {
                assert_eq!(found, SNAPSHOT_VERSION + 1);
                assert_eq!(supported, SNAPSHOT_VERSION);
            }
            other => panic!("expected UnsupportedVersion, got {other:?}"),
        }
    }

    #[test]
    fn test_newer_envelope_version_is_reported() {
        let mut envelope = encrypt_bytes(b"{}", "pw", FAST).unwrap();
        envelope.v = ENVELOPE_VERSION + 1;
        assert!(matches!(
            decrypt_bytes(&envelope, "pw"),
            Err(CryptoError::UnsupportedVersion { found: 2, .. })
        ));
    }

    #[test]
    fn test_excessive_iterations_rejected_before_key_derivation() {
        let mut envelope = encrypt_bytes(b"{}", "pw", FAST).unwrap();
        envelope.iterations = u32::MAX;
        assert!(matches!(
            decrypt_bytes(&envelope, "pw"),
            Err(CryptoError::Decryption)
        ));
        envelope.iterations = MAX_PBKDF2_ITERATIONS + 1;
        assert!(matches!(
            decrypt_bytes(&envelope, "pw"),
            Err(CryptoError::Decryption)
        ));
    }

    #[test]
    fn test_each_encryption_uses_fresh_salt_and_nonce() {
        let a = encrypt_bytes(b"same", "pw", FAST).unwrap();
        let b = encrypt_bytes(b"same", "pw", FAST).unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.data, b.data);
        assert_eq!(a.iterations, FAST);
    }

    #[test]
    fn test_empty_passphrase_rejected() {
        assert!(matches!(
            encrypt_bytes(b"x", "", FAST),
            Err(CryptoError::EmptyPassphrase)
        ));
    }

    #[test]
    fn test_derive_key_is_deterministic() {
        let salt = [7u8; SALT_LEN];
        assert_eq!(derive_key("pw", &salt, FAST), derive_key("pw", &salt, FAST));
        assert_ne!(derive_key("pw", &salt, FAST), derive_key("pw2", &salt, FAST));
    }
}
