//! Key Material Codec
//!
//! Encryption-at-rest for private key bytes. A wrapping key is derived from a
//! human secret with PBKDF2-HMAC-SHA256 and a fresh random salt, expanded with
//! HKDF, and used for AES-256-GCM. The derivation parameters travel in the
//! blob header, which is authenticated as associated data:
//!
//! ```text
//! version (1) | iterations (4, BE) | salt (16) | nonce (12) | ciphertext + tag
//! ```
//!
//! Every failure to unwrap is reported as [`CryptoError::AuthenticationFailed`],
//! whether the secret was wrong or the blob was tampered with.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::errors::{CryptoError, CryptoResult};

/// PBKDF2 iteration count for new blobs (OWASP guidance for HMAC-SHA256)
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 600_000;

/// Upper bound for a configured iteration count
pub const MAX_PBKDF2_ITERATIONS: u32 = 10_000_000;

/// A blob header may ask for at most this multiple of the configured count.
/// The header is only authenticated after derivation.
pub const UNWRAP_ITERATION_HEADROOM: u32 = 4;

const BLOB_VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = 1 + 4 + SALT_LEN + NONCE_LEN;
const WRAP_INFO: &[u8] = b"keycustody key-wrap v1";

/// A human-supplied secret (passphrase or operator key) used to derive
/// wrapping keys. Zeroized on drop and never printed.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop, Deserialize)]
#[serde(transparent)]
pub struct HumanSecret(String);

impl HumanSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn expose(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for HumanSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HumanSecret(<redacted>)")
    }
}

/// Opaque output of [`KeyMaterialCodec::wrap`]
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WrappedKey(Vec<u8>);

impl WrappedKey {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for WrappedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WrappedKey({} bytes)", self.0.len())
    }
}

/// Wraps and unwraps private key bytes under a human secret
#[derive(Debug, Clone)]
pub struct KeyMaterialCodec {
    iterations: u32,
}

impl Default for KeyMaterialCodec {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_PBKDF2_ITERATIONS,
        }
    }
}

impl KeyMaterialCodec {
    /// Create a codec that wraps new blobs with `iterations` PBKDF2 rounds.
    ///
    /// Unwrapping always honours the count recorded in the blob, so the
    /// value can be re-tuned without breaking existing ciphertext.
    pub fn new(iterations: u32) -> CryptoResult<Self> {
        if iterations == 0 || iterations > MAX_PBKDF2_ITERATIONS {
            return Err(CryptoError::InvalidParameters(format!(
                "PBKDF2 iterations must be in 1..={}, got {}",
                MAX_PBKDF2_ITERATIONS, iterations
            )));
        }
        Ok(Self { iterations })
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Largest iteration count [`unwrap`](Self::unwrap) will derive with
    pub fn max_unwrap_iterations(&self) -> u32 {
        self.iterations.saturating_mul(UNWRAP_ITERATION_HEADROOM)
    }

    /// Encrypt `secret` under a key derived from `human_secret`
    pub fn wrap(&self, secret: &[u8], human_secret: &HumanSecret) -> CryptoResult<WrappedKey> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce);

        let mut blob = Vec::with_capacity(HEADER_LEN + secret.len() + TAG_LEN);
        blob.push(BLOB_VERSION);
        blob.extend_from_slice(&self.iterations.to_be_bytes());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&nonce);

        let key = derive_wrapping_key(human_secret.expose(), &salt, self.iterations)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]));
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: secret,
                    aad: &blob[..HEADER_LEN],
                },
            )
            .map_err(|_| CryptoError::EncryptionError("AES-GCM seal failed".to_string()))?;

        blob.extend_from_slice(&ciphertext);
        Ok(WrappedKey(blob))
    }

    /// Decrypt a blob produced by [`wrap`](Self::wrap). Blobs recorded with
    /// more than [`max_unwrap_iterations`](Self::max_unwrap_iterations) rounds
    /// are rejected before any derivation.
    pub fn unwrap(
        &self,
        blob: &WrappedKey,
        human_secret: &HumanSecret,
    ) -> CryptoResult<Zeroizing<Vec<u8>>> {
        let bytes = blob.as_bytes();
        if bytes.len() < HEADER_LEN + TAG_LEN || bytes[0] != BLOB_VERSION {
            return Err(CryptoError::AuthenticationFailed);
        }

        let mut iterations = [0u8; 4];
        iterations.copy_from_slice(&bytes[1..5]);
        let iterations = u32::from_be_bytes(iterations);
        if iterations == 0 || iterations > self.max_unwrap_iterations() {
            return Err(CryptoError::AuthenticationFailed);
        }

        let salt = &bytes[5..5 + SALT_LEN];
        let nonce = &bytes[5 + SALT_LEN..HEADER_LEN];

        let key = derive_wrapping_key(human_secret.expose(), salt, iterations)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]));
        let plaintext = cipher.decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: &bytes[HEADER_LEN..],
                aad: &bytes[..HEADER_LEN],
            },
        )?;

        Ok(Zeroizing::new(plaintext))
    }
}

fn derive_wrapping_key(
    secret: &[u8],
    salt: &[u8],
    iterations: u32,
) -> CryptoResult<Zeroizing<[u8; KEY_LEN]>> {
    let mut stretched = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(secret, salt, iterations, &mut stretched[..]);

    let hkdf = Hkdf::<Sha256>::new(Some(salt), &stretched[..]);
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    hkdf.expand(WRAP_INFO, &mut key[..])
        .map_err(|_| CryptoError::InvalidParameters("HKDF output length".to_string()))?;
    Ok(key)
}

/// Constant-time comparison for secrets, keys and fingerprints
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Seals short-lived private material held only in the cache tier.
///
/// The key is drawn at process start and never persisted, so sealed entries
/// become unreadable once the process exits.
#[derive(Clone)]
pub struct TransientSealer {
    cipher: Aes256Gcm,
}

impl TransientSealer {
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut key[..]);
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..])),
        }
    }

    pub fn seal(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionError("AES-GCM seal failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8]) -> CryptoResult<Zeroizing<Vec<u8>>> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::AuthenticationFailed);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self.cipher.decrypt(Nonce::from_slice(nonce), ciphertext)?;
        Ok(Zeroizing::new(plaintext))
    }
}

impl fmt::Debug for TransientSealer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransientSealer(<redacted>)")
    }
}
