//! Key types and generation
//!
//! This module defines the key material the custody layer handles:
//! - Identity keys (Ed25519) for long-term identity and signing pre-keys
//! - Curve25519 keys for signed and one-time pre-keys
//! - [`KeyGenerator`], which produces new material and wraps custodial
//!   identity private keys through the [`KeyMaterialCodec`]

use std::fmt;

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::Rng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::crypto::codec::{HumanSecret, KeyMaterialCodec, WrappedKey};
use crate::crypto::errors::{CryptoError, CryptoResult};

/// Length of every public and private key handled here
pub const KEY_LEN: usize = 32;

/// Ed25519 signature length
pub const SIGNATURE_LEN: usize = 64;

/// Registration ids live in a 14-bit space; zero is reserved
pub const MAX_REGISTRATION_ID: u32 = 0x3FFF;

/// Pre-key ids are 24-bit, as in the Signal wire format
pub const MAX_KEY_ID: u32 = 0x00FF_FFFF;

fn to_key_array(bytes: &[u8], what: &str) -> CryptoResult<[u8; KEY_LEN]> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("{} must be {} bytes", what, KEY_LEN)))
}

/// Long-term identity key pair (Ed25519)
pub struct IdentityKeyPair {
    public: VerifyingKey,
    secret: SigningKey,
}

impl IdentityKeyPair {
    /// Generate a new random identity key pair
    pub fn generate() -> Self {
        let secret = SigningKey::generate(&mut OsRng);
        let public = secret.verifying_key();
        Self { public, secret }
    }

    /// Restore from the 32-byte secret seed
    pub fn from_secret_bytes(secret_bytes: &[u8]) -> CryptoResult<Self> {
        let seed = Zeroizing::new(to_key_array(secret_bytes, "Identity secret key")?);
        let secret = SigningKey::from_bytes(&seed);
        let public = secret.verifying_key();
        Ok(Self { public, secret })
    }

    /// Sign a message with this identity key
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.secret.sign(message).to_bytes().to_vec()
    }

    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public.as_bytes().to_vec()
    }

    /// Secret seed, for wrapping before storage
    pub fn secret_key_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.secret.to_bytes().to_vec())
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(self.public.as_bytes())
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Short hex fingerprint of a public key, for display and logs
pub fn fingerprint(public_key: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let hash = Sha256::digest(public_key);
    hex::encode(&hash[..8])
}

/// Verify an Ed25519 signature made by an identity key
pub fn verify_signature(
    identity_public: &[u8],
    message: &[u8],
    signature: &[u8],
) -> CryptoResult<()> {
    let public = VerifyingKey::from_bytes(&to_key_array(identity_public, "Identity public key")?)?;
    let signature = Signature::from_slice(signature)?;
    public.verify(message, &signature)?;
    Ok(())
}

/// Curve25519 key pair used for signed and one-time pre-keys
pub struct Curve25519KeyPair {
    public: PublicKey,
    secret: StaticSecret,
}

impl Curve25519KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { public, secret }
    }

    pub fn from_secret_bytes(secret_bytes: &[u8]) -> CryptoResult<Self> {
        let secret = StaticSecret::from(to_key_array(secret_bytes, "Curve25519 private key")?);
        let public = PublicKey::from(&secret);
        Ok(Self { public, secret })
    }

    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public.as_bytes().to_vec()
    }

    pub fn secret_key_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.secret.to_bytes().to_vec())
    }
}

/// Random registration id in `1..=MAX_REGISTRATION_ID`
pub fn generate_registration_id() -> u32 {
    OsRng.gen_range(1..=MAX_REGISTRATION_ID)
}

/// One-time pre-key with its private half
#[derive(Clone)]
pub struct PreKeyPair {
    pub key_id: u32,
    pub public_key: Vec<u8>,
    pub private_key: Zeroizing<Vec<u8>>,
}

impl PreKeyPair {
    pub fn generate(key_id: u32) -> Self {
        let pair = Curve25519KeyPair::generate();
        Self {
            key_id,
            public_key: pair.public_key_bytes(),
            private_key: pair.secret_key_bytes(),
        }
    }
}

impl fmt::Debug for PreKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreKeyPair")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// Signed pre-key with its private half and identity signature
#[derive(Clone)]
pub struct SignedPreKeyPair {
    pub key_id: u32,
    pub public_key: Vec<u8>,
    pub private_key: Zeroizing<Vec<u8>>,
    pub signature: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl SignedPreKeyPair {
    /// Generate a new signed pre-key and sign its public half
    pub fn generate(key_id: u32, identity: &IdentityKeyPair) -> Self {
        let pair = Curve25519KeyPair::generate();
        let public_key = pair.public_key_bytes();
        let signature = identity.sign(&public_key);
        Self {
            key_id,
            public_key,
            private_key: pair.secret_key_bytes(),
            signature,
            created_at: Utc::now(),
        }
    }
}

impl fmt::Debug for SignedPreKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedPreKeyPair")
            .field("key_id", &self.key_id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Freshly generated custodial identity
#[derive(Debug, Clone)]
pub struct GeneratedIdentity {
    pub public_key: Vec<u8>,
    pub wrapped_private_key: WrappedKey,
    pub registration_id: u32,
}

/// Codec-backed key generator used by onboarding and the scheduler
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    codec: KeyMaterialCodec,
    secret: HumanSecret,
}

impl KeyGenerator {
    pub fn new(codec: KeyMaterialCodec, secret: HumanSecret) -> Self {
        Self { codec, secret }
    }

    pub fn codec(&self) -> &KeyMaterialCodec {
        &self.codec
    }

    /// Generate an identity whose private half is wrapped for storage
    pub fn generate_identity(&self) -> CryptoResult<GeneratedIdentity> {
        let identity = IdentityKeyPair::generate();
        let wrapped_private_key = self.codec.wrap(&identity.secret_key_bytes(), &self.secret)?;
        Ok(GeneratedIdentity {
            public_key: identity.public_key_bytes(),
            wrapped_private_key,
            registration_id: generate_registration_id(),
        })
    }

    /// Recover a custodial identity key pair
    pub fn unwrap_identity(&self, wrapped: &WrappedKey) -> CryptoResult<IdentityKeyPair> {
        let secret = self.codec.unwrap(wrapped, &self.secret)?;
        IdentityKeyPair::from_secret_bytes(&secret)
    }

    /// Generate a signed pre-key signed by the wrapped identity
    pub fn generate_signed_pre_key(
        &self,
        key_id: u32,
        wrapped_identity: &WrappedKey,
    ) -> CryptoResult<SignedPreKeyPair> {
        if key_id > MAX_KEY_ID {
            return Err(CryptoError::KeyGenerationFailed(format!(
                "signed pre-key id {} exceeds {}",
                key_id, MAX_KEY_ID
            )));
        }
        let identity = self.unwrap_identity(wrapped_identity)?;
        Ok(SignedPreKeyPair::generate(key_id, &identity))
    }

    /// Generate `count` one-time pre-keys with consecutive ids from `start_id`
    pub fn generate_one_time_pre_keys(
        &self,
        start_id: u32,
        count: u32,
    ) -> CryptoResult<Vec<PreKeyPair>> {
        let last_id = start_id
            .checked_add(count.saturating_sub(1))
            .filter(|last| *last <= MAX_KEY_ID)
            .ok_or_else(|| {
                CryptoError::KeyGenerationFailed(format!(
                    "one-time pre-key ids {}+{} exceed {}",
                    start_id, count, MAX_KEY_ID
                ))
            })?;

        Ok((start_id..=last_id)
            .take(count as usize)
            .map(PreKeyPair::generate)
            .collect())
    }
}
