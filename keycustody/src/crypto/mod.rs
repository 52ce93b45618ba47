//! Key material cryptography
//!
//! The custody layer never performs the Diffie-Hellman or ratchet steps
//! itself. It only needs to:
//!
//! - **codec**: wrap private key bytes at rest under a human secret, and seal
//!   transient private halves held in the cache
//! - **keys**: generate identity and pre-key material and sign pre-keys
//!
//! ```rust,ignore
//! use keycustody::crypto::{HumanSecret, KeyMaterialCodec};
//!
//! let codec = KeyMaterialCodec::default();
//! let secret = HumanSecret::new("operator passphrase");
//! let blob = codec.wrap(&private_key, &secret)?;
//! let private_key = codec.unwrap(&blob, &secret)?;
//! ```

pub mod codec;
pub mod errors;
pub mod keys;

pub use codec::{constant_time_eq, HumanSecret, KeyMaterialCodec, TransientSealer, WrappedKey};
pub use errors::{CryptoError, CryptoResult};
pub use keys::{
    fingerprint, verify_signature, Curve25519KeyPair, IdentityKeyPair, KeyGenerator, PreKeyPair,
    SignedPreKeyPair,
};
