//! Storage callbacks the protocol engine invokes
//!
//! One trait per record family, mirroring the engine's storage surface.
//! Implementations are bound to a single local (user, device).

use async_trait::async_trait;

use crate::crypto::{IdentityKeyPair, PreKeyPair, SignedPreKeyPair};
use crate::error::CustodyResult;
use crate::models::{
    Direction, IdentityTrustRecord, PreKeyConsumption, ProtocolAddress, SessionRecord,
};

#[async_trait]
pub trait IdentityKeyStore: Send + Sync {
    /// The local identity. Fails with `PrivateMaterialUnavailable` for
    /// client-held identities.
    async fn get_identity_key_pair(&self) -> CustodyResult<IdentityKeyPair>;

    async fn get_local_registration_id(&self) -> CustodyResult<u32>;

    /// Record a remote identity key. Returns true when it replaced a
    /// different key, which callers must surface as a security alert.
    async fn save_identity(
        &self,
        address: &ProtocolAddress,
        identity_key: &[u8],
    ) -> CustodyResult<bool>;

    /// Trust on first use; `Changed` keys are untrusted until re-verified.
    /// Storage errors answer false.
    async fn is_trusted_identity(
        &self,
        address: &ProtocolAddress,
        identity_key: &[u8],
        direction: Direction,
    ) -> bool;

    async fn get_identity(&self, address: &ProtocolAddress) -> CustodyResult<Option<Vec<u8>>>;

    /// Explicit user verification of the stored key's fingerprint
    async fn verify_identity(
        &self,
        address: &ProtocolAddress,
        identity_key: &[u8],
    ) -> CustodyResult<IdentityTrustRecord>;
}

#[async_trait]
pub trait PreKeyStore: Send + Sync {
    async fn load_pre_key(&self, key_id: u32) -> CustodyResult<PreKeyPair>;

    async fn store_pre_key(&self, pre_key: &PreKeyPair) -> CustodyResult<()>;

    async fn contains_pre_key(&self, key_id: u32) -> CustodyResult<bool>;

    /// Consume-once. Call exactly once per handshake that used the key.
    async fn remove_pre_key(&self, key_id: u32) -> CustodyResult<PreKeyConsumption>;
}

#[async_trait]
pub trait SignedPreKeyStore: Send + Sync {
    async fn load_signed_pre_key(&self, key_id: u32) -> CustodyResult<SignedPreKeyPair>;

    async fn store_signed_pre_key(&self, signed_pre_key: &SignedPreKeyPair) -> CustodyResult<()>;

    /// True for the active key and for keys deactivated within the grace period
    async fn contains_signed_pre_key(&self, key_id: u32) -> CustodyResult<bool>;

    /// Deactivates; the row is kept
    async fn remove_signed_pre_key(&self, key_id: u32) -> CustodyResult<()>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_session(&self, address: &ProtocolAddress) -> CustodyResult<Option<SessionRecord>>;

    /// Returns the stored version
    async fn store_session(&self, address: &ProtocolAddress, record: &[u8]) -> CustodyResult<i64>;

    async fn contains_session(&self, address: &ProtocolAddress) -> CustodyResult<bool>;

    /// Deleting a missing session succeeds
    async fn delete_session(&self, address: &ProtocolAddress) -> CustodyResult<()>;

    /// Remove every device session with `remote_name`. Safe to retry.
    async fn delete_all_sessions(&self, remote_name: &str) -> CustodyResult<u64>;

    /// Devices of `remote_name`, other than the primary, with a session
    async fn get_sub_device_sessions(&self, remote_name: &str) -> CustodyResult<Vec<u32>>;
}
