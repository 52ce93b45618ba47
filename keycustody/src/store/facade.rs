//! Repository + cache composition behind the protocol storage traits

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::traits::{IdentityKeyStore, PreKeyStore, SessionStore, SignedPreKeyStore};
use crate::cache::{CacheKey, CacheTier};
use crate::config::KeyPolicy;
use crate::crypto::{
    constant_time_eq, Curve25519KeyPair, IdentityKeyPair, KeyGenerator, PreKeyPair,
    SignedPreKeyPair, TransientSealer,
};
use crate::db::Repository;
use crate::error::{CustodyError, CustodyResult};
use crate::models::{
    Direction, IdentityKeyRecord, IdentityTrustRecord, OneTimePreKeyRecord, OneTimePreKeyState,
    PreKeyConsumption, ProtocolAddress, SessionRecord, SignedPreKeyRecord, SignedPreKeyState,
};

/// Device id of a user's primary device
pub const PRIMARY_DEVICE_ID: u32 = 1;

/// Shared store; hand out per-user views with [`ProtocolStore::for_user`]
#[derive(Debug, Clone)]
pub struct ProtocolStore {
    repo: Repository,
    cache: CacheTier,
    generator: KeyGenerator,
    sealer: Arc<TransientSealer>,
    policy: KeyPolicy,
}

impl ProtocolStore {
    pub fn new(
        repo: Repository,
        cache: CacheTier,
        generator: KeyGenerator,
        policy: KeyPolicy,
    ) -> Self {
        Self {
            repo,
            cache,
            generator,
            sealer: Arc::new(TransientSealer::generate()),
            policy,
        }
    }

    /// Storage callbacks bound to one local (user, device)
    pub fn for_user(&self, user_id: impl Into<String>, device_id: u32) -> UserProtocolStore {
        UserProtocolStore {
            store: self.clone(),
            user_id: user_id.into(),
            device_id,
        }
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    pub fn cache(&self) -> &CacheTier {
        &self.cache
    }

    pub fn policy(&self) -> &KeyPolicy {
        &self.policy
    }

    /// Seal a one-time pre-key's private half into the cache until it expires
    pub(crate) async fn stash_pre_key_private(
        &self,
        user_id: &str,
        pre_key: &PreKeyPair,
        expires_at: DateTime<Utc>,
    ) -> CustodyResult<()> {
        let sealed = self.sealer.seal(&pre_key.private_key)?;
        let ttl = ttl_until(expires_at, Utc::now());
        self.cache
            .put_raw(
                &CacheKey::pre_key_private(user_id, pre_key.key_id, &pre_key.public_key),
                sealed,
                ttl,
            )
            .await?;
        Ok(())
    }

    /// Seal a signed pre-key's private half into the cache until it expires
    /// and its grace period has passed
    pub(crate) async fn stash_signed_pre_key_private(
        &self,
        user_id: &str,
        signed_pre_key: &SignedPreKeyPair,
        expires_at: DateTime<Utc>,
    ) -> CustodyResult<()> {
        let sealed = self.sealer.seal(&signed_pre_key.private_key)?;
        let ttl = ttl_until(expires_at + self.policy.signed_pre_key_grace(), Utc::now());
        self.cache
            .put_raw(
                &CacheKey::signed_pre_key_private(
                    user_id,
                    signed_pre_key.key_id,
                    &signed_pre_key.public_key,
                ),
                sealed,
                ttl,
            )
            .await?;
        Ok(())
    }

    /// Open a stashed private half; it must derive to `public_key`
    async fn open_private(
        &self,
        key: &CacheKey,
        public_key: &[u8],
    ) -> CustodyResult<zeroize::Zeroizing<Vec<u8>>> {
        let unavailable = || CustodyError::PrivateMaterialUnavailable(key.to_string());
        let sealed = self.cache.get_raw(key).await.ok_or_else(unavailable)?;

        // Sealed by an earlier process: the key is gone, so is the material
        let private_key = self.sealer.open(&sealed).map_err(|_| unavailable())?;

        let derived =
            Curve25519KeyPair::from_secret_bytes(&private_key).map_err(|_| unavailable())?;
        if !constant_time_eq(&derived.public_key_bytes(), public_key) {
            tracing::warn!(key = %key, "Stashed private half does not match its public key");
            return Err(unavailable());
        }
        Ok(private_key)
    }

    /// Current identity for a (user, device), read through the cache
    pub async fn load_identity(
        &self,
        user_id: &str,
        device_id: u32,
    ) -> CustodyResult<IdentityKeyRecord> {
        let key = CacheKey::identity(user_id, device_id);
        if let Some(identity) = self.cache.get::<IdentityKeyRecord>(&key).await {
            return Ok(identity);
        }

        let identity = self
            .repo
            .find_current_identity(user_id, device_id)
            .await?
            .ok_or_else(|| {
                CustodyError::NotFound(format!("identity for {}.{}", user_id, device_id))
            })?;
        self.cache.put(&key, &identity).await;
        Ok(identity)
    }

    /// Signed pre-key public record, read through the cache
    async fn load_signed_record(
        &self,
        user_id: &str,
        key_id: u32,
    ) -> CustodyResult<SignedPreKeyRecord> {
        let key = CacheKey::signed_pre_key(user_id, key_id);
        if let Some(record) = self.cache.get::<SignedPreKeyRecord>(&key).await {
            return Ok(record);
        }

        let record = self
            .repo
            .find_signed_prekey(user_id, key_id)
            .await?
            .ok_or_else(|| {
                CustodyError::NotFound(format!("signed pre-key {} for {}", key_id, user_id))
            })?;
        self.cache.put(&key, &record).await;
        Ok(record)
    }

    /// Drop every cache entry owned by a user, private halves included
    pub async fn invalidate_user(&self, user_id: &str) -> u64 {
        self.cache.invalidate_prefix(&CacheKey::user_prefix(user_id)).await
    }
}

fn ttl_until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (deadline - now).to_std().unwrap_or(Duration::ZERO)
}

/// [`ProtocolStore`] bound to a local (user, device)
#[derive(Debug, Clone)]
pub struct UserProtocolStore {
    store: ProtocolStore,
    user_id: String,
    device_id: u32,
}

impl UserProtocolStore {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    fn session_key(&self, address: &ProtocolAddress) -> CacheKey {
        CacheKey::session(&self.user_id, address)
    }
}

// ============================================================================
// Identity
// ============================================================================

#[async_trait]
impl IdentityKeyStore for UserProtocolStore {
    async fn get_identity_key_pair(&self) -> CustodyResult<IdentityKeyPair> {
        let identity = self.store.load_identity(&self.user_id, self.device_id).await?;
        let wrapped = identity.wrapped_private_key.ok_or_else(|| {
            CustodyError::PrivateMaterialUnavailable(format!(
                "identity for {}.{} is client-held",
                self.user_id, self.device_id
            ))
        })?;

        // PBKDF2 is deliberately slow; keep it off the async workers
        let generator = self.store.generator.clone();
        let pair = tokio::task::spawn_blocking(move || generator.unwrap_identity(&wrapped)).await??;
        Ok(pair)
    }

    async fn get_local_registration_id(&self) -> CustodyResult<u32> {
        let identity = self.store.load_identity(&self.user_id, self.device_id).await?;
        Ok(identity.registration_id)
    }

    async fn save_identity(
        &self,
        address: &ProtocolAddress,
        identity_key: &[u8],
    ) -> CustodyResult<bool> {
        let (observation, record) = self
            .store
            .repo
            .observe_identity(&self.user_id, address, identity_key, Utc::now())
            .await?;

        if observation.is_change() {
            tracing::warn!(
                user_id = %self.user_id,
                remote = %address,
                fingerprint = %crate::crypto::fingerprint(&record.identity_key),
                "Remote identity key changed"
            );
        }
        Ok(observation.is_change())
    }

    async fn is_trusted_identity(
        &self,
        address: &ProtocolAddress,
        identity_key: &[u8],
        direction: Direction,
    ) -> bool {
        match self.store.repo.find_trust(&self.user_id, address).await {
            Ok(None) => true,
            Ok(Some(record)) => {
                let trusted = record.trusts(identity_key);
                if !trusted {
                    tracing::warn!(
                        user_id = %self.user_id,
                        remote = %address,
                        ?direction,
                        state = record.trust_state.as_str(),
                        "Untrusted remote identity"
                    );
                }
                trusted
            }
            Err(e) => {
                tracing::warn!(
                    user_id = %self.user_id,
                    remote = %address,
                    "Trust lookup failed, treating identity as untrusted: {}",
                    e
                );
                false
            }
        }
    }

    async fn get_identity(&self, address: &ProtocolAddress) -> CustodyResult<Option<Vec<u8>>> {
        let record = self.store.repo.find_trust(&self.user_id, address).await?;
        Ok(record.map(|r| r.identity_key))
    }

    async fn verify_identity(
        &self,
        address: &ProtocolAddress,
        identity_key: &[u8],
    ) -> CustodyResult<IdentityTrustRecord> {
        let record = self
            .store
            .repo
            .verify_trust(&self.user_id, address, identity_key, Utc::now())
            .await?;
        tracing::info!(user_id = %self.user_id, remote = %address, "Remote identity verified");
        Ok(record)
    }
}

// ============================================================================
// One-time pre-keys
// ============================================================================

#[async_trait]
impl PreKeyStore for UserProtocolStore {
    async fn load_pre_key(&self, key_id: u32) -> CustodyResult<PreKeyPair> {
        let record = self
            .store
            .repo
            .find_one_time_prekey(&self.user_id, key_id)
            .await?
            .filter(|r| matches!(r.state, OneTimePreKeyState::Available))
            .ok_or_else(|| {
                CustodyError::NotFound(format!("pre-key {} for {}", key_id, self.user_id))
            })?;

        let private_key = self
            .store
            .open_private(
                &CacheKey::pre_key_private(&self.user_id, key_id, &record.public_key),
                &record.public_key,
            )
            .await?;

        Ok(PreKeyPair {
            key_id,
            public_key: record.public_key,
            private_key,
        })
    }

    async fn store_pre_key(&self, pre_key: &PreKeyPair) -> CustodyResult<()> {
        let now = Utc::now();
        let record = OneTimePreKeyRecord {
            user_id: self.user_id.clone(),
            key_id: pre_key.key_id,
            public_key: pre_key.public_key.clone(),
            state: OneTimePreKeyState::Available,
            created_at: now,
            expires_at: now + self.store.policy.one_time_pre_key_lifetime(),
        };

        // Private half first: a failed stash must leave no public record.
        // A rejected insert leaves an entry keyed by this pair's public key,
        // unreachable from the durable record and dropped at its TTL.
        self.store
            .stash_pre_key_private(&self.user_id, pre_key, record.expires_at)
            .await?;
        self.store.repo.store_one_time_prekeys(&[record]).await
    }

    async fn contains_pre_key(&self, key_id: u32) -> CustodyResult<bool> {
        let record = self.store.repo.find_one_time_prekey(&self.user_id, key_id).await?;
        Ok(record.is_some_and(|r| matches!(r.state, OneTimePreKeyState::Available)))
    }

    async fn remove_pre_key(&self, key_id: u32) -> CustodyResult<PreKeyConsumption> {
        let outcome = self
            .store
            .repo
            .consume_one_time_prekey(&self.user_id, key_id, Utc::now())
            .await?;

        match outcome {
            PreKeyConsumption::Consumed => {
                self.store
                    .cache
                    .invalidate_prefix(&CacheKey::pre_key_private_prefix(&self.user_id, key_id))
                    .await;
                tracing::debug!(user_id = %self.user_id, key_id, "One-time pre-key consumed");
            }
            PreKeyConsumption::AlreadyConsumed => {
                tracing::info!(
                    user_id = %self.user_id,
                    key_id,
                    "One-time pre-key already consumed"
                );
            }
        }
        Ok(outcome)
    }
}

// ============================================================================
// Signed pre-keys
// ============================================================================

#[async_trait]
impl SignedPreKeyStore for UserProtocolStore {
    async fn load_signed_pre_key(&self, key_id: u32) -> CustodyResult<SignedPreKeyPair> {
        let record = self.store.load_signed_record(&self.user_id, key_id).await?;
        let private_key = self
            .store
            .open_private(
                &CacheKey::signed_pre_key_private(&self.user_id, key_id, &record.public_key),
                &record.public_key,
            )
            .await?;

        Ok(SignedPreKeyPair {
            key_id,
            public_key: record.public_key,
            private_key,
            signature: record.signature,
            created_at: record.created_at,
        })
    }

    async fn store_signed_pre_key(&self, signed_pre_key: &SignedPreKeyPair) -> CustodyResult<()> {
        let record = SignedPreKeyRecord {
            user_id: self.user_id.clone(),
            key_id: signed_pre_key.key_id,
            public_key: signed_pre_key.public_key.clone(),
            signature: signed_pre_key.signature.clone(),
            state: SignedPreKeyState::Active,
            created_at: signed_pre_key.created_at,
            expires_at: signed_pre_key.created_at + self.store.policy.signed_pre_key_lifetime(),
        };

        let previous = self.store.repo.find_active_signed_prekey(&self.user_id).await?;

        self.store
            .stash_signed_pre_key_private(&self.user_id, signed_pre_key, record.expires_at)
            .await?;
        self.store.repo.store_signed_prekey(&record).await?;

        if let Some(previous) = previous {
            self.store
                .cache
                .invalidate(&CacheKey::signed_pre_key(&self.user_id, previous.key_id))
                .await;
        }
        self.store
            .cache
            .put(&CacheKey::signed_pre_key(&self.user_id, record.key_id), &record)
            .await;
        Ok(())
    }

    async fn contains_signed_pre_key(&self, key_id: u32) -> CustodyResult<bool> {
        let record = self.store.repo.find_signed_prekey(&self.user_id, key_id).await?;
        let grace = self.store.policy.signed_pre_key_grace();
        Ok(record.is_some_and(|r| r.is_usable(Utc::now(), grace)))
    }

    async fn remove_signed_pre_key(&self, key_id: u32) -> CustodyResult<()> {
        let deactivated = self
            .store
            .repo
            .deactivate_signed_prekey(&self.user_id, key_id, Utc::now())
            .await?;

        if !deactivated
            && self
                .store
                .repo
                .find_signed_prekey(&self.user_id, key_id)
                .await?
                .is_none()
        {
            return Err(CustodyError::NotFound(format!(
                "signed pre-key {} for {}",
                key_id, self.user_id
            )));
        }

        self.store
            .cache
            .invalidate(&CacheKey::signed_pre_key(&self.user_id, key_id))
            .await;
        Ok(())
    }
}

// ============================================================================
// Sessions
// ============================================================================

#[async_trait]
impl SessionStore for UserProtocolStore {
    async fn load_session(
        &self,
        address: &ProtocolAddress,
    ) -> CustodyResult<Option<SessionRecord>> {
        let key = self.session_key(address);
        if let Some(session) = self.store.cache.get_session(&key).await {
            return Ok(Some(session));
        }

        let session = self.store.repo.find_session(&self.user_id, address).await?;
        if let Some(session) = &session {
            self.store.cache.put_session(&key, session).await;
        }
        Ok(session)
    }

    async fn store_session(&self, address: &ProtocolAddress, record: &[u8]) -> CustodyResult<i64> {
        let key = self.session_key(address);
        let now = Utc::now();

        let upserted = self
            .store
            .repo
            .upsert_session(&self.user_id, address, record, now)
            .await;
        let version = match upserted {
            Ok(version) => version,
            Err(e) => {
                self.store.cache.invalidate(&key).await;
                return Err(e);
            }
        };

        let session = SessionRecord {
            user_id: self.user_id.clone(),
            address: address.clone(),
            record: record.to_vec(),
            version,
            last_used_at: now,
        };
        self.store.cache.put_session(&key, &session).await;
        Ok(version)
    }

    async fn contains_session(&self, address: &ProtocolAddress) -> CustodyResult<bool> {
        self.store.repo.session_exists(&self.user_id, address).await
    }

    async fn delete_session(&self, address: &ProtocolAddress) -> CustodyResult<()> {
        let result = self.store.repo.delete_session(&self.user_id, address).await;
        self.store.cache.tombstone_session(&self.session_key(address)).await;
        result.map(|_| ())
    }

    async fn delete_all_sessions(&self, remote_name: &str) -> CustodyResult<u64> {
        let devices = self.store.repo.list_session_devices(&self.user_id, remote_name).await?;
        let result = self.store.repo.delete_all_sessions(&self.user_id, remote_name).await;

        for device_id in devices {
            let address = ProtocolAddress::new(remote_name, device_id);
            self.store.cache.tombstone_session(&self.session_key(&address)).await;
        }

        let removed = result?;
        tracing::info!(
            user_id = %self.user_id,
            remote = remote_name,
            removed,
            "Deleted all sessions"
        );
        Ok(removed)
    }

    async fn get_sub_device_sessions(&self, remote_name: &str) -> CustodyResult<Vec<u32>> {
        let devices = self.store.repo.list_session_devices(&self.user_id, remote_name).await?;
        Ok(devices
            .into_iter()
            .filter(|&device_id| device_id != PRIMARY_DEVICE_ID)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ChaoticCache, MemoryCache};
    use crate::config::CacheConfig;
    use crate::crypto::{HumanSecret, KeyMaterialCodec};
    use crate::models::TrustState;

    async fn store_with_cache(cache: CacheTier) -> ProtocolStore {
        let repo = Repository::in_memory().await.unwrap();
        let generator =
            KeyGenerator::new(KeyMaterialCodec::new(1_000).unwrap(), HumanSecret::new("operator"));
        ProtocolStore::new(repo, cache, generator, KeyPolicy::default())
    }

    async fn store() -> ProtocolStore {
        store_with_cache(CacheTier::in_memory(&CacheConfig::default())).await
    }

    fn bob(device: u32) -> ProtocolAddress {
        ProtocolAddress::new("bob", device)
    }

    #[tokio::test]
    async fn test_custodial_identity_round_trip() {
        let store = store().await;
        let generated = store.generator.generate_identity().unwrap();
        store
            .repo
            .replace_identity(&IdentityKeyRecord::new(
                "alice",
                1,
                generated.registration_id,
                generated.public_key.clone(),
                Some(generated.wrapped_private_key),
            ))
            .await
            .unwrap();

        let alice = store.for_user("alice", 1);
        let pair = alice.get_identity_key_pair().await.unwrap();
        assert_eq!(pair.public_key_bytes(), generated.public_key);
        assert_eq!(alice.get_local_registration_id().await.unwrap(), generated.registration_id);
    }

    #[tokio::test]
    async fn test_client_held_identity_has_no_private_half() {
        let store = store().await;
        store
            .repo
            .replace_identity(&IdentityKeyRecord::new("alice", 1, 5, vec![1; 32], None))
            .await
            .unwrap();

        let err = store.for_user("alice", 1).get_identity_key_pair().await.unwrap_err();
        assert!(matches!(err, CustodyError::PrivateMaterialUnavailable(_)));
        assert!(matches!(
            store.for_user("alice", 2).get_local_registration_id().await,
            Err(CustodyError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_trust_on_first_use_and_change() {
        let store = store().await;
        let alice = store.for_user("alice", 1);

        assert!(alice.is_trusted_identity(&bob(1), b"key-1", Direction::Receiving).await);
        assert!(!alice.save_identity(&bob(1), b"key-1").await.unwrap());
        assert!(!alice.save_identity(&bob(1), b"key-1").await.unwrap());
        assert!(alice.is_trusted_identity(&bob(1), b"key-1", Direction::Sending).await);
        assert!(!alice.is_trusted_identity(&bob(1), b"key-x", Direction::Sending).await);

        assert!(alice.save_identity(&bob(1), b"key-2").await.unwrap());
        assert!(!alice.is_trusted_identity(&bob(1), b"key-2", Direction::Sending).await);
        assert_eq!(alice.get_identity(&bob(1)).await.unwrap(), Some(b"key-2".to_vec()));

        let verified = alice.verify_identity(&bob(1), b"key-2").await.unwrap();
        assert_eq!(verified.trust_state, TrustState::Trusted);
        assert!(alice.is_trusted_identity(&bob(1), b"key-2", Direction::Sending).await);
    }

    #[tokio::test]
    async fn test_trust_fails_closed_on_storage_error() {
        let store = store().await;
        let alice = store.for_user("alice", 1);
        store.repo.close().await;

        assert!(!alice.is_trusted_identity(&bob(1), b"key-1", Direction::Receiving).await);
    }

    #[tokio::test]
    async fn test_pre_key_lifecycle() {
        let store = store().await;
        let alice = store.for_user("alice", 1);
        let pre_key = PreKeyPair::generate(11);

        alice.store_pre_key(&pre_key).await.unwrap();
        assert!(alice.contains_pre_key(11).await.unwrap());

        let loaded = alice.load_pre_key(11).await.unwrap();
        assert_eq!(loaded.public_key, pre_key.public_key);
        assert_eq!(*loaded.private_key, *pre_key.private_key);

        assert_eq!(alice.remove_pre_key(11).await.unwrap(), PreKeyConsumption::Consumed);
        assert_eq!(alice.remove_pre_key(11).await.unwrap(), PreKeyConsumption::AlreadyConsumed);
        assert!(!alice.contains_pre_key(11).await.unwrap());
        assert!(matches!(alice.load_pre_key(11).await, Err(CustodyError::NotFound(_))));
        assert!(matches!(alice.remove_pre_key(12).await, Err(CustodyError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_private_half_missing_from_cache() {
        let store = store().await;
        let alice = store.for_user("alice", 1);
        alice.store_pre_key(&PreKeyPair::generate(3)).await.unwrap();

        store.invalidate_user("alice").await;
        assert!(matches!(
            alice.load_pre_key(3).await,
            Err(CustodyError::PrivateMaterialUnavailable(_))
        ));
        // The durable public half is untouched
        assert!(alice.contains_pre_key(3).await.unwrap());
    }

    #[tokio::test]
    async fn test_rejected_duplicate_keeps_stored_private_half() {
        let store = store().await;
        let alice = store.for_user("alice", 1);
        let stored = PreKeyPair::generate(1);
        alice.store_pre_key(&stored).await.unwrap();

        assert!(alice.store_pre_key(&PreKeyPair::generate(1)).await.is_err());

        let loaded = alice.load_pre_key(1).await.unwrap();
        assert_eq!(loaded.public_key, stored.public_key);
        assert_eq!(*loaded.private_key, *stored.private_key);
        let derived = Curve25519KeyPair::from_secret_bytes(&loaded.private_key).unwrap();
        assert_eq!(derived.public_key_bytes(), stored.public_key);
    }

    #[tokio::test]
    async fn test_rejected_duplicate_signed_keeps_stored_private_half() {
        let store = store().await;
        let alice = store.for_user("alice", 1);
        let identity = IdentityKeyPair::generate();
        let stored = SignedPreKeyPair::generate(4, &identity);
        alice.store_signed_pre_key(&stored).await.unwrap();

        assert!(alice
            .store_signed_pre_key(&SignedPreKeyPair::generate(4, &identity))
            .await
            .is_err());

        let loaded = alice.load_signed_pre_key(4).await.unwrap();
        assert_eq!(loaded.public_key, stored.public_key);
        assert_eq!(*loaded.private_key, *stored.private_key);
        assert_eq!(store.repo.find_active_signed_prekey("alice").await.unwrap().unwrap().key_id, 4);
    }

    #[tokio::test]
    async fn test_mismatched_private_half_is_unavailable() {
        let store = store().await;
        let alice = store.for_user("alice", 1);
        let stored = PreKeyPair::generate(5);
        alice.store_pre_key(&stored).await.unwrap();

        // Overwrite the entry with a private half of some other pair
        let other = PreKeyPair::generate(5);
        store
            .cache
            .put_raw(
                &CacheKey::pre_key_private("alice", 5, &stored.public_key),
                store.sealer.seal(&other.private_key).unwrap(),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        assert!(matches!(
            alice.load_pre_key(5).await,
            Err(CustodyError::PrivateMaterialUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_signed_pre_key_deactivation_grace() {
        let store = store().await;
        let alice = store.for_user("alice", 1);
        let identity = IdentityKeyPair::generate();

        let first = SignedPreKeyPair::generate(1, &identity);
        let second = SignedPreKeyPair::generate(2, &identity);
        alice.store_signed_pre_key(&first).await.unwrap();
        alice.store_signed_pre_key(&second).await.unwrap();

        // Replaced, but still inside the grace period
        assert!(alice.contains_signed_pre_key(1).await.unwrap());
        let loaded = alice.load_signed_pre_key(1).await.unwrap();
        assert_eq!(loaded.signature, first.signature);

        alice.remove_signed_pre_key(2).await.unwrap();
        assert!(alice.contains_signed_pre_key(2).await.unwrap());
        assert!(store.repo.find_active_signed_prekey("alice").await.unwrap().is_none());
        assert!(matches!(
            alice.remove_signed_pre_key(9).await,
            Err(CustodyError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_signed_pre_key_outside_grace() {
        let repo = Repository::in_memory().await.unwrap();
        let generator =
            KeyGenerator::new(KeyMaterialCodec::new(1_000).unwrap(), HumanSecret::new("operator"));
        let policy = KeyPolicy {
            signed_pre_key_grace_days: 0,
            ..KeyPolicy::default()
        };
        let cache = CacheTier::in_memory(&CacheConfig::default());
        let store = ProtocolStore::new(repo, cache, generator, policy);
        let alice = store.for_user("alice", 1);

        alice
            .store_signed_pre_key(&SignedPreKeyPair::generate(1, &IdentityKeyPair::generate()))
            .await
            .unwrap();
        store
            .repo
            .deactivate_signed_prekey("alice", 1, Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(!alice.contains_signed_pre_key(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_session_store_and_load() {
        let store = store().await;
        let alice = store.for_user("alice", 1);

        assert!(alice.load_session(&bob(1)).await.unwrap().is_none());
        let v1 = alice.store_session(&bob(1), b"step-1").await.unwrap();
        let v2 = alice.store_session(&bob(1), b"step-2").await.unwrap();
        assert!(v2 > v1);

        let loaded = alice.load_session(&bob(1)).await.unwrap().unwrap();
        assert_eq!(loaded.record, b"step-2");
        assert_eq!(loaded.version, v2);
        assert!(alice.contains_session(&bob(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_deleted_session_not_served_from_cache() {
        let store = store().await;
        let alice = store.for_user("alice", 1);

        alice.store_session(&bob(1), b"step-1").await.unwrap();
        alice.load_session(&bob(1)).await.unwrap();
        alice.delete_session(&bob(1)).await.unwrap();
        assert!(alice.load_session(&bob(1)).await.unwrap().is_none());
        // Idempotent
        alice.delete_session(&bob(1)).await.unwrap();

        // A recreated session is read from the repository
        alice.store_session(&bob(1), b"fresh").await.unwrap();
        assert_eq!(alice.load_session(&bob(1)).await.unwrap().unwrap().record, b"fresh");
    }

    #[tokio::test]
    async fn test_sub_device_sessions_exclude_primary() {
        let store = store().await;
        let alice = store.for_user("alice", 1);
        for device in [1, 2, 5] {
            alice.store_session(&bob(device), b"s").await.unwrap();
        }
        assert_eq!(alice.get_sub_device_sessions("bob").await.unwrap(), vec![2, 5]);

        assert_eq!(alice.delete_all_sessions("bob").await.unwrap(), 3);
        assert_eq!(alice.delete_all_sessions("bob").await.unwrap(), 0);
        for device in [1, 2, 5] {
            assert!(alice.load_session(&bob(device)).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_cache_outage_does_not_fail_sessions() {
        let cache = CacheTier::new(
            Arc::new(ChaoticCache::new(MemoryCache::new(), 1.0)),
            &CacheConfig::default(),
        );
        let store = store_with_cache(cache).await;
        let alice = store.for_user("alice", 1);

        alice.store_session(&bob(1), b"step-1").await.unwrap();
        assert_eq!(alice.load_session(&bob(1)).await.unwrap().unwrap().record, b"step-1");
        alice.delete_session(&bob(1)).await.unwrap();
        assert!(!alice.contains_session(&bob(1)).await.unwrap());

        // Private halves have nowhere to live
        assert!(matches!(
            alice.store_pre_key(&PreKeyPair::generate(1)).await,
            Err(CustodyError::StorageUnavailable(_))
        ));
        assert!(!alice.contains_pre_key(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_session_write_surfaces_error() {
        let store = store().await;
        let alice = store.for_user("alice", 1);
        store.repo.close().await;

        let err = alice.store_session(&bob(1), b"step").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
