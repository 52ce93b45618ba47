//! TTL cache in front of the repository
//!
//! The cache is a non-owning mirror: every entry can be rebuilt from the
//! repository, except the sealed private halves of pre-keys, which only ever
//! live here. [`CacheBackend`] is the pluggable store; [`CacheTier`] adds
//! typed keys, per-class TTLs and the degrade-to-miss policy.

mod chaotic;
mod memory;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::config::CacheConfig;
use crate::crypto::fingerprint;
use crate::models::{ProtocolAddress, SessionRecord};

pub use chaotic::ChaoticCache;
pub use memory::MemoryCache;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache unavailable: {0}")]
    Unavailable(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Key/value store with expiry.
///
/// `set_if_newer` stores only when `version` is greater than the version
/// held for the key, so versioned entries never move backwards.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()>;

    async fn set_if_newer(
        &self,
        key: &str,
        version: i64,
        value: Vec<u8>,
        ttl: Duration,
    ) -> CacheResult<bool>;

    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Returns the number of entries removed
    async fn delete_prefix(&self, prefix: &str) -> CacheResult<u64>;

    async fn ping(&self) -> CacheResult<()>;
}

// ============================================================================
// Keys
// ============================================================================

/// Typed cache keys. Components are percent-encoded so a user or remote
/// name can never forge another key's prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheKey {
    Identity { user_id: String, device_id: u32 },
    SignedPreKey { user_id: String, key_id: u32 },
    SignedPreKeyPrivate { user_id: String, key_id: u32, public: String },
    PreKeyPrivate { user_id: String, key_id: u32, public: String },
    Session { user_id: String, address: ProtocolAddress },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheClass {
    Session,
    Key,
}

impl CacheKey {
    pub fn identity(user_id: &str, device_id: u32) -> Self {
        CacheKey::Identity {
            user_id: user_id.to_string(),
            device_id,
        }
    }

    pub fn signed_pre_key(user_id: &str, key_id: u32) -> Self {
        CacheKey::SignedPreKey {
            user_id: user_id.to_string(),
            key_id,
        }
    }

    /// Private halves are keyed by their public key too, so two pairs
    /// generated under the same id never share an entry
    pub fn signed_pre_key_private(user_id: &str, key_id: u32, public_key: &[u8]) -> Self {
        CacheKey::SignedPreKeyPrivate {
            user_id: user_id.to_string(),
            key_id,
            public: fingerprint(public_key),
        }
    }

    pub fn pre_key_private(user_id: &str, key_id: u32, public_key: &[u8]) -> Self {
        CacheKey::PreKeyPrivate {
            user_id: user_id.to_string(),
            key_id,
            public: fingerprint(public_key),
        }
    }

    pub fn session(user_id: &str, address: &ProtocolAddress) -> Self {
        CacheKey::Session {
            user_id: user_id.to_string(),
            address: address.clone(),
        }
    }

    pub fn class(&self) -> CacheClass {
        match self {
            CacheKey::Session { .. } => CacheClass::Session,
            _ => CacheClass::Key,
        }
    }

    /// Prefix shared by every entry owned by `user_id`
    pub fn user_prefix(user_id: &str) -> String {
        format!("kc:{}:", urlencoding::encode(user_id))
    }

    /// Prefix shared by every private half ever stashed under a one-time id
    pub fn pre_key_private_prefix(user_id: &str, key_id: u32) -> String {
        format!("{}pk-priv:{}:", Self::user_prefix(user_id), key_id)
    }

    /// Prefix shared by every session with any device of `remote_name`
    pub fn session_prefix(user_id: &str, remote_name: &str) -> String {
        format!(
            "{}session:{}:",
            Self::user_prefix(user_id),
            urlencoding::encode(remote_name)
        )
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Identity { user_id, device_id } => {
                write!(f, "{}identity:{}", Self::user_prefix(user_id), device_id)
            }
            CacheKey::SignedPreKey { user_id, key_id } => {
                write!(f, "{}spk:{}", Self::user_prefix(user_id), key_id)
            }
            CacheKey::SignedPreKeyPrivate {
                user_id,
                key_id,
                public,
            } => write!(
                f,
                "{}spk-priv:{}:{}",
                Self::user_prefix(user_id),
                key_id,
                public
            ),
            CacheKey::PreKeyPrivate {
                user_id,
                key_id,
                public,
            } => write!(f, "{}{}", Self::pre_key_private_prefix(user_id, *key_id), public),
            CacheKey::Session { user_id, address } => write!(
                f,
                "{}{}",
                Self::session_prefix(user_id, &address.name),
                address.device_id
            ),
        }
    }
}

// ============================================================================
// Tier
// ============================================================================

/// Session tombstones outrank any real write for their lifetime
const TOMBSTONE_VERSION: i64 = i64::MAX;

/// Typed, failure-tolerant view over a [`CacheBackend`]
#[derive(Clone)]
pub struct CacheTier {
    backend: Arc<dyn CacheBackend>,
    session_ttl: Duration,
    key_ttl: Duration,
}

impl fmt::Debug for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheTier")
            .field("session_ttl", &self.session_ttl)
            .field("key_ttl", &self.key_ttl)
            .finish_non_exhaustive()
    }
}

impl CacheTier {
    pub fn new(backend: Arc<dyn CacheBackend>, config: &CacheConfig) -> Self {
        Self {
            backend,
            session_ttl: config.session_ttl(),
            key_ttl: config.key_ttl(),
        }
    }

    /// Tier over a fresh in-process [`MemoryCache`]
    pub fn in_memory(config: &CacheConfig) -> Self {
        Self::new(Arc::new(MemoryCache::new()), config)
    }

    fn ttl_for(&self, key: &CacheKey) -> Duration {
        match key.class() {
            CacheClass::Session => self.session_ttl,
            CacheClass::Key => self.key_ttl,
        }
    }

    /// Typed read; any failure is a miss
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let name = key.to_string();
        let bytes = match self.backend.get(&name).await {
            Ok(bytes) => bytes?,
            Err(e) => {
                tracing::warn!("Cache read failed for {}: {}", name, e);
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("Dropping undecodable cache entry {}: {}", name, e);
                self.invalidate(key).await;
                None
            }
        }
    }

    /// Typed write with the key's class TTL; failures invalidate the key
    pub async fn put<T: Serialize>(&self, key: &CacheKey, value: &T) {
        let name = key.to_string();
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Cannot encode cache entry {}: {}", name, e);
                return;
            }
        };

        if let Err(e) = self.backend.set(&name, bytes, self.ttl_for(key)).await {
            tracing::warn!("Cache write failed for {}: {}", name, e);
            self.invalidate(key).await;
        }
    }

    /// Read a session. Tombstones and failures are misses.
    pub async fn get_session(&self, key: &CacheKey) -> Option<SessionRecord> {
        self.get::<Option<SessionRecord>>(key).await.flatten()
    }

    /// Versioned session write; returns whether the cache now holds `session`
    pub async fn put_session(&self, key: &CacheKey, session: &SessionRecord) -> bool {
        let name = key.to_string();
        let bytes = match serde_json::to_vec(&Some(session)) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Cannot encode session {}: {}", name, e);
                return false;
            }
        };

        match self
            .backend
            .set_if_newer(&name, session.version, bytes, self.session_ttl)
            .await
        {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!("Session cache write failed for {}: {}", name, e);
                self.invalidate(key).await;
                false
            }
        }
    }

    /// Mark a session deleted so a racing read-through cannot resurrect it.
    ///
    /// Until the tombstone expires, reads for this key go to the repository.
    pub async fn tombstone_session(&self, key: &CacheKey) {
        let name = key.to_string();
        let tombstone = b"null".to_vec();
        if let Err(e) = self
            .backend
            .set_if_newer(&name, TOMBSTONE_VERSION, tombstone, self.session_ttl)
            .await
        {
            tracing::warn!("Session tombstone failed for {}: {}", name, e);
            self.invalidate(key).await;
        }
    }

    /// Raw bytes (sealed private halves); any failure is a miss
    pub async fn get_raw(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let name = key.to_string();
        match self.backend.get(&name).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Cache read failed for {}: {}", name, e);
                None
            }
        }
    }

    /// Raw write that must succeed: the cache is the only home of these bytes
    pub async fn put_raw(&self, key: &CacheKey, value: Vec<u8>, ttl: Duration) -> CacheResult<()> {
        self.backend.set(&key.to_string(), value, ttl).await
    }

    /// Best-effort removal
    pub async fn invalidate(&self, key: &CacheKey) {
        let name = key.to_string();
        if let Err(e) = self.backend.delete(&name).await {
            tracing::warn!("Cache invalidation failed for {}: {}", name, e);
        }
    }

    /// Best-effort removal of every key under `prefix`
    pub async fn invalidate_prefix(&self, prefix: &str) -> u64 {
        match self.backend.delete_prefix(prefix).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!("Cache prefix invalidation failed for {}: {}", prefix, e);
                0
            }
        }
    }

    pub async fn is_available(&self) -> bool {
        self.backend.ping().await.is_ok()
    }
}
