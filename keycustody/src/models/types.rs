//! Shared data types for storage, caching and the admin/API surface

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{constant_time_eq, WrappedKey};

// ============================================================================
// Addresses
// ============================================================================

/// A (user, device) pair as seen by the protocol engine
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolAddress {
    pub name: String,
    pub device_id: u32,
}

impl ProtocolAddress {
    pub fn new(name: impl Into<String>, device_id: u32) -> Self {
        Self {
            name: name.into(),
            device_id,
        }
    }
}

impl fmt::Display for ProtocolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.device_id)
    }
}

/// Which way a message is travelling when trust is checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sending,
    Receiving,
}

// ============================================================================
// Identity Keys
// ============================================================================

/// Lifecycle of a local identity row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKeyState {
    Current,
    Superseded,
}

impl IdentityKeyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityKeyState::Current => "current",
            IdentityKeyState::Superseded => "superseded",
        }
    }
}

/// A user's own identity for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityKeyRecord {
    pub id: String,
    pub user_id: String,
    pub device_id: u32,
    pub registration_id: u32,
    pub public_key: Vec<u8>,
    /// Present only for server-custodied identities; always codec ciphertext
    pub wrapped_private_key: Option<WrappedKey>,
    pub state: IdentityKeyState,
    pub created_at: DateTime<Utc>,
}

impl IdentityKeyRecord {
    pub fn new(
        user_id: impl Into<String>,
        device_id: u32,
        registration_id: u32,
        public_key: Vec<u8>,
        wrapped_private_key: Option<WrappedKey>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            device_id,
            registration_id,
            public_key,
            wrapped_private_key,
            state: IdentityKeyState::Current,
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// Remote Identity Trust
// ============================================================================

/// Trust in a remote party's identity key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustState {
    /// Seen, never verified
    Untrusted,
    /// Fingerprint verified by the user
    Trusted,
    /// Stored key stopped matching: possible impersonation
    Changed,
}

impl TrustState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustState::Untrusted => "untrusted",
            TrustState::Trusted => "trusted",
            TrustState::Changed => "changed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "untrusted" => Some(TrustState::Untrusted),
            "trusted" => Some(TrustState::Trusted),
            "changed" => Some(TrustState::Changed),
            _ => None,
        }
    }
}

/// Outcome of observing a remote identity key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityObservation {
    FirstSeen,
    Unchanged,
    Changed,
}

impl IdentityObservation {
    /// Whether callers must raise a security alert
    pub fn is_change(&self) -> bool {
        matches!(self, IdentityObservation::Changed)
    }
}

/// Last-seen identity of a remote (user, device) from an owner's perspective
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityTrustRecord {
    pub user_id: String,
    pub address: ProtocolAddress,
    pub identity_key: Vec<u8>,
    pub trust_state: TrustState,
    pub first_seen_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl IdentityTrustRecord {
    pub fn first_seen(
        user_id: impl Into<String>,
        address: ProtocolAddress,
        identity_key: &[u8],
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            address,
            identity_key: identity_key.to_vec(),
            trust_state: TrustState::Untrusted,
            first_seen_at: now,
            verified_at: None,
            updated_at: now,
        }
    }

    /// Apply an incoming key.
    ///
    /// A differing key always lands in `Changed` with the verification
    /// cleared, whatever the previous state was.
    pub fn observe(&mut self, identity_key: &[u8], now: DateTime<Utc>) -> IdentityObservation {
        if constant_time_eq(&self.identity_key, identity_key) {
            return IdentityObservation::Unchanged;
        }
        self.identity_key = identity_key.to_vec();
        self.trust_state = TrustState::Changed;
        self.verified_at = None;
        self.updated_at = now;
        IdentityObservation::Changed
    }

    /// Explicit user re-verification of the stored key
    pub fn verify(&mut self, now: DateTime<Utc>) {
        self.trust_state = TrustState::Trusted;
        self.verified_at = Some(now);
        self.updated_at = now;
    }

    pub fn trusts(&self, identity_key: &[u8]) -> bool {
        match self.trust_state {
            TrustState::Changed => false,
            TrustState::Untrusted | TrustState::Trusted => {
                constant_time_eq(&self.identity_key, identity_key)
            }
        }
    }
}

// ============================================================================
// Pre-Keys
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum SignedPreKeyState {
    Active,
    Inactive { deactivated_at: DateTime<Utc> },
}

/// Public half of a signed pre-key plus its lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKeyRecord {
    pub user_id: String,
    pub key_id: u32,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
    pub state: SignedPreKeyState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SignedPreKeyRecord {
    pub fn is_active(&self) -> bool {
        matches!(self.state, SignedPreKeyState::Active)
    }

    /// Active, or deactivated recently enough that an in-flight handshake
    /// may still present it
    pub fn is_usable(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        match self.state {
            SignedPreKeyState::Active => true,
            SignedPreKeyState::Inactive { deactivated_at } => now - deactivated_at <= grace,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum OneTimePreKeyState {
    Available,
    Used { used_at: DateTime<Utc> },
}

/// Public half of a one-time pre-key plus its lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneTimePreKeyRecord {
    pub user_id: String,
    pub key_id: u32,
    pub public_key: Vec<u8>,
    pub state: OneTimePreKeyState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl OneTimePreKeyRecord {
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, OneTimePreKeyState::Available) && self.expires_at > now
    }
}

/// Result of the consume-once update behind `remove_pre_key`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PreKeyConsumption {
    /// This caller won the race
    Consumed,
    /// Another handshake consumed it first; retry without a one-time key
    AlreadyConsumed,
}

// ============================================================================
// Sessions
// ============================================================================

/// Serialized ratchet state for one remote device
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub user_id: String,
    pub address: ProtocolAddress,
    pub record: Vec<u8>,
    /// Monotonic write version; orders cache writes
    pub version: i64,
    pub last_used_at: DateTime<Utc>,
}

impl fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRecord")
            .field("user_id", &self.user_id)
            .field("address", &self.address)
            .field("record_len", &self.record.len())
            .field("version", &self.version)
            .field("last_used_at", &self.last_used_at)
            .finish()
    }
}

// ============================================================================
// Rotation Audit
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationKind {
    SignedPreKey,
    OneTimePreKeys,
}

impl RotationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationKind::SignedPreKey => "signed_pre_key",
            RotationKind::OneTimePreKeys => "one_time_pre_keys",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "signed_pre_key" => Some(RotationKind::SignedPreKey),
            "one_time_pre_keys" => Some(RotationKind::OneTimePreKeys),
            _ => None,
        }
    }
}

/// Append-only record of one rotation or replenishment attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationAuditEntry {
    pub id: String,
    pub user_id: String,
    pub kind: RotationKind,
    pub previous_key_id: Option<u32>,
    pub new_key_id: Option<u32>,
    pub keys_added: Option<u32>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

impl RotationAuditEntry {
    fn new(user_id: &str, kind: RotationKind, success: bool, elapsed: std::time::Duration) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            kind,
            previous_key_id: None,
            new_key_id: None,
            keys_added: None,
            success,
            error: None,
            duration_ms: i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX),
            created_at: Utc::now(),
        }
    }

    pub fn succeeded(user_id: &str, kind: RotationKind, elapsed: std::time::Duration) -> Self {
        Self::new(user_id, kind, true, elapsed)
    }

    pub fn failed(
        user_id: &str,
        kind: RotationKind,
        error: impl Into<String>,
        elapsed: std::time::Duration,
    ) -> Self {
        let mut entry = Self::new(user_id, kind, false, elapsed);
        entry.error = Some(error.into());
        entry
    }

    pub fn with_key_ids(mut self, previous: Option<u32>, new: Option<u32>) -> Self {
        self.previous_key_id = previous;
        self.new_key_id = new;
        self
    }

    pub fn with_keys_added(mut self, count: u32) -> Self {
        self.keys_added = Some(count);
        self
    }
}

// ============================================================================
// API Types
// ============================================================================

/// Byte fields travel as standard base64 in API payloads
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Public signed pre-key as uploaded by clients and served in bundles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKeyPublic {
    pub key_id: u32,
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

/// Public one-time pre-key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneTimePreKeyPublic {
    pub key_id: u32,
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
}

/// Key registration request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyBundleUpload {
    #[serde(with = "base64_bytes")]
    pub identity_key: Vec<u8>,
    pub registration_id: u32,
    pub device_id: u32,
    pub signed_pre_key: SignedPreKeyPublic,
    pub one_time_pre_keys: Vec<OneTimePreKeyPublic>,
}

/// Acknowledgement of a committed registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationReceipt {
    pub user_id: String,
    pub device_id: u32,
    pub signed_pre_key_id: u32,
    pub one_time_pre_keys_stored: u32,
    /// A different identity key was already registered and is now superseded
    pub identity_replaced: bool,
}

/// Public material a peer needs to start a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyBundle {
    pub user_id: String,
    pub device_id: u32,
    pub registration_id: u32,
    #[serde(with = "base64_bytes")]
    pub identity_key: Vec<u8>,
    pub signed_pre_key: SignedPreKeyPublic,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub one_time_pre_key: Option<OneTimePreKeyPublic>,
}

/// Signed pre-key summary for operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKeyStatus {
    pub key_id: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub needs_rotation: bool,
}

/// Key inventory for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyStatus {
    pub user_id: String,
    pub has_identity_key: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_pre_key: Option<SignedPreKeyStatus>,
    pub available_one_time_pre_keys: u32,
    pub needs_replenishment: bool,
}

/// Aggregate outcome of a rotation or replenishment run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationReport {
    pub processed: u32,
    pub succeeded: u32,
    pub failed: u32,
    /// Users that needed no work (e.g. supply already above the floor)
    pub skipped: u32,
    pub elapsed_ms: u64,
}

/// Row counts removed by a full key wipe
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedKeys {
    pub identity_keys: u64,
    pub signed_pre_keys: u64,
    pub one_time_pre_keys: u64,
    pub trust_records: u64,
    pub sessions: u64,
}

impl DeletedKeys {
    pub fn total(&self) -> u64 {
        self.identity_keys
            + self.signed_pre_keys
            + self.one_time_pre_keys
            + self.trust_records
            + self.sessions
    }
}

/// Reachability of the backing stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub storage: bool,
    pub cache: bool,
}
