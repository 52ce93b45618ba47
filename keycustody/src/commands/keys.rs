//! Key registration and pre-key bundle retrieval

use std::collections::HashSet;

use chrono::Utc;

use crate::cache::CacheKey;
use crate::config::MAX_PREKEY_BATCH;
use crate::crypto::keys::{KEY_LEN, MAX_KEY_ID, MAX_REGISTRATION_ID, SIGNATURE_LEN};
use crate::crypto::verify_signature;
use crate::db::NewRegistration;
use crate::error::{CustodyError, CustodyResult};
use crate::models::{
    IdentityKeyRecord, KeyBundleUpload, OneTimePreKeyPublic, OneTimePreKeyRecord,
    OneTimePreKeyState, PreKeyBundle, RegistrationReceipt, SignedPreKeyPublic, SignedPreKeyRecord,
    SignedPreKeyState,
};
use crate::state::AppState;

/// Register a client-generated key bundle.
///
/// Everything is validated before anything is written; identity, signed
/// pre-key and one-time pre-keys then commit in one transaction.
pub async fn register_keys(
    state: &AppState,
    user_id: &str,
    upload: KeyBundleUpload,
) -> CustodyResult<RegistrationReceipt> {
    validate_upload(user_id, &upload)?;

    let now = Utc::now();
    let policy = &state.config.keys;
    let one_time_expiry = now + policy.one_time_pre_key_lifetime();

    let registration = NewRegistration {
        identity: IdentityKeyRecord::new(
            user_id,
            upload.device_id,
            upload.registration_id,
            upload.identity_key,
            None,
        ),
        signed_pre_key: SignedPreKeyRecord {
            user_id: user_id.to_string(),
            key_id: upload.signed_pre_key.key_id,
            public_key: upload.signed_pre_key.public_key,
            signature: upload.signed_pre_key.signature,
            state: SignedPreKeyState::Active,
            created_at: now,
            expires_at: now + policy.signed_pre_key_lifetime(),
        },
        one_time_pre_keys: upload
            .one_time_pre_keys
            .into_iter()
            .map(|key| OneTimePreKeyRecord {
                user_id: user_id.to_string(),
                key_id: key.key_id,
                public_key: key.public_key,
                state: OneTimePreKeyState::Available,
                created_at: now,
                expires_at: one_time_expiry,
            })
            .collect(),
    };

    let identity_replaced = state.repo.register_bundle(&registration).await?;

    state
        .cache
        .invalidate(&CacheKey::identity(user_id, upload.device_id))
        .await;
    state
        .cache
        .invalidate(&CacheKey::signed_pre_key(user_id, registration.signed_pre_key.key_id))
        .await;

    if identity_replaced {
        tracing::warn!(user_id, device_id = upload.device_id, "Registered identity key replaced");
    }
    tracing::info!(
        user_id,
        device_id = upload.device_id,
        signed_pre_key_id = registration.signed_pre_key.key_id,
        one_time_pre_keys = registration.one_time_pre_keys.len(),
        "Key bundle registered"
    );

    let one_time_pre_keys_stored =
        u32::try_from(registration.one_time_pre_keys.len()).unwrap_or(u32::MAX);
    Ok(RegistrationReceipt {
        user_id: user_id.to_string(),
        device_id: upload.device_id,
        signed_pre_key_id: registration.signed_pre_key.key_id,
        one_time_pre_keys_stored,
        identity_replaced,
    })
}

/// Public material for starting a session with (user, device).
///
/// The one-time pre-key is not consumed here; it is consumed when the
/// recipient processes the initiating message.
pub async fn fetch_pre_key_bundle(
    state: &AppState,
    user_id: &str,
    device_id: u32,
) -> CustodyResult<PreKeyBundle> {
    let identity = state.store.load_identity(user_id, device_id).await?;

    let signed = state
        .repo
        .find_active_signed_prekey(user_id)
        .await?
        .ok_or_else(|| {
            CustodyError::BundleIncomplete(format!("no active signed pre-key for {}", user_id))
        })?;

    let one_time = state
        .repo
        .peek_available_one_time_prekey(user_id, Utc::now())
        .await?;
    if one_time.is_none() {
        tracing::info!(user_id, "One-time pre-keys exhausted, serving bundle without one");
    }

    Ok(PreKeyBundle {
        user_id: user_id.to_string(),
        device_id,
        registration_id: identity.registration_id,
        identity_key: identity.public_key,
        signed_pre_key: SignedPreKeyPublic {
            key_id: signed.key_id,
            public_key: signed.public_key,
            signature: signed.signature,
        },
        one_time_pre_key: one_time.map(|key| OneTimePreKeyPublic {
            key_id: key.key_id,
            public_key: key.public_key,
        }),
    })
}

fn validate_upload(user_id: &str, upload: &KeyBundleUpload) -> CustodyResult<()> {
    if user_id.trim().is_empty() {
        return Err(CustodyError::Validation("user id is empty".into()));
    }
    if !(1..=MAX_REGISTRATION_ID).contains(&upload.registration_id) {
        return Err(CustodyError::Validation(format!(
            "registration id {} outside 1..={}",
            upload.registration_id, MAX_REGISTRATION_ID
        )));
    }
    if upload.device_id == 0 {
        return Err(CustodyError::Validation("device id must be at least 1".into()));
    }
    check_key_len("identity key", &upload.identity_key)?;

    let signed = &upload.signed_pre_key;
    check_key_id("signed pre-key", signed.key_id)?;
    check_key_len("signed pre-key", &signed.public_key)?;
    if signed.signature.len() != SIGNATURE_LEN {
        return Err(CustodyError::Validation(format!(
            "signed pre-key signature must be {} bytes",
            SIGNATURE_LEN
        )));
    }
    verify_signature(&upload.identity_key, &signed.public_key, &signed.signature)
        .map_err(|_| CustodyError::Validation("signed pre-key signature does not verify".into()))?;

    let count = upload.one_time_pre_keys.len();
    if count == 0 || count > MAX_PREKEY_BATCH as usize {
        return Err(CustodyError::Validation(format!(
            "one-time pre-key batch of {} outside 1..={}",
            count, MAX_PREKEY_BATCH
        )));
    }

    let mut seen = HashSet::with_capacity(count);
    for key in &upload.one_time_pre_keys {
        check_key_id("one-time pre-key", key.key_id)?;
        check_key_len("one-time pre-key", &key.public_key)?;
        if !seen.insert(key.key_id) {
            return Err(CustodyError::Validation(format!(
                "duplicate one-time pre-key id {}",
                key.key_id
            )));
        }
    }
    Ok(())
}

fn check_key_len(what: &str, key: &[u8]) -> CustodyResult<()> {
    if key.len() != KEY_LEN {
        return Err(CustodyError::Validation(format!(
            "{} must be {} bytes, got {}",
            what,
            KEY_LEN,
            key.len()
        )));
    }
    Ok(())
}

fn check_key_id(what: &str, key_id: u32) -> CustodyResult<()> {
    if key_id > MAX_KEY_ID {
        return Err(CustodyError::Validation(format!(
            "{} id {} exceeds {}",
            what, key_id, MAX_KEY_ID
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::crypto::{HumanSecret, IdentityKeyPair, PreKeyPair, SignedPreKeyPair};

    async fn state() -> AppState {
        AppState::in_memory(Config {
            key_encryption_secret: HumanSecret::new("operator"),
            pbkdf2_iterations: 1_000,
            ..Config::default()
        })
        .await
        .unwrap()
    }

    fn upload(
        identity: &IdentityKeyPair,
        signed_id: u32,
        one_time_ids: std::ops::RangeInclusive<u32>,
    ) -> KeyBundleUpload {
        let signed = SignedPreKeyPair::generate(signed_id, identity);
        KeyBundleUpload {
            identity_key: identity.public_key_bytes(),
            registration_id: 1234,
            device_id: 1,
            signed_pre_key: SignedPreKeyPublic {
                key_id: signed.key_id,
                public_key: signed.public_key,
                signature: signed.signature,
            },
            one_time_pre_keys: one_time_ids
                .map(|key_id| {
                    let pair = PreKeyPair::generate(key_id);
                    OneTimePreKeyPublic {
                        key_id,
                        public_key: pair.public_key,
                    }
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_register_then_fetch() {
        let state = state().await;
        let identity = IdentityKeyPair::generate();

        let receipt = register_keys(&state, "alice", upload(&identity, 1, 1..=3)).await.unwrap();
        assert_eq!(receipt.one_time_pre_keys_stored, 3);
        assert!(!receipt.identity_replaced);

        let bundle = fetch_pre_key_bundle(&state, "alice", 1).await.unwrap();
        assert_eq!(bundle.identity_key, identity.public_key_bytes());
        assert_eq!(bundle.registration_id, 1234);
        assert_eq!(bundle.signed_pre_key.key_id, 1);
        verify_signature(
            &bundle.identity_key,
            &bundle.signed_pre_key.public_key,
            &bundle.signed_pre_key.signature,
        )
        .unwrap();
        assert_eq!(bundle.one_time_pre_key.map(|k| k.key_id), Some(1));

        // Fetching does not consume
        let again = fetch_pre_key_bundle(&state, "alice", 1).await.unwrap();
        assert_eq!(again.one_time_pre_key.map(|k| k.key_id), Some(1));
    }

    #[tokio::test]
    async fn test_reregistration_with_new_identity() {
        let state = state().await;
        register_keys(&state, "alice", upload(&IdentityKeyPair::generate(), 1, 1..=2))
            .await
            .unwrap();

        let replacement = IdentityKeyPair::generate();
        let receipt = register_keys(&state, "alice", upload(&replacement, 2, 3..=4)).await.unwrap();
        assert!(receipt.identity_replaced);

        let bundle = fetch_pre_key_bundle(&state, "alice", 1).await.unwrap();
        assert_eq!(bundle.identity_key, replacement.public_key_bytes());
        assert_eq!(bundle.signed_pre_key.key_id, 2);
    }

    async fn rejected(state: &AppState, upload: KeyBundleUpload) -> bool {
        matches!(
            register_keys(state, "alice", upload).await,
            Err(CustodyError::Validation(_))
        )
    }

    #[tokio::test]
    async fn test_malformed_bundles_rejected() {
        let state = state().await;
        let identity = IdentityKeyPair::generate();

        let mut bad = upload(&identity, 1, 1..=2);
        bad.registration_id = 0;
        assert!(rejected(&state, bad).await);

        let mut bad = upload(&identity, 1, 1..=2);
        bad.registration_id = MAX_REGISTRATION_ID + 1;
        assert!(rejected(&state, bad).await);

        let mut bad = upload(&identity, 1, 1..=2);
        bad.device_id = 0;
        assert!(rejected(&state, bad).await);

        let mut bad = upload(&identity, 1, 1..=2);
        bad.signed_pre_key.signature[0] ^= 0xFF;
        assert!(rejected(&state, bad).await);

        let mut bad = upload(&identity, 1, 1..=2);
        bad.one_time_pre_keys[1].key_id = 1;
        assert!(rejected(&state, bad).await);

        let mut bad = upload(&identity, 1, 1..=2);
        bad.one_time_pre_keys[0].public_key.pop();
        assert!(rejected(&state, bad).await);

        let bad = upload(&identity, MAX_KEY_ID + 1, 1..=2);
        assert!(rejected(&state, bad).await);

        let bad = upload(&identity, 1, 1..=(MAX_PREKEY_BATCH + 1));
        assert!(rejected(&state, bad).await);

        let mut bad = upload(&identity, 1, 1..=1);
        bad.one_time_pre_keys.clear();
        assert!(rejected(&state, bad).await);

        // Nothing was committed
        assert!(matches!(
            fetch_pre_key_bundle(&state, "alice", 1).await,
            Err(CustodyError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_conflicting_key_ids_commit_nothing() {
        let state = state().await;
        let identity = IdentityKeyPair::generate();
        register_keys(&state, "alice", upload(&identity, 1, 1..=2)).await.unwrap();

        // One-time id 2 already exists: the new signed pre-key must not land
        let err = register_keys(&state, "alice", upload(&identity, 7, 2..=3)).await.unwrap_err();
        assert!(matches!(err, CustodyError::Validation(_)));

        let bundle = fetch_pre_key_bundle(&state, "alice", 1).await.unwrap();
        assert_eq!(bundle.signed_pre_key.key_id, 1);
        assert_eq!(
            state.repo.count_available_one_time_prekeys("alice", Utc::now()).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_bundle_without_signed_pre_key_is_incomplete() {
        let state = state().await;
        let identity = IdentityKeyPair::generate();
        register_keys(&state, "alice", upload(&identity, 1, 1..=1)).await.unwrap();
        state.repo.deactivate_signed_prekey("alice", 1, Utc::now()).await.unwrap();

        assert!(matches!(
            fetch_pre_key_bundle(&state, "alice", 1).await,
            Err(CustodyError::BundleIncomplete(_))
        ));
    }

    #[tokio::test]
    async fn test_bundle_omits_exhausted_one_time_key() {
        let state = state().await;
        let identity = IdentityKeyPair::generate();
        register_keys(&state, "alice", upload(&identity, 1, 1..=1)).await.unwrap();
        state.repo.consume_one_time_prekey("alice", 1, Utc::now()).await.unwrap();

        let bundle = fetch_pre_key_bundle(&state, "alice", 1).await.unwrap();
        assert!(bundle.one_time_pre_key.is_none());
    }
}
