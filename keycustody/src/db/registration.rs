//! Atomic key bundle registration

use chrono::Utc;

use super::identity::{find_current_identity_in, install_identity};
use super::prekeys::insert_one_time_prekeys;
use super::signed_prekeys::activate_signed_prekey;
use super::Repository;
use crate::crypto::constant_time_eq;
use crate::error::CustodyResult;
use crate::models::{IdentityKeyRecord, OneTimePreKeyRecord, SignedPreKeyRecord};

/// Validated records ready to be committed together
#[derive(Debug, Clone)]
pub struct NewRegistration {
    pub identity: IdentityKeyRecord,
    pub signed_pre_key: SignedPreKeyRecord,
    pub one_time_pre_keys: Vec<OneTimePreKeyRecord>,
}

impl Repository {
    /// Commit identity, signed pre-key and one-time pre-keys in one
    /// transaction. Any conflict rolls everything back.
    ///
    /// Returns true when a different identity key was superseded.
    pub async fn register_bundle(&self, registration: &NewRegistration) -> CustodyResult<bool> {
        let identity = &registration.identity;
        let mut tx = self.pool.begin().await?;

        let existing =
            find_current_identity_in(&mut tx, &identity.user_id, identity.device_id).await?;
        let replaced = match existing {
            Some(current) if constant_time_eq(&current.public_key, &identity.public_key) => {
                if current.registration_id != identity.registration_id {
                    sqlx::query("UPDATE identity_keys SET registration_id = ? WHERE id = ?")
                        .bind(i64::from(identity.registration_id))
                        .bind(&current.id)
                        .execute(&mut *tx)
                        .await?;
                }
                false
            }
            Some(_) | None => install_identity(&mut tx, identity).await?,
        };

        activate_signed_prekey(&mut tx, &registration.signed_pre_key, Utc::now()).await?;
        insert_one_time_prekeys(&mut tx, &registration.one_time_pre_keys).await?;

        tx.commit().await?;
        Ok(replaced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CustodyError;
    use crate::models::{OneTimePreKeyState, SignedPreKeyState};
    use chrono::Duration;

    fn registration(identity_key: u8, signed_id: u32, one_time_ids: &[u32]) -> NewRegistration {
        let now = Utc::now();
        NewRegistration {
            identity: IdentityKeyRecord::new("alice", 1, 42, vec![identity_key; 32], None),
            signed_pre_key: SignedPreKeyRecord {
                user_id: "alice".into(),
                key_id: signed_id,
                public_key: vec![2; 32],
                signature: vec![3; 64],
                state: SignedPreKeyState::Active,
                created_at: now,
                expires_at: now + Duration::days(30),
            },
            one_time_pre_keys: one_time_ids
                .iter()
                .map(|&key_id| OneTimePreKeyRecord {
                    user_id: "alice".into(),
                    key_id,
                    public_key: vec![4; 32],
                    state: OneTimePreKeyState::Available,
                    created_at: now,
                    expires_at: now + Duration::days(90),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_register_commits_everything() {
        let repo = Repository::in_memory().await.unwrap();
        let replaced = repo.register_bundle(&registration(1, 1, &[1, 2, 3])).await.unwrap();
        assert!(!replaced);

        assert!(repo.find_current_identity("alice", 1).await.unwrap().is_some());
        assert_eq!(repo.find_active_signed_prekey("alice").await.unwrap().unwrap().key_id, 1);
        assert_eq!(repo.count_available_one_time_prekeys("alice", Utc::now()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_conflict_commits_nothing() {
        let repo = Repository::in_memory().await.unwrap();
        repo.register_bundle(&registration(1, 1, &[1, 2])).await.unwrap();

        // New identity and signed key, but one-time id 2 was already issued
        let err = repo.register_bundle(&registration(9, 2, &[2, 3])).await.unwrap_err();
        assert!(matches!(err, CustodyError::Validation(_)));

        let identity = repo.find_current_identity("alice", 1).await.unwrap().unwrap();
        assert_eq!(identity.public_key, vec![1; 32]);
        assert_eq!(repo.find_active_signed_prekey("alice").await.unwrap().unwrap().key_id, 1);
        assert_eq!(repo.max_one_time_prekey_id("alice").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_new_identity_key_supersedes() {
        let repo = Repository::in_memory().await.unwrap();
        repo.register_bundle(&registration(1, 1, &[1])).await.unwrap();
        assert!(!repo.register_bundle(&registration(1, 2, &[2])).await.unwrap());
        assert!(repo.register_bundle(&registration(5, 3, &[3])).await.unwrap());
        assert_eq!(repo.list_identity_history("alice", 1).await.unwrap().len(), 2);
    }
}
