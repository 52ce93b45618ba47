//! Signed pre-key queries

use chrono::{DateTime, Duration, Utc};
use sqlx::SqliteConnection;

use super::audit::insert_audit;
use super::{column_u32, from_millis, to_millis, Repository};
use crate::error::{CustodyError, CustodyResult};
use crate::models::{RotationAuditEntry, SignedPreKeyRecord, SignedPreKeyState};

#[derive(sqlx::FromRow)]
struct SignedPreKeyRow {
    user_id: String,
    key_id: i64,
    public_key: Vec<u8>,
    signature: Vec<u8>,
    state: String,
    created_at: i64,
    expires_at: i64,
    deactivated_at: Option<i64>,
}

impl TryFrom<SignedPreKeyRow> for SignedPreKeyRecord {
    type Error = CustodyError;

    fn try_from(row: SignedPreKeyRow) -> CustodyResult<Self> {
        let state = match (row.state.as_str(), row.deactivated_at) {
            ("active", _) => SignedPreKeyState::Active,
            ("inactive", Some(at)) => SignedPreKeyState::Inactive {
                deactivated_at: from_millis(at),
            },
            (other, _) => {
                return Err(CustodyError::Serialization(format!(
                    "invalid signed pre-key state: {}",
                    other
                )))
            }
        };

        Ok(SignedPreKeyRecord {
            user_id: row.user_id,
            key_id: column_u32(row.key_id, "key_id")?,
            public_key: row.public_key,
            signature: row.signature,
            state,
            created_at: from_millis(row.created_at),
            expires_at: from_millis(row.expires_at),
        })
    }
}

const SELECT_SIGNED: &str = r#"
    SELECT user_id, key_id, public_key, signature, state, created_at, expires_at, deactivated_at
    FROM signed_prekeys
"#;

/// Deactivate the user's active key and insert `record` as the new active key
pub(super) async fn activate_signed_prekey(
    conn: &mut SqliteConnection,
    record: &SignedPreKeyRecord,
    now: DateTime<Utc>,
) -> CustodyResult<()> {
    sqlx::query(
        r#"
        UPDATE signed_prekeys
        SET state = 'inactive', deactivated_at = ?
        WHERE user_id = ? AND state = 'active' AND key_id != ?
        "#,
    )
    .bind(to_millis(now))
    .bind(&record.user_id)
    .bind(i64::from(record.key_id))
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO signed_prekeys
            (user_id, key_id, public_key, signature, state, created_at, expires_at)
        VALUES (?, ?, ?, ?, 'active', ?, ?)
        "#,
    )
    .bind(&record.user_id)
    .bind(i64::from(record.key_id))
    .bind(&record.public_key)
    .bind(&record.signature)
    .bind(to_millis(record.created_at))
    .bind(to_millis(record.expires_at))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

impl Repository {
    pub async fn find_signed_prekey(
        &self,
        user_id: &str,
        key_id: u32,
    ) -> CustodyResult<Option<SignedPreKeyRecord>> {
        let row = sqlx::query_as::<_, SignedPreKeyRow>(&format!(
            "{} WHERE user_id = ? AND key_id = ?",
            SELECT_SIGNED
        ))
        .bind(user_id)
        .bind(i64::from(key_id))
        .fetch_optional(&self.pool)
        .await?;

        row.map(SignedPreKeyRecord::try_from).transpose()
    }

    pub async fn find_active_signed_prekey(
        &self,
        user_id: &str,
    ) -> CustodyResult<Option<SignedPreKeyRecord>> {
        let row = sqlx::query_as::<_, SignedPreKeyRow>(&format!(
            "{} WHERE user_id = ? AND state = 'active'",
            SELECT_SIGNED
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SignedPreKeyRecord::try_from).transpose()
    }

    /// Store a new active signed pre-key, deactivating the previous one.
    ///
    /// A key id that was already issued to the user is a `Validation` error.
    pub async fn store_signed_prekey(&self, record: &SignedPreKeyRecord) -> CustodyResult<()> {
        let mut tx = self.pool.begin().await?;
        activate_signed_prekey(&mut tx, record, Utc::now()).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Flip a key to inactive. Returns false if it was not active.
    pub async fn deactivate_signed_prekey(
        &self,
        user_id: &str,
        key_id: u32,
        now: DateTime<Utc>,
    ) -> CustodyResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE signed_prekeys
            SET state = 'inactive', deactivated_at = ?
            WHERE user_id = ? AND key_id = ? AND state = 'active'
            "#,
        )
        .bind(to_millis(now))
        .bind(user_id)
        .bind(i64::from(key_id))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Rotation commit: new active key, previous key deactivated, audit row
    pub async fn rotate_signed_prekey(
        &self,
        record: &SignedPreKeyRecord,
        audit: &RotationAuditEntry,
    ) -> CustodyResult<()> {
        let mut tx = self.pool.begin().await?;
        activate_signed_prekey(&mut tx, record, record.created_at).await?;
        insert_audit(&mut tx, audit).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Active keys whose expiry falls within `window` of `now`
    pub async fn signed_prekeys_expiring_within(
        &self,
        window: Duration,
        now: DateTime<Utc>,
    ) -> CustodyResult<Vec<SignedPreKeyRecord>> {
        let rows = sqlx::query_as::<_, SignedPreKeyRow>(&format!(
            "{} WHERE state = 'active' AND expires_at <= ? ORDER BY user_id",
            SELECT_SIGNED
        ))
        .bind(to_millis(now + window))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SignedPreKeyRecord::try_from).collect()
    }

    /// Highest signed pre-key id ever issued to the user
    pub async fn max_signed_prekey_id(&self, user_id: &str) -> CustodyResult<Option<u32>> {
        let max = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MAX(key_id) FROM signed_prekeys WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        max.map(|id| column_u32(id, "key_id")).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RotationKind;

    fn signed(user: &str, key_id: u32, expires_in: Duration) -> SignedPreKeyRecord {
        let now = Utc::now();
        SignedPreKeyRecord {
            user_id: user.to_string(),
            key_id,
            public_key: vec![key_id as u8; 32],
            signature: vec![7; 64],
            state: SignedPreKeyState::Active,
            created_at: now,
            expires_at: now + expires_in,
        }
    }

    #[tokio::test]
    async fn test_store_keeps_exactly_one_active() {
        let repo = Repository::in_memory().await.unwrap();
        repo.store_signed_prekey(&signed("alice", 1, Duration::days(30))).await.unwrap();
        repo.store_signed_prekey(&signed("alice", 2, Duration::days(30))).await.unwrap();

        let active = repo.find_active_signed_prekey("alice").await.unwrap().unwrap();
        assert_eq!(active.key_id, 2);

        let old = repo.find_signed_prekey("alice", 1).await.unwrap().unwrap();
        assert!(matches!(old.state, SignedPreKeyState::Inactive { .. }));
    }

    #[tokio::test]
    async fn test_reusing_key_id_is_rejected() {
        let repo = Repository::in_memory().await.unwrap();
        repo.store_signed_prekey(&signed("alice", 1, Duration::days(30))).await.unwrap();
        let err = repo
            .store_signed_prekey(&signed("alice", 1, Duration::days(30)))
            .await
            .unwrap_err();
        assert!(matches!(err, CustodyError::Validation(_)));
        assert!(repo.find_active_signed_prekey("alice").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expiring_within_window() {
        let repo = Repository::in_memory().await.unwrap();
        repo.store_signed_prekey(&signed("alice", 1, Duration::days(3))).await.unwrap();
        repo.store_signed_prekey(&signed("bob", 1, Duration::days(20))).await.unwrap();

        let expiring = repo
            .signed_prekeys_expiring_within(Duration::days(7), Utc::now())
            .await
            .unwrap();
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].user_id, "alice");
    }

    #[tokio::test]
    async fn test_rotation_commits_key_and_audit_together() {
        let repo = Repository::in_memory().await.unwrap();
        repo.store_signed_prekey(&signed("alice", 1, Duration::days(1))).await.unwrap();

        let audit = RotationAuditEntry::succeeded(
            "alice",
            RotationKind::SignedPreKey,
            std::time::Duration::ZERO,
        )
        .with_key_ids(Some(1), Some(2));
        repo.rotate_signed_prekey(&signed("alice", 2, Duration::days(30)), &audit)
            .await
            .unwrap();

        assert_eq!(repo.max_signed_prekey_id("alice").await.unwrap(), Some(2));
        assert_eq!(repo.list_audit_entries(Some("alice"), 10).await.unwrap().len(), 1);

        // A conflicting id rolls the audit row back with the key
        let err = repo
            .rotate_signed_prekey(&signed("alice", 2, Duration::days(30)), &audit)
            .await
            .unwrap_err();
        assert!(matches!(err, CustodyError::Validation(_)));
        assert_eq!(repo.list_audit_entries(Some("alice"), 10).await.unwrap().len(), 1);
        assert_eq!(
            repo.find_active_signed_prekey("alice").await.unwrap().unwrap().key_id,
            2
        );
    }

    #[tokio::test]
    async fn test_deactivate_only_once() {
        let repo = Repository::in_memory().await.unwrap();
        repo.store_signed_prekey(&signed("alice", 5, Duration::days(30))).await.unwrap();
        assert!(repo.deactivate_signed_prekey("alice", 5, Utc::now()).await.unwrap());
        assert!(!repo.deactivate_signed_prekey("alice", 5, Utc::now()).await.unwrap());
        assert!(repo.find_active_signed_prekey("alice").await.unwrap().is_none());
    }
}
