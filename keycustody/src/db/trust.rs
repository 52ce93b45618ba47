//! Remote identity trust records

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use super::{column_u32, from_millis, to_millis, Repository};
use crate::error::{CustodyError, CustodyResult};
use crate::models::{IdentityObservation, IdentityTrustRecord, ProtocolAddress, TrustState};

#[derive(sqlx::FromRow)]
struct TrustRow {
    user_id: String,
    remote_name: String,
    remote_device_id: i64,
    identity_key: Vec<u8>,
    trust_state: String,
    first_seen_at: i64,
    verified_at: Option<i64>,
    updated_at: i64,
}

impl TryFrom<TrustRow> for IdentityTrustRecord {
    type Error = CustodyError;

    fn try_from(row: TrustRow) -> CustodyResult<Self> {
        let trust_state = TrustState::parse(&row.trust_state).ok_or_else(|| {
            CustodyError::Serialization(format!("unknown trust state: {}", row.trust_state))
        })?;

        Ok(IdentityTrustRecord {
            user_id: row.user_id,
            address: ProtocolAddress::new(
                row.remote_name,
                column_u32(row.remote_device_id, "remote_device_id")?,
            ),
            identity_key: row.identity_key,
            trust_state,
            first_seen_at: from_millis(row.first_seen_at),
            verified_at: row.verified_at.map(from_millis),
            updated_at: from_millis(row.updated_at),
        })
    }
}

async fn find_trust_in(
    conn: &mut SqliteConnection,
    user_id: &str,
    address: &ProtocolAddress,
) -> CustodyResult<Option<IdentityTrustRecord>> {
    let row = sqlx::query_as::<_, TrustRow>(
        r#"
        SELECT user_id, remote_name, remote_device_id, identity_key, trust_state,
               first_seen_at, verified_at, updated_at
        FROM identity_trust
        WHERE user_id = ? AND remote_name = ? AND remote_device_id = ?
        "#,
    )
    .bind(user_id)
    .bind(&address.name)
    .bind(i64::from(address.device_id))
    .fetch_optional(&mut *conn)
    .await?;

    row.map(IdentityTrustRecord::try_from).transpose()
}

async fn upsert_trust_in(
    conn: &mut SqliteConnection,
    record: &IdentityTrustRecord,
) -> CustodyResult<()> {
    sqlx::query(
        r#"
        INSERT INTO identity_trust
            (user_id, remote_name, remote_device_id, identity_key, trust_state,
             first_seen_at, verified_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(user_id, remote_name, remote_device_id) DO UPDATE SET
            identity_key = excluded.identity_key,
            trust_state = excluded.trust_state,
            verified_at = excluded.verified_at,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&record.user_id)
    .bind(&record.address.name)
    .bind(i64::from(record.address.device_id))
    .bind(&record.identity_key)
    .bind(record.trust_state.as_str())
    .bind(to_millis(record.first_seen_at))
    .bind(record.verified_at.map(to_millis))
    .bind(to_millis(record.updated_at))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

impl Repository {
    pub async fn find_trust(
        &self,
        user_id: &str,
        address: &ProtocolAddress,
    ) -> CustodyResult<Option<IdentityTrustRecord>> {
        let mut conn = self.pool.acquire().await?;
        find_trust_in(&mut conn, user_id, address).await
    }

    /// Record a remote identity key as seen by `user_id`.
    ///
    /// Read and write share one transaction so two observers cannot both
    /// report a first sighting.
    pub async fn observe_identity(
        &self,
        user_id: &str,
        address: &ProtocolAddress,
        identity_key: &[u8],
        now: DateTime<Utc>,
    ) -> CustodyResult<(IdentityObservation, IdentityTrustRecord)> {
        let mut tx = self.pool.begin().await?;

        let (observation, record) = match find_trust_in(&mut tx, user_id, address).await? {
            None => {
                let record =
                    IdentityTrustRecord::first_seen(user_id, address.clone(), identity_key, now);
                upsert_trust_in(&mut tx, &record).await?;
                (IdentityObservation::FirstSeen, record)
            }
            Some(mut record) => {
                let observation = record.observe(identity_key, now);
                if observation.is_change() {
                    upsert_trust_in(&mut tx, &record).await?;
                }
                (observation, record)
            }
        };

        tx.commit().await?;
        Ok((observation, record))
    }

    /// Mark the stored key trusted, provided it is the key the user verified
    pub async fn verify_trust(
        &self,
        user_id: &str,
        address: &ProtocolAddress,
        identity_key: &[u8],
        now: DateTime<Utc>,
    ) -> CustodyResult<IdentityTrustRecord> {
        let mut tx = self.pool.begin().await?;

        let mut record = find_trust_in(&mut tx, user_id, address)
            .await?
            .ok_or_else(|| CustodyError::NotFound(format!("identity for {}", address)))?;

        if !crate::crypto::constant_time_eq(&record.identity_key, identity_key) {
            return Err(CustodyError::Validation(format!(
                "verified key does not match stored identity for {}",
                address
            )));
        }

        record.verify(now);
        upsert_trust_in(&mut tx, &record).await?;
        tx.commit().await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_observe_lifecycle() {
        let repo = Repository::in_memory().await.unwrap();
        let bob = ProtocolAddress::new("bob", 1);
        let now = Utc::now();

        let (seen, _) = repo.observe_identity("alice", &bob, b"key-1", now).await.unwrap();
        assert_eq!(seen, IdentityObservation::FirstSeen);

        let (again, _) = repo.observe_identity("alice", &bob, b"key-1", now).await.unwrap();
        assert_eq!(again, IdentityObservation::Unchanged);

        repo.verify_trust("alice", &bob, b"key-1", now).await.unwrap();
        let (changed, record) = repo.observe_identity("alice", &bob, b"key-2", now).await.unwrap();
        assert_eq!(changed, IdentityObservation::Changed);
        assert_eq!(record.trust_state, TrustState::Changed);

        let stored = repo.find_trust("alice", &bob).await.unwrap().unwrap();
        assert_eq!(stored.trust_state, TrustState::Changed);
        assert!(stored.verified_at.is_none());
        assert_eq!(stored.identity_key, b"key-2");
    }

    #[tokio::test]
    async fn test_verify_requires_matching_key() {
        let repo = Repository::in_memory().await.unwrap();
        let bob = ProtocolAddress::new("bob", 1);
        let now = Utc::now();

        assert!(matches!(
            repo.verify_trust("alice", &bob, b"key-1", now).await,
            Err(CustodyError::NotFound(_))
        ));

        repo.observe_identity("alice", &bob, b"key-1", now).await.unwrap();
        assert!(matches!(
            repo.verify_trust("alice", &bob, b"other", now).await,
            Err(CustodyError::Validation(_))
        ));

        let verified = repo.verify_trust("alice", &bob, b"key-1", now).await.unwrap();
        assert_eq!(verified.trust_state, TrustState::Trusted);
        assert!(verified.verified_at.is_some());
    }

    #[tokio::test]
    async fn test_trust_is_per_owner() {
        let repo = Repository::in_memory().await.unwrap();
        let bob = ProtocolAddress::new("bob", 1);
        repo.observe_identity("alice", &bob, b"key-1", Utc::now()).await.unwrap();
        assert!(repo.find_trust("carol", &bob).await.unwrap().is_none());
    }
}
