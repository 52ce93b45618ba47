//! One-time pre-key queries

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use super::audit::insert_audit;
use super::{column_u32, from_millis, to_millis, Repository};
use crate::error::{CustodyError, CustodyResult};
use crate::models::{OneTimePreKeyRecord, OneTimePreKeyState, PreKeyConsumption, RotationAuditEntry};

#[derive(sqlx::FromRow)]
struct OneTimePreKeyRow {
    user_id: String,
    key_id: i64,
    public_key: Vec<u8>,
    state: String,
    created_at: i64,
    expires_at: i64,
    used_at: Option<i64>,
}

impl TryFrom<OneTimePreKeyRow> for OneTimePreKeyRecord {
    type Error = CustodyError;

    fn try_from(row: OneTimePreKeyRow) -> CustodyResult<Self> {
        let state = match (row.state.as_str(), row.used_at) {
            ("available", _) => OneTimePreKeyState::Available,
            ("used", Some(at)) => OneTimePreKeyState::Used {
                used_at: from_millis(at),
            },
            (other, _) => {
                return Err(CustodyError::Serialization(format!(
                    "invalid one-time pre-key state: {}",
                    other
                )))
            }
        };

        Ok(OneTimePreKeyRecord {
            user_id: row.user_id,
            key_id: column_u32(row.key_id, "key_id")?,
            public_key: row.public_key,
            state,
            created_at: from_millis(row.created_at),
            expires_at: from_millis(row.expires_at),
        })
    }
}

const SELECT_ONE_TIME: &str = r#"
    SELECT user_id, key_id, public_key, state, created_at, expires_at, used_at
    FROM one_time_prekeys
"#;

/// Insert a batch of fresh keys; any already-issued id fails the whole batch
pub(super) async fn insert_one_time_prekeys(
    conn: &mut SqliteConnection,
    records: &[OneTimePreKeyRecord],
) -> CustodyResult<()> {
    for record in records {
        sqlx::query(
            r#"
            INSERT INTO one_time_prekeys
                (user_id, key_id, public_key, state, created_at, expires_at)
            VALUES (?, ?, ?, 'available', ?, ?)
            "#,
        )
        .bind(&record.user_id)
        .bind(i64::from(record.key_id))
        .bind(&record.public_key)
        .bind(to_millis(record.created_at))
        .bind(to_millis(record.expires_at))
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

impl Repository {
    pub async fn store_one_time_prekeys(
        &self,
        records: &[OneTimePreKeyRecord],
    ) -> CustodyResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_one_time_prekeys(&mut tx, records).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Replenishment commit: the batch and its audit row
    pub async fn replenish_one_time_prekeys(
        &self,
        records: &[OneTimePreKeyRecord],
        audit: &RotationAuditEntry,
    ) -> CustodyResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_one_time_prekeys(&mut tx, records).await?;
        insert_audit(&mut tx, audit).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn find_one_time_prekey(
        &self,
        user_id: &str,
        key_id: u32,
    ) -> CustodyResult<Option<OneTimePreKeyRecord>> {
        let row = sqlx::query_as::<_, OneTimePreKeyRow>(&format!(
            "{} WHERE user_id = ? AND key_id = ?",
            SELECT_ONE_TIME
        ))
        .bind(user_id)
        .bind(i64::from(key_id))
        .fetch_optional(&self.pool)
        .await?;

        row.map(OneTimePreKeyRecord::try_from).transpose()
    }

    /// Mark a key used.
    ///
    /// A single conditional update: among concurrent callers exactly one sees
    /// `Consumed`. Unknown ids are `NotFound`.
    pub async fn consume_one_time_prekey(
        &self,
        user_id: &str,
        key_id: u32,
        now: DateTime<Utc>,
    ) -> CustodyResult<PreKeyConsumption> {
        let result = sqlx::query(
            r#"
            UPDATE one_time_prekeys
            SET state = 'used', used_at = ?
            WHERE user_id = ? AND key_id = ? AND state = 'available'
            "#,
        )
        .bind(to_millis(now))
        .bind(user_id)
        .bind(i64::from(key_id))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(PreKeyConsumption::Consumed);
        }

        let exists = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM one_time_prekeys WHERE user_id = ? AND key_id = ?",
        )
        .bind(user_id)
        .bind(i64::from(key_id))
        .fetch_one(&self.pool)
        .await?;

        if exists > 0 {
            Ok(PreKeyConsumption::AlreadyConsumed)
        } else {
            Err(CustodyError::NotFound(format!(
                "one-time pre-key {} for {}",
                key_id, user_id
            )))
        }
    }

    /// Lowest-id available, unexpired key, without consuming it
    pub async fn peek_available_one_time_prekey(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> CustodyResult<Option<OneTimePreKeyRecord>> {
        let row = sqlx::query_as::<_, OneTimePreKeyRow>(&format!(
            "{} WHERE user_id = ? AND state = 'available' AND expires_at > ? \
             ORDER BY key_id ASC LIMIT 1",
            SELECT_ONE_TIME
        ))
        .bind(user_id)
        .bind(to_millis(now))
        .fetch_optional(&self.pool)
        .await?;

        row.map(OneTimePreKeyRecord::try_from).transpose()
    }

    pub async fn count_available_one_time_prekeys(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> CustodyResult<u32> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM one_time_prekeys
            WHERE user_id = ? AND state = 'available' AND expires_at > ?
            "#,
        )
        .bind(user_id)
        .bind(to_millis(now))
        .fetch_one(&self.pool)
        .await?;

        column_u32(count, "count")
    }

    /// Highest id ever issued, used keys included, so ids are never reissued
    pub async fn max_one_time_prekey_id(&self, user_id: &str) -> CustodyResult<Option<u32>> {
        let max = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MAX(key_id) FROM one_time_prekeys WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        max.map(|id| column_u32(id, "key_id")).transpose()
    }

    /// Users with a current identity whose available supply is below `floor`,
    /// paired with their current available count
    pub async fn users_below_one_time_prekey_floor(
        &self,
        floor: u32,
        now: DateTime<Utc>,
    ) -> CustodyResult<Vec<(String, u32)>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT u.user_id, COUNT(o.key_id) AS available
            FROM (SELECT DISTINCT user_id FROM identity_keys WHERE state = 'current') u
            LEFT JOIN one_time_prekeys o
                ON o.user_id = u.user_id AND o.state = 'available' AND o.expires_at > ?
            GROUP BY u.user_id
            HAVING COUNT(o.key_id) < ?
            ORDER BY u.user_id
            "#,
        )
        .bind(to_millis(now))
        .bind(i64::from(floor))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(user_id, available)| Ok((user_id, column_u32(available, "available")?)))
            .collect()
    }
}
