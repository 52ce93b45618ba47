//! Serialized ratchet session storage

use chrono::{DateTime, Utc};

use super::{column_u32, from_millis, to_millis, Repository};
use crate::error::CustodyResult;
use crate::models::{ProtocolAddress, SessionRecord};

#[derive(sqlx::FromRow)]
struct SessionRow {
    user_id: String,
    remote_name: String,
    remote_device_id: i64,
    record: Vec<u8>,
    version: i64,
    last_used_at: i64,
}

impl TryFrom<SessionRow> for SessionRecord {
    type Error = crate::error::CustodyError;

    fn try_from(row: SessionRow) -> CustodyResult<Self> {
        Ok(SessionRecord {
            user_id: row.user_id,
            address: ProtocolAddress::new(
                row.remote_name,
                column_u32(row.remote_device_id, "remote_device_id")?,
            ),
            record: row.record,
            version: row.version,
            last_used_at: from_millis(row.last_used_at),
        })
    }
}

impl Repository {
    pub async fn find_session(
        &self,
        user_id: &str,
        address: &ProtocolAddress,
    ) -> CustodyResult<Option<SessionRecord>> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT user_id, remote_name, remote_device_id, record, version, last_used_at
            FROM sessions
            WHERE user_id = ? AND remote_name = ? AND remote_device_id = ?
            "#,
        )
        .bind(user_id)
        .bind(&address.name)
        .bind(i64::from(address.device_id))
        .fetch_optional(&self.pool)
        .await?;

        row.map(SessionRecord::try_from).transpose()
    }

    /// Last-writer-wins upsert.
    ///
    /// Returns the stored version: never lower than the previous version
    /// plus one, and seeded from the wall clock so a recreated session still
    /// outranks whatever a cache may hold for the old one.
    pub async fn upsert_session(
        &self,
        user_id: &str,
        address: &ProtocolAddress,
        record: &[u8],
        now: DateTime<Utc>,
    ) -> CustodyResult<i64> {
        let now = to_millis(now);
        let version = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO sessions
                (user_id, remote_name, remote_device_id, record, version, created_at, last_used_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, remote_name, remote_device_id) DO UPDATE SET
                record = excluded.record,
                version = MAX(sessions.version + 1, excluded.version),
                last_used_at = excluded.last_used_at
            RETURNING version
            "#,
        )
        .bind(user_id)
        .bind(&address.name)
        .bind(i64::from(address.device_id))
        .bind(record)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(version)
    }

    pub async fn session_exists(
        &self,
        user_id: &str,
        address: &ProtocolAddress,
    ) -> CustodyResult<bool> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM sessions
            WHERE user_id = ? AND remote_name = ? AND remote_device_id = ?
            "#,
        )
        .bind(user_id)
        .bind(&address.name)
        .bind(i64::from(address.device_id))
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    /// Returns whether a row was removed
    pub async fn delete_session(
        &self,
        user_id: &str,
        address: &ProtocolAddress,
    ) -> CustodyResult<bool> {
        let result = sqlx::query(
            "DELETE FROM sessions WHERE user_id = ? AND remote_name = ? AND remote_device_id = ?",
        )
        .bind(user_id)
        .bind(&address.name)
        .bind(i64::from(address.device_id))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove every session with any device of `remote_name`
    pub async fn delete_all_sessions(
        &self,
        user_id: &str,
        remote_name: &str,
    ) -> CustodyResult<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE user_id = ? AND remote_name = ?")
            .bind(user_id)
            .bind(remote_name)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Device ids of `remote_name` with an open session, ascending
    pub async fn list_session_devices(
        &self,
        user_id: &str,
        remote_name: &str,
    ) -> CustodyResult<Vec<u32>> {
        let devices = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT remote_device_id FROM sessions
            WHERE user_id = ? AND remote_name = ?
            ORDER BY remote_device_id
            "#,
        )
        .bind(user_id)
        .bind(remote_name)
        .fetch_all(&self.pool)
        .await?;

        devices
            .into_iter()
            .map(|id| column_u32(id, "remote_device_id"))
            .collect()
    }
}
