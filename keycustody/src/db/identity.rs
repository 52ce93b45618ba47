//! Local identity key queries

use chrono::Utc;
use sqlx::SqliteConnection;

use super::{column_u32, from_millis, to_millis, Repository};
use crate::crypto::WrappedKey;
use crate::error::{CustodyError, CustodyResult};
use crate::models::{IdentityKeyRecord, IdentityKeyState};

#[derive(sqlx::FromRow)]
struct IdentityRow {
    id: String,
    user_id: String,
    device_id: i64,
    registration_id: i64,
    public_key: Vec<u8>,
    wrapped_private_key: Option<Vec<u8>>,
    state: String,
    created_at: i64,
}

impl TryFrom<IdentityRow> for IdentityKeyRecord {
    type Error = CustodyError;

    fn try_from(row: IdentityRow) -> CustodyResult<Self> {
        let state = match row.state.as_str() {
            "current" => IdentityKeyState::Current,
            "superseded" => IdentityKeyState::Superseded,
            other => {
                return Err(CustodyError::Serialization(format!(
                    "unknown identity state: {}",
                    other
                )))
            }
        };

        Ok(IdentityKeyRecord {
            id: row.id,
            user_id: row.user_id,
            device_id: column_u32(row.device_id, "device_id")?,
            registration_id: column_u32(row.registration_id, "registration_id")?,
            public_key: row.public_key,
            wrapped_private_key: row.wrapped_private_key.map(WrappedKey::from_bytes),
            state,
            created_at: from_millis(row.created_at),
        })
    }
}

const SELECT_IDENTITY: &str = r#"
    SELECT id, user_id, device_id, registration_id, public_key, wrapped_private_key,
           state, created_at
    FROM identity_keys
"#;

/// Make `record` the current identity for its (user, device).
///
/// Any previous current row is superseded. Returns whether one existed.
pub(super) async fn install_identity(
    conn: &mut SqliteConnection,
    record: &IdentityKeyRecord,
) -> CustodyResult<bool> {
    let now = to_millis(Utc::now());
    let superseded = sqlx::query(
        r#"
        UPDATE identity_keys
        SET state = 'superseded', superseded_at = ?
        WHERE user_id = ? AND device_id = ? AND state = 'current'
        "#,
    )
    .bind(now)
    .bind(&record.user_id)
    .bind(i64::from(record.device_id))
    .execute(&mut *conn)
    .await?
    .rows_affected();

    sqlx::query(
        r#"
        INSERT INTO identity_keys
            (id, user_id, device_id, registration_id, public_key, wrapped_private_key,
             state, created_at)
        VALUES (?, ?, ?, ?, ?, ?, 'current', ?)
        "#,
    )
    .bind(&record.id)
    .bind(&record.user_id)
    .bind(i64::from(record.device_id))
    .bind(i64::from(record.registration_id))
    .bind(&record.public_key)
    .bind(record.wrapped_private_key.as_ref().map(|w| w.as_bytes()))
    .bind(to_millis(record.created_at))
    .execute(&mut *conn)
    .await?;

    Ok(superseded > 0)
}

pub(super) async fn find_current_identity_in(
    conn: &mut SqliteConnection,
    user_id: &str,
    device_id: u32,
) -> CustodyResult<Option<IdentityKeyRecord>> {
    let row = sqlx::query_as::<_, IdentityRow>(&format!(
        "{} WHERE user_id = ? AND device_id = ? AND state = 'current'",
        SELECT_IDENTITY
    ))
    .bind(user_id)
    .bind(i64::from(device_id))
    .fetch_optional(&mut *conn)
    .await?;

    row.map(IdentityKeyRecord::try_from).transpose()
}

impl Repository {
    /// Current identity for a (user, device)
    pub async fn find_current_identity(
        &self,
        user_id: &str,
        device_id: u32,
    ) -> CustodyResult<Option<IdentityKeyRecord>> {
        let mut conn = self.pool.acquire().await?;
        find_current_identity_in(&mut conn, user_id, device_id).await
    }

    /// Current identity of the user's lowest-numbered device
    pub async fn find_primary_identity(
        &self,
        user_id: &str,
    ) -> CustodyResult<Option<IdentityKeyRecord>> {
        let row = sqlx::query_as::<_, IdentityRow>(&format!(
            "{} WHERE user_id = ? AND state = 'current' ORDER BY device_id ASC LIMIT 1",
            SELECT_IDENTITY
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(IdentityKeyRecord::try_from).transpose()
    }

    /// Install a new current identity, superseding the previous one.
    ///
    /// Returns true when an older identity was superseded.
    pub async fn replace_identity(&self, record: &IdentityKeyRecord) -> CustodyResult<bool> {
        let mut tx = self.pool.begin().await?;
        let replaced = install_identity(&mut tx, record).await?;
        tx.commit().await?;
        Ok(replaced)
    }

    /// Full history for a (user, device), newest first
    pub async fn list_identity_history(
        &self,
        user_id: &str,
        device_id: u32,
    ) -> CustodyResult<Vec<IdentityKeyRecord>> {
        let rows = sqlx::query_as::<_, IdentityRow>(&format!(
            "{} WHERE user_id = ? AND device_id = ? ORDER BY created_at DESC, state ASC",
            SELECT_IDENTITY
        ))
        .bind(user_id)
        .bind(i64::from(device_id))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(IdentityKeyRecord::try_from).collect()
    }
}
