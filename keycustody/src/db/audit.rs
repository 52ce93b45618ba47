//! Rotation audit trail

use sqlx::SqliteConnection;

use super::{column_u32, from_millis, to_millis, Repository};
use crate::error::{CustodyError, CustodyResult};
use crate::models::{RotationAuditEntry, RotationKind};

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: String,
    user_id: String,
    kind: String,
    previous_key_id: Option<i64>,
    new_key_id: Option<i64>,
    keys_added: Option<i64>,
    success: bool,
    error: Option<String>,
    duration_ms: i64,
    created_at: i64,
}

impl TryFrom<AuditRow> for RotationAuditEntry {
    type Error = CustodyError;

    fn try_from(row: AuditRow) -> CustodyResult<Self> {
        let kind = RotationKind::parse(&row.kind).ok_or_else(|| {
            CustodyError::Serialization(format!("unknown rotation kind: {}", row.kind))
        })?;

        Ok(RotationAuditEntry {
            id: row.id,
            user_id: row.user_id,
            kind,
            previous_key_id: row
                .previous_key_id
                .map(|id| column_u32(id, "previous_key_id"))
                .transpose()?,
            new_key_id: row.new_key_id.map(|id| column_u32(id, "new_key_id")).transpose()?,
            keys_added: row.keys_added.map(|n| column_u32(n, "keys_added")).transpose()?,
            success: row.success,
            error: row.error,
            duration_ms: row.duration_ms,
            created_at: from_millis(row.created_at),
        })
    }
}

pub(super) async fn insert_audit(
    conn: &mut SqliteConnection,
    entry: &RotationAuditEntry,
) -> CustodyResult<()> {
    sqlx::query(
        r#"
        INSERT INTO rotation_audit
            (id, user_id, kind, previous_key_id, new_key_id, keys_added,
             success, error, duration_ms, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&entry.id)
    .bind(&entry.user_id)
    .bind(entry.kind.as_str())
    .bind(entry.previous_key_id.map(i64::from))
    .bind(entry.new_key_id.map(i64::from))
    .bind(entry.keys_added.map(i64::from))
    .bind(entry.success)
    .bind(&entry.error)
    .bind(entry.duration_ms)
    .bind(to_millis(entry.created_at))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

impl Repository {
    /// Append a standalone entry (failed attempts have no key transaction)
    pub async fn record_audit_entry(&self, entry: &RotationAuditEntry) -> CustodyResult<()> {
        let mut conn = self.pool.acquire().await?;
        insert_audit(&mut conn, entry).await
    }

    /// Most recent entries first, optionally for one user
    pub async fn list_audit_entries(
        &self,
        user_id: Option<&str>,
        limit: u32,
    ) -> CustodyResult<Vec<RotationAuditEntry>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, user_id, kind, previous_key_id, new_key_id, keys_added,
                   success, error, duration_ms, created_at
            FROM rotation_audit
            WHERE (?1 IS NULL OR user_id = ?1)
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?2
            "#,
        )
        .bind(user_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RotationAuditEntry::try_from).collect()
    }
}
