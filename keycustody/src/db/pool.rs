//! Database pool and cross-table queries

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;

use crate::error::CustodyResult;
use crate::models::DeletedKeys;

const MAX_CONNECTIONS: u32 = 8;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the key/session store
#[derive(Debug, Clone)]
pub struct Repository {
    pub(super) pool: SqlitePool,
}

impl Repository {
    /// Connect to a SQLite database and run migrations
    pub async fn connect(database_url: &str) -> CustodyResult<Self> {
        // WAL for concurrent readers alongside the scheduler's writes
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await?;

        let repo = Self::from_pool(pool).await?;
        tracing::info!("Database initialized with WAL mode at: {}", database_url);
        Ok(repo)
    }

    /// Private in-memory database, used by tests and ephemeral deployments
    ///
    /// A single connection that never idles out: every connection to
    /// `sqlite::memory:` is its own database.
    pub async fn in_memory() -> CustodyResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> CustodyResult<Self> {
        sqlx::migrate!("../migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn ping(&self) -> CustodyResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Close the pool; later calls fail with `StorageUnavailable`
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Every user that owns key material
    pub async fn list_user_ids(&self) -> CustodyResult<Vec<String>> {
        let users = sqlx::query_scalar::<_, String>(
            r#"
            SELECT user_id FROM identity_keys WHERE state = 'current'
            UNION
            SELECT user_id FROM signed_prekeys
            UNION
            SELECT user_id FROM one_time_prekeys
            ORDER BY 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(users)
    }

    /// Remove every key, trust and session row owned by a user.
    ///
    /// The audit trail is kept.
    pub async fn delete_all_keys_for_user(&self, user_id: &str) -> CustodyResult<DeletedKeys> {
        let mut tx = self.pool.begin().await?;

        let identity_keys = sqlx::query("DELETE FROM identity_keys WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let signed_pre_keys = sqlx::query("DELETE FROM signed_prekeys WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let one_time_pre_keys = sqlx::query("DELETE FROM one_time_prekeys WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let trust_records = sqlx::query("DELETE FROM identity_trust WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let sessions = sqlx::query("DELETE FROM sessions WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(DeletedKeys {
            identity_keys,
            signed_pre_keys,
            one_time_pre_keys,
            trust_records,
            sessions,
        })
    }
}
