//! Operator commands

use chrono::Utc;

use crate::cache::CacheKey;
use crate::error::CustodyResult;
use crate::models::{
    DeletedKeys, HealthStatus, IdentityKeyRecord, KeyStatus, RotationAuditEntry, RotationReport,
    SignedPreKeyStatus,
};
use crate::state::AppState;

const MAX_HISTORY: u32 = 500;

/// Key inventory for a user
pub async fn key_status(state: &AppState, user_id: &str) -> CustodyResult<KeyStatus> {
    let now = Utc::now();
    let has_identity_key = state.repo.find_primary_identity(user_id).await?.is_some();

    let lookahead = state.config.scheduler.rotation_lookahead();
    let signed_pre_key = state
        .repo
        .find_active_signed_prekey(user_id)
        .await?
        .map(|record| SignedPreKeyStatus {
            key_id: record.key_id,
            created_at: record.created_at,
            expires_at: record.expires_at,
            needs_rotation: record.expires_at <= now + lookahead,
        });

    let available = state.repo.count_available_one_time_prekeys(user_id, now).await?;

    Ok(KeyStatus {
        user_id: user_id.to_string(),
        has_identity_key,
        signed_pre_key,
        available_one_time_pre_keys: available,
        needs_replenishment: available < state.config.scheduler.prekey_floor,
    })
}

/// Rotate one user's signed pre-key now, or run the expiry pass for everyone
pub async fn trigger_rotation(
    state: &AppState,
    user_id: Option<&str>,
) -> CustodyResult<RotationReport> {
    let report = match user_id {
        Some(user_id) => state.scheduler.rotate_user(user_id).await,
        None => state.scheduler.run_rotation().await?,
    };
    tracing::info!(
        user_id = ?user_id,
        succeeded = report.succeeded,
        failed = report.failed,
        "Manual rotation"
    );
    Ok(report)
}

/// Top up one user, or every user below the floor
pub async fn trigger_replenishment(
    state: &AppState,
    user_id: Option<&str>,
) -> CustodyResult<RotationReport> {
    let report = match user_id {
        Some(user_id) => state.scheduler.replenish_user(user_id).await,
        None => state.scheduler.run_replenishment().await?,
    };
    tracing::info!(
        user_id = ?user_id,
        succeeded = report.succeeded,
        skipped = report.skipped,
        failed = report.failed,
        "Manual replenishment"
    );
    Ok(report)
}

/// Wipe a user's keys, trust records and sessions. Audit rows are kept.
pub async fn delete_user_keys(state: &AppState, user_id: &str) -> CustodyResult<DeletedKeys> {
    let deleted = state.repo.delete_all_keys_for_user(user_id).await?;
    let evicted = state.store.invalidate_user(user_id).await;

    tracing::warn!(user_id, rows = deleted.total(), evicted, "All key material deleted for user");
    Ok(deleted)
}

/// Replace a device's identity with a fresh server-custodied one.
///
/// The signed pre-key is re-issued right away, since the old one is signed by
/// the identity being replaced.
pub async fn regenerate_identity(
    state: &AppState,
    user_id: &str,
    device_id: u32,
) -> CustodyResult<IdentityKeyRecord> {
    let generator = state.generator.clone();
    let generated = tokio::task::spawn_blocking(move || generator.generate_identity()).await??;

    let record = IdentityKeyRecord::new(
        user_id,
        device_id,
        generated.registration_id,
        generated.public_key,
        Some(generated.wrapped_private_key),
    );
    let replaced = state.repo.replace_identity(&record).await?;
    state.cache.invalidate(&CacheKey::identity(user_id, device_id)).await;

    if replaced {
        tracing::warn!(user_id, device_id, "Identity key regenerated, previous key superseded");
    } else {
        tracing::info!(user_id, device_id, "Custodial identity key created");
    }

    let report = state.scheduler.rotate_user(user_id).await;
    if report.failed > 0 {
        tracing::warn!(user_id, "Signed pre-key re-issue after identity regeneration failed");
    }

    Ok(record)
}

/// Newest audit entries first, optionally for one user
pub async fn rotation_history(
    state: &AppState,
    user_id: Option<&str>,
    limit: u32,
) -> CustodyResult<Vec<RotationAuditEntry>> {
    state
        .repo
        .list_audit_entries(user_id, limit.clamp(1, MAX_HISTORY))
        .await
}

pub async fn health(state: &AppState) -> HealthStatus {
    let storage = match state.repo.ping().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Storage health check failed: {}", e);
            false
        }
    };
    HealthStatus {
        storage,
        cache: state.cache.is_available().await,
    }
}
