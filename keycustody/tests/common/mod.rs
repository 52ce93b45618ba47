#![allow(dead_code)]

use keycustody::config::Config;
use keycustody::crypto::HumanSecret;
use keycustody::state::AppState;
use tempfile::TempDir;

pub fn config() -> Config {
    Config {
        key_encryption_secret: HumanSecret::new("integration-secret"),
        pbkdf2_iterations: 1_000,
        ..Config::default()
    }
}

pub async fn memory_state() -> AppState {
    AppState::in_memory(config()).await.unwrap()
}

/// File-backed state, for tests that need real connection concurrency
pub async fn file_state(dir: &TempDir) -> AppState {
    let mut config = config();
    config.database_url = format!("sqlite://{}", dir.path().join("keycustody.db").display());
    AppState::new(config).await.unwrap()
}
