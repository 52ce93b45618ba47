//! Application state
//!
//! Owns every constructed component. Nothing here is global: command
//! handlers and the scheduler receive what they need from [`AppState`].

use std::sync::Arc;

use crate::cache::CacheTier;
use crate::config::Config;
use crate::crypto::{KeyGenerator, KeyMaterialCodec};
use crate::db::Repository;
use crate::error::{CustodyError, CustodyResult};
use crate::scheduler::{HttpNotifier, LifecycleScheduler, LogNotifier, Notifier};
use crate::store::ProtocolStore;

pub struct AppState {
    pub config: Config,
    pub repo: Repository,
    pub cache: CacheTier,
    pub generator: KeyGenerator,
    pub store: ProtocolStore,
    pub scheduler: Arc<LifecycleScheduler>,
}

impl AppState {
    /// Connect to the configured database and assemble the components
    pub async fn new(config: Config) -> CustodyResult<Self> {
        let repo = Repository::connect(&config.database_url).await?;
        Self::assemble(config, repo)
    }

    /// Same wiring over a private in-memory database
    pub async fn in_memory(config: Config) -> CustodyResult<Self> {
        let repo = Repository::in_memory().await?;
        Self::assemble(config, repo)
    }

    fn assemble(config: Config, repo: Repository) -> CustodyResult<Self> {
        let codec = KeyMaterialCodec::new(config.pbkdf2_iterations)?;
        let generator = KeyGenerator::new(codec, config.key_encryption_secret.clone());
        let cache = CacheTier::in_memory(&config.cache);
        let store = ProtocolStore::new(
            repo.clone(),
            cache.clone(),
            generator.clone(),
            config.keys.clone(),
        );

        let notifier: Arc<dyn Notifier> = match &config.notifier.endpoint {
            Some(endpoint) => Arc::new(
                HttpNotifier::new(endpoint, config.notifier.timeout())
                    .map_err(|e| CustodyError::Config(e.to_string()))?,
            ),
            None => Arc::new(LogNotifier),
        };

        let scheduler = Arc::new(LifecycleScheduler::new(
            store.clone(),
            generator.clone(),
            notifier,
            config.scheduler.clone(),
        ));

        Ok(Self {
            config,
            repo,
            cache,
            generator,
            store,
            scheduler,
        })
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("database_url", &self.config.database_url)
            .field("repo", &self.repo)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

/// Shared state handed to command handlers
pub type SharedState = Arc<AppState>;

pub async fn create_shared_state(config: Config) -> CustodyResult<SharedState> {
    let state = AppState::new(config).await?;
    Ok(Arc::new(state))
}
