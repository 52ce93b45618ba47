//! Fault-injecting cache wrapper
//!
//! Delegates to an inner backend but fails a configurable fraction of
//! operations with [`CacheError::Unavailable`]. Used to check that cache
//! outages never fail callers. Seeded, so runs are reproducible.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{CacheBackend, CacheError, CacheResult};

const DEFAULT_SEED: u64 = 0x1234_5678_9ABC_DEF0;

#[derive(Clone)]
pub struct ChaoticCache<C: CacheBackend> {
    inner: C,
    /// 0.0 never fails, 1.0 always fails
    failure_rate: f64,
    rng: Arc<Mutex<StdRng>>,
    operation_count: Arc<AtomicUsize>,
}

impl<C: CacheBackend> ChaoticCache<C> {
    /// `failure_rate` is clamped into `[0.0, 1.0]`
    pub fn new(inner: C, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, DEFAULT_SEED)
    }

    pub fn with_seed(inner: C, failure_rate: f64, seed: u64) -> Self {
        Self {
            inner,
            failure_rate: failure_rate.max(0.0).min(1.0),
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
            operation_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Underlying backend, for checking state after chaos
    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Total operations attempted, failed ones included
    pub fn operation_count(&self) -> usize {
        self.operation_count.load(Ordering::Relaxed)
    }

    fn inject(&self) -> CacheResult<()> {
        self.operation_count.fetch_add(1, Ordering::Relaxed);
        // A poisoned RNG counts as a failure
        let fail = self
            .rng
            .lock()
            .map(|mut rng| rng.gen_bool(self.failure_rate))
            .unwrap_or(true);
        if fail {
            Err(CacheError::Unavailable("chaotic failure injection".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<C: CacheBackend> CacheBackend for ChaoticCache<C> {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.inject()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()> {
        self.inject()?;
        self.inner.set(key, value, ttl).await
    }

    async fn set_if_newer(
        &self,
        key: &str,
        version: i64,
        value: Vec<u8>,
        ttl: Duration,
    ) -> CacheResult<bool> {
        self.inject()?;
        self.inner.set_if_newer(key, version, value, ttl).await
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.inject()?;
        self.inner.delete(key).await
    }

    async fn delete_prefix(&self, prefix: &str) -> CacheResult<u64> {
        self.inject()?;
        self.inner.delete_prefix(prefix).await
    }

    async fn ping(&self) -> CacheResult<()> {
        self.inject()?;
        self.inner.ping().await
    }
}
