mod common;

use std::sync::Arc;

use keycustody::cache::{CacheKey, CacheTier, ChaoticCache, MemoryCache};
use keycustody::config::{CacheConfig, KeyPolicy};
use keycustody::crypto::{HumanSecret, KeyGenerator, KeyMaterialCodec};
use keycustody::db::Repository;
use keycustody::models::ProtocolAddress;
use keycustody::store::{ProtocolStore, SessionStore};

#[tokio::test]
async fn test_bulk_delete_leaves_other_remotes() {
    let state = common::memory_state().await;
    let alice = state.store.for_user("alice", 1);
    let carol = state.store.for_user("carol", 1);

    for device in 1..=3 {
        alice.store_session(&ProtocolAddress::new("bob", device), b"bob").await.unwrap();
    }
    alice.store_session(&ProtocolAddress::new("dave", 1), b"dave").await.unwrap();
    carol.store_session(&ProtocolAddress::new("bob", 1), b"carol-bob").await.unwrap();

    // Warm the cache so deletion has to evict
    for device in 1..=3 {
        alice.load_session(&ProtocolAddress::new("bob", device)).await.unwrap();
    }

    assert_eq!(alice.delete_all_sessions("bob").await.unwrap(), 3);

    for device in 1..=3 {
        let address = ProtocolAddress::new("bob", device);
        assert!(alice.load_session(&address).await.unwrap().is_none());
        assert!(!alice.contains_session(&address).await.unwrap());
    }
    assert!(alice.get_sub_device_sessions("bob").await.unwrap().is_empty());

    // Another remote of the same user, and the same remote of another user
    assert_eq!(
        alice.load_session(&ProtocolAddress::new("dave", 1)).await.unwrap().unwrap().record,
        b"dave"
    );
    assert_eq!(
        carol.load_session(&ProtocolAddress::new("bob", 1)).await.unwrap().unwrap().record,
        b"carol-bob"
    );
}

#[tokio::test]
async fn test_late_read_through_cannot_regress_cache() {
    let state = common::memory_state().await;
    let alice = state.store.for_user("alice", 1);
    let bob = ProtocolAddress::new("bob", 2);

    alice.store_session(&bob, b"step-1").await.unwrap();
    let stale = state.repo.find_session("alice", &bob).await.unwrap().unwrap();
    let latest = alice.store_session(&bob, b"step-2").await.unwrap();

    // A reader that fetched step-1 before the write lands in the cache late
    let key = CacheKey::session("alice", &bob);
    assert!(!state.cache.put_session(&key, &stale).await);

    let loaded = alice.load_session(&bob).await.unwrap().unwrap();
    assert_eq!(loaded.record, b"step-2");
    assert_eq!(loaded.version, latest);
}

#[tokio::test]
async fn test_sessions_survive_cache_outage() {
    let repo = Repository::in_memory().await.unwrap();
    let generator =
        KeyGenerator::new(KeyMaterialCodec::new(1_000).unwrap(), HumanSecret::new("secret"));
    let chaos = ChaoticCache::new(MemoryCache::new(), 1.0);
    let cache = CacheTier::new(Arc::new(chaos.clone()), &CacheConfig::default());
    let store = ProtocolStore::new(repo, cache, generator, KeyPolicy::default());
    let alice = store.for_user("alice", 1);
    let bob = ProtocolAddress::new("bob", 2);

    for step in 0..20u32 {
        let record = step.to_be_bytes();
        let version = alice.store_session(&bob, &record).await.unwrap();
        let loaded = alice.load_session(&bob).await.unwrap().unwrap();
        assert_eq!(loaded.record, record);
        assert_eq!(loaded.version, version);
    }
    alice.delete_all_sessions("bob").await.unwrap();
    assert!(alice.load_session(&bob).await.unwrap().is_none());

    assert!(chaos.operation_count() > 0);
    assert!(chaos.inner().is_empty().await);
}
