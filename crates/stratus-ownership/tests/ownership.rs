// End-to-end ownership protocol tests against the in-memory store

use std::sync::Arc;
use stratus_coordination::{MemoryStore, MetadataStore};
use stratus_ownership::{EphemeralOwnerData, OwnershipCache};

fn owner_data(name: &str) -> EphemeralOwnerData {
    EphemeralOwnerData {
        native_url: format!("stratus://{name}:6650"),
        native_url_tls: Some(format!("stratus+tls://{name}:6651")),
        http_url: format!("http://{name}:8080"),
        http_url_tls: None,
        disabled: false,
    }
}

fn cache_on(store: &Arc<MemoryStore>, name: &str) -> Arc<OwnershipCache> {
    let session = store.create_session();
    Arc::new(OwnershipCache::new(
        Arc::clone(store) as Arc<dyn MetadataStore>,
        session,
        owner_data(name),
    ))
}

const BUNDLE: &str = "acme/east/orders/0x40000000_0x80000000";

#[tokio::test]
async fn concurrent_acquire_from_two_brokers_has_one_winner() {
    let store = Arc::new(MemoryStore::new());
    let a = cache_on(&store, "broker-a");
    let b = cache_on(&store, "broker-b");

    let (ra, rb) = tokio::join!(a.try_acquire(BUNDLE), b.try_acquire(BUNDLE));
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    // Exactly one resolves as self; the other sees the winner's payload
    assert_ne!(ra.owned_by_self, rb.owned_by_self);
    let (winner, loser) = if ra.owned_by_self { (ra, rb) } else { (rb, ra) };
    assert_eq!(loser.data.native_url, winner.data.native_url);
    assert_eq!(a.is_owned(BUNDLE) as u8 + b.is_owned(BUNDLE) as u8, 1);
}

#[tokio::test]
async fn concurrent_acquire_on_one_broker_shares_the_attempt() {
    let store = Arc::new(MemoryStore::new());
    let cache = cache_on(&store, "broker-a");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = Arc::clone(&cache);
        handles.push(tokio::spawn(async move { cache.try_acquire(BUNDLE).await }));
    }

    for handle in handles {
        let info = handle.await.unwrap().unwrap();
        assert!(info.owned_by_self);
    }
    assert_eq!(cache.owned_bundles().len(), 1);
}

#[tokio::test]
async fn winner_crash_frees_the_bundle_for_the_loser() {
    let store = Arc::new(MemoryStore::new());
    let winner_session = store.create_session();
    let winner = OwnershipCache::new(
        Arc::clone(&store) as Arc<dyn MetadataStore>,
        winner_session,
        owner_data("broker-a"),
    );
    let loser = cache_on(&store, "broker-b");

    winner.try_acquire(BUNDLE).await.unwrap();
    let first = loser.try_acquire(BUNDLE).await.unwrap();
    assert!(!first.owned_by_self);

    // Session loss deletes the ephemeral node; the loser can now win
    store.expire_session(winner_session);
    let second = loser.try_acquire(BUNDLE).await.unwrap();
    assert!(second.owned_by_self);
}

#[tokio::test]
async fn graceful_handover_disable_then_release() {
    let store = Arc::new(MemoryStore::new());
    let owner = cache_on(&store, "broker-a");
    let peer = cache_on(&store, "broker-b");

    owner.try_acquire(BUNDLE).await.unwrap();
    owner.disable_ownership(BUNDLE).await.unwrap();

    // Still locked while disabled
    let seen = peer.try_acquire(BUNDLE).await.unwrap();
    assert!(!seen.owned_by_self);
    assert!(seen.data.disabled);

    owner.remove_ownership(BUNDLE);
    assert!(!owner.is_owned(BUNDLE));
}
