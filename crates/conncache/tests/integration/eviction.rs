use std::sync::Arc;

use conncache::EntryStatus;

use crate::{MockConfig, mock_cache, setup, wait_until};

#[tokio::test]
async fn test_lru_eviction_closes_oldest() {
    setup();
    let (cache, driver) = mock_cache(2);

    for name in ["a", "b", "c"] {
        let lease = cache.acquire(MockConfig::new(name)).await.unwrap();
        drop(lease);
    }

    wait_until(|| cache.status(&MockConfig::new("a")).is_none()).await;
    assert_eq!(driver.closes("a"), 1);
    assert_eq!(driver.closes("b"), 0);
    assert_eq!(driver.closes("c"), 0);
    assert_eq!(cache.idle_len(), 2);

    // Evicted connections are opened again on demand.
    let lease = cache.acquire(MockConfig::new("a")).await.unwrap();
    assert!(!lease.is_closed());
    assert_eq!(driver.opens("a"), 2);
}

#[tokio::test]
async fn test_reacquire_refreshes_recency() {
    setup();
    let (cache, driver) = mock_cache(2);

    cache.acquire(MockConfig::new("a")).await.unwrap().release();
    cache.acquire(MockConfig::new("b")).await.unwrap().release();
    cache.acquire(MockConfig::new("a")).await.unwrap().release();
    cache.acquire(MockConfig::new("c")).await.unwrap().release();

    wait_until(|| driver.closes("b") == 1).await;
    assert_eq!(driver.closes("a"), 0);
    assert_eq!(driver.opens("a"), 1);
}

#[tokio::test]
async fn test_leased_connections_are_not_idle() {
    setup();
    let (cache, driver) = mock_cache(1);

    let a = cache.acquire(MockConfig::new("a")).await.unwrap();
    cache.acquire(MockConfig::new("b")).await.unwrap().release();
    cache.acquire(MockConfig::new("c")).await.unwrap().release();

    wait_until(|| driver.closes("b") == 1).await;
    assert!(!a.is_closed());
    assert_eq!(driver.closes("a"), 0);
    assert_eq!(cache.idle_len(), 1);
}

#[tokio::test]
async fn test_zero_idle_capacity_closes_on_release() {
    setup();
    let (cache, driver) = mock_cache(0);
    let config = MockConfig::new("a");

    let lease = cache.acquire(config.clone()).await.unwrap();
    let connection = Arc::clone(lease.connection());
    drop(lease);

    wait_until(|| cache.is_empty()).await;
    assert!(connection.is_closed());
    assert_eq!(driver.closes("a"), 1);
}

#[tokio::test]
async fn test_evict_where_closes_leased_connection() {
    setup();
    let (cache, driver) = mock_cache(10);
    let config = MockConfig::new("a");

    let old = cache.acquire(config.clone()).await.unwrap();
    cache.evict_where(|config| config.name == "a");
    assert_eq!(cache.status(&config), Some(EntryStatus::Closing));

    wait_until(|| old.is_closed()).await;
    assert_eq!(driver.closes("a"), 1);

    // The next acquire gets a fresh connection, while the old lease stays valid.
    let new = cache.acquire(config.clone()).await.unwrap();
    assert_ne!(old.id, new.id);
    assert!(!new.is_closed());
    assert_eq!(driver.opens("a"), 2);

    drop(old);
    drop(new);
    assert_eq!(cache.status(&config), Some(EntryStatus::Open));
    assert_eq!(cache.idle_len(), 1);
}

#[tokio::test]
async fn test_evict_where_only_matching() {
    setup();
    let (cache, driver) = mock_cache(10);

    cache.acquire(MockConfig::new("a")).await.unwrap().release();
    cache.acquire(MockConfig::new("b")).await.unwrap().release();

    cache.evict_where(|config| config.name == "b");

    wait_until(|| cache.len() == 1).await;
    assert_eq!(driver.closes("a"), 0);
    assert_eq!(driver.closes("b"), 1);
    assert_eq!(cache.idle_len(), 1);
}

#[tokio::test]
async fn test_evict_single_config() {
    setup();
    let (cache, driver) = mock_cache(10);
    let config = MockConfig::new("a");

    cache.acquire(config.clone()).await.unwrap().release();
    cache.evict(&config);
    // Evicting again while closing does nothing.
    cache.evict(&config);

    wait_until(|| cache.is_empty()).await;
    assert_eq!(driver.closes("a"), 1);
}

#[tokio::test]
async fn test_failed_close_still_evicts() {
    setup();
    let (cache, driver) = mock_cache(10);
    let config = MockConfig::new("a").fail_close();

    cache.acquire(config.clone()).await.unwrap().release();
    cache.evict(&config);

    wait_until(|| cache.is_empty()).await;
    assert_eq!(driver.closes("a"), 1);

    let lease = cache.acquire(config).await.unwrap();
    assert!(!lease.is_closed());
}

#[tokio::test]
async fn test_release_on_foreign_thread() {
    setup();
    let (cache, driver) = mock_cache(0);

    let lease = cache.acquire(MockConfig::new("a")).await.unwrap();
    let connection = Arc::clone(lease.connection());
    std::thread::spawn(move || drop(lease)).join().unwrap();

    // The close still runs on the cache's runtime.
    wait_until(|| cache.is_empty()).await;
    assert!(connection.is_closed());
    assert_eq!(driver.closes("a"), 1);

    let lease = cache.acquire(MockConfig::new("b")).await.unwrap();
    assert!(!lease.is_closed());
}

#[tokio::test]
async fn test_evict_where_predicate_may_panic() {
    setup();
    let (cache, driver) = mock_cache(10);

    cache.acquire(MockConfig::new("a")).await.unwrap().release();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        cache.evict_where(|_| panic!("bad predicate"));
    }));
    assert!(result.is_err());
    assert_eq!(cache.status(&MockConfig::new("a")), Some(EntryStatus::Open));

    // The predicate may also look at the cache itself.
    cache.evict_where(|config| config.name == "a" && cache.len() == 1);
    wait_until(|| cache.is_empty()).await;
    assert_eq!(driver.closes("a"), 1);
}

#[tokio::test]
async fn test_reopen_closes_stale_connection_first() {
    setup();
    let (cache, driver) = mock_cache(10);
    let config = MockConfig::new("a");

    let old = cache.acquire(config.clone()).await.unwrap();
    cache.evict(&config);
    // The acquire gets to the entry before the eviction closed it.
    cache.acquire(config.clone()).await.ok();

    assert!(old.is_closed());
    assert_eq!(driver.opens("a"), 2);

    // The eviction still closes the connection that replaced the old one.
    wait_until(|| driver.total_closes() == 2).await;
    drop(old);
    wait_until(|| cache.is_empty()).await;
    assert_eq!(driver.closes("a"), 2);
}

#[tokio::test]
async fn test_acquire_racing_eviction_fails() {
    setup();
    let (cache, driver) = mock_cache(10);
    let config = MockConfig::new("a");

    cache.acquire(config.clone()).await.unwrap().release();
    cache.evict_where(|_| true);

    // The acquire reopens the entry, but its second attempt joins the pending close.
    let err = cache.acquire(config.clone()).await.unwrap_err();
    insta::assert_snapshot!(err, @"connection closed");
    assert_eq!(driver.opens("a"), 2);

    wait_until(|| cache.is_empty()).await;
    let lease = cache.acquire(config).await.unwrap();
    assert!(!lease.is_closed());
    assert_eq!(driver.opens("a"), 3);
}
