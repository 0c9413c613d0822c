use std::sync::Arc;
use std::time::Duration;

use conncache::{CacheConfig, CacheError, ConnectionCache, EntryStatus};
use conncache_test::MockDriver;
use futures::future::join_all;
use tokio::time::{Instant, timeout};

use crate::{MockConfig, mock_cache, setup};

#[tokio::test]
async fn test_concurrent_acquires_open_once() {
    setup();
    let (cache, driver) = mock_cache(10);
    let config = MockConfig::new("a").open_delay(Duration::from_millis(50));

    let leases = join_all((0..10).map(|_| cache.acquire(config.clone()))).await;

    let ids: Vec<_> = leases
        .iter()
        .map(|lease| lease.as_ref().unwrap().id)
        .collect();
    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(driver.opens("a"), 1);
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn test_released_connection_is_reused() {
    setup();
    let (cache, driver) = mock_cache(10);
    let config = MockConfig::new("a");

    let first = cache.acquire(config.clone()).await.unwrap();
    let connection = Arc::clone(first.connection());
    assert_eq!(first.key(), "a");
    first.release();
    assert_eq!(cache.idle_len(), 1);

    let second = cache.acquire(config.clone()).await.unwrap();
    assert!(Arc::ptr_eq(&connection, second.connection()));
    assert_eq!(cache.idle_len(), 0);
    assert_eq!(cache.status(&config), Some(EntryStatus::Open));
    assert_eq!(driver.opens("a"), 1);
}

#[tokio::test]
async fn test_different_keys_open_in_parallel() {
    setup();
    let (cache, driver) = mock_cache(10);
    let a = MockConfig::new("a").open_delay(Duration::from_millis(100));
    let b = MockConfig::new("b").open_delay(Duration::from_millis(100));

    let start = Instant::now();
    let (a, b) = tokio::join!(cache.acquire(a), cache.acquire(b));

    assert!(start.elapsed() < Duration::from_millis(190));
    assert_ne!(a.unwrap().id, b.unwrap().id);
    assert_eq!(driver.total_opens(), 2);
}

#[tokio::test]
async fn test_abandoned_acquire_keeps_opening() {
    setup();
    let (cache, driver) = mock_cache(10);
    let config = MockConfig::new("a").open_delay(Duration::from_millis(100));

    let abandoned = timeout(Duration::from_millis(20), cache.acquire(config.clone())).await;
    assert!(abandoned.is_err());
    assert_eq!(cache.status(&config), Some(EntryStatus::Opening));

    let lease = cache.acquire(config).await.unwrap();
    assert!(!lease.is_closed());
    assert_eq!(driver.opens("a"), 1);
}

#[tokio::test]
async fn test_open_timeout() {
    setup();
    let driver = MockDriver::new();
    let cache_config = CacheConfig {
        open_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let cache = ConnectionCache::new(cache_config, driver.clone());
    let config = MockConfig::new("a").open_delay(Duration::from_secs(10));

    let start = Instant::now();
    let err = cache.acquire(config.clone()).await.unwrap_err();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(matches!(err, CacheError::Timeout(t) if t == Duration::from_millis(50)));
    insta::assert_snapshot!(err, @"opening connection timed out after 50ms");

    // The timeout sticks to the entry.
    let err = cache.acquire(config).await.unwrap_err();
    assert!(matches!(err, CacheError::Timeout(_)));
    assert_eq!(driver.opens("a"), 1);
}

#[tokio::test]
async fn test_late_open_is_closed() {
    setup();
    let driver = MockDriver::new();
    let cache_config = CacheConfig {
        open_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let cache = ConnectionCache::new(cache_config, driver.clone());
    let config = MockConfig::new("a")
        .open_delay(Duration::from_millis(200))
        .ignore_cancellation();

    let err = cache.acquire(config).await.unwrap_err();

    assert!(matches!(err, CacheError::Timeout(_)));
    assert_eq!(driver.opens("a"), 1);
    assert_eq!(driver.closes("a"), 1);
}
