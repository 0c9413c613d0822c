use std::time::Duration;

use conncache::CacheError;
use tokio::time::Instant;

use crate::{MockConfig, mock_cache, setup};

#[tokio::test]
async fn test_close_drains_all_connections() {
    setup();
    let (cache, driver) = mock_cache(10);

    cache.acquire(MockConfig::new("a")).await.unwrap().release();
    cache.acquire(MockConfig::new("b")).await.unwrap().release();
    let leased = cache.acquire(MockConfig::new("c")).await.unwrap();

    let closing = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.close().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Leased connections are closed right away, but the cache waits for the lease.
    assert!(leased.is_closed());
    assert!(!closing.is_finished());

    drop(leased);
    closing.await.unwrap().unwrap();

    assert!(cache.is_empty());
    assert!(cache.is_closed());
    for name in ["a", "b", "c"] {
        assert_eq!(driver.closes(name), 1);
    }
}

#[tokio::test]
async fn test_acquire_after_close_fails() {
    setup();
    let (cache, driver) = mock_cache(10);

    cache.close().await.unwrap();

    let err = cache.acquire(MockConfig::new("a")).await.unwrap_err();
    insta::assert_snapshot!(err, @"connection cache closed");
    assert_eq!(driver.total_opens(), 0);

    assert!(matches!(cache.close().await, Err(CacheError::Closed)));
}

#[tokio::test]
async fn test_close_cancels_pending_open() {
    setup();
    let (cache, driver) = mock_cache(10);
    let config = MockConfig::new("a").open_delay(Duration::from_secs(10));

    let acquiring = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.acquire(config).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let start = Instant::now();
    cache.close().await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));

    let err = acquiring.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        CacheError::Cancelled | CacheError::Closed | CacheError::ConnectionClosed
    ));
    assert_eq!(driver.opens("a"), 1);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_close_waits_for_slow_close() {
    setup();
    let (cache, driver) = mock_cache(10);
    let config = MockConfig::new("a").close_delay(Duration::from_millis(100));

    cache.acquire(config).await.unwrap().release();

    let start = Instant::now();
    cache.close().await.unwrap();

    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(driver.closes("a"), 1);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_reopen_after_close_fails_without_opening() {
    setup();
    let (cache, driver) = mock_cache(10);
    let config = MockConfig::new("a").close_delay(Duration::from_millis(100));

    cache.acquire(config.clone()).await.unwrap().release();
    cache.evict(&config);
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Joins the pending close, and only then tries to open again.
    let acquiring = {
        let cache = cache.clone();
        let config = config.clone();
        tokio::spawn(async move { cache.acquire(config).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    cache.close().await.unwrap();

    let err = acquiring.await.unwrap().unwrap_err();
    insta::assert_snapshot!(err, @"connection cache closed");
    assert_eq!(driver.opens("a"), 1);
    assert_eq!(driver.closes("a"), 1);
    assert!(cache.is_empty());
}
