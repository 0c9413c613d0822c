use conncache::{CacheError, EntryStatus};

use crate::{MockConfig, mock_cache, setup, wait_until};

#[tokio::test]
async fn test_open_failure_is_cached() {
    setup();
    let (cache, driver) = mock_cache(10);
    let failing = MockConfig::new("a").fail_open();

    let err = cache.acquire(failing.clone()).await.unwrap_err();
    insta::assert_snapshot!(err, @"failed to open a");
    assert_eq!(err.kind(), "connection");

    // No retry until the entry is evicted.
    let err = cache.acquire(failing.clone()).await.unwrap_err();
    assert!(matches!(err, CacheError::Connection(_)));
    assert_eq!(driver.opens("a"), 1);
    assert_eq!(cache.status(&failing), Some(EntryStatus::Open));

    cache.evict_where(|_| true);
    wait_until(|| cache.is_empty()).await;

    let lease = cache.acquire(MockConfig::new("a")).await.unwrap();
    assert!(!lease.is_closed());
    assert_eq!(driver.opens("a"), 2);
    // Nothing was opened for the failed attempt, so nothing was closed.
    assert_eq!(driver.closes("a"), 0);
}

#[tokio::test]
async fn test_open_panic_reaches_caller() {
    setup();
    let (cache, _driver) = mock_cache(10);
    let config = MockConfig::new("a").panic_open();

    let acquiring = {
        let cache = cache.clone();
        let config = config.clone();
        tokio::spawn(async move { cache.acquire(config).await })
    };
    let panic = acquiring.await.unwrap_err().into_panic();
    assert_eq!(panic.downcast_ref::<String>().unwrap(), "opening a panicked");

    // The entry does not get stuck opening.
    let err = cache.acquire(config).await.unwrap_err();
    insta::assert_snapshot!(err, @"internal error");
}

#[tokio::test]
async fn test_close_panic_marks_entry_closed() {
    setup();
    let (cache, driver) = mock_cache(10);
    let config = MockConfig::new("a").panic_close();

    let lease = cache.acquire(config.clone()).await.unwrap();
    cache.evict(&config);

    wait_until(|| driver.closes("a") == 1).await;
    assert_eq!(cache.status(&config), Some(EntryStatus::Closed));

    drop(lease);
    wait_until(|| cache.is_empty()).await;

    cache.acquire(MockConfig::new("b")).await.unwrap().release();
    cache.close().await.unwrap();
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_close_panic_during_shutdown() {
    setup();
    let (cache, driver) = mock_cache(10);

    cache
        .acquire(MockConfig::new("a").panic_close())
        .await
        .unwrap()
        .release();
    cache.close().await.unwrap();

    assert!(cache.is_empty());
    assert_eq!(driver.closes("a"), 1);
}
