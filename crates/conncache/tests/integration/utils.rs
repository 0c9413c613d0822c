use std::time::{Duration, Instant};

use conncache::ConnectionCache;
use conncache_test::{MockDriver, cache_config};

pub use conncache_test::{MockConfig, setup};

/// Creates a cache backed by a fresh [`MockDriver`], and returns both.
pub fn mock_cache(idle_capacity: usize) -> (ConnectionCache<MockDriver>, MockDriver) {
    let driver = MockDriver::new();
    let cache = ConnectionCache::new(cache_config(idle_capacity), driver.clone());
    (cache, driver)
}

/// Polls `condition` until it holds, failing the test after a few seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
