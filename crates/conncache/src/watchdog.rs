use std::sync::Weak;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::cache::Inner;
use crate::driver::ConnectionDriver;
use crate::entry::EntryStatus;

/// Periodically reports connections that are stuck opening or closing.
///
/// Runs until the cache is dropped, or until it was closed and has no connections left.
pub(crate) async fn check_hanging_periodically<D: ConnectionDriver>(
    inner: Weak<Inner<D>>,
    period: Duration,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        report_hanging(&inner);
        if inner.is_drained() {
            break;
        }
    }

    tracing::debug!("hanging connection watchdog stopped");
}

/// Invokes [`ConnectionDriver::on_hanging`] for every entry that exceeded its timeout.
pub(crate) fn report_hanging<D: ConnectionDriver>(inner: &Inner<D>) {
    let open_timeout = inner.config.open_timeout;
    let close_timeout = inner.config.close_timeout;

    let (hanging, size) = {
        let state = inner.state.lock().unwrap();
        let hanging: Vec<_> = state
            .entries
            .values()
            .filter_map(|entry| {
                let elapsed = entry.since.elapsed();
                match entry.status {
                    EntryStatus::Opening if elapsed > open_timeout => {
                        Some((entry.config.clone(), true))
                    }
                    EntryStatus::Closing if elapsed > close_timeout => {
                        Some((entry.config.clone(), false))
                    }
                    _ => None,
                }
            })
            .collect();
        (hanging, state.entries.len())
    };

    metric!(gauge("conncache.entries") = size as u64);

    // Called without holding the lock, so the driver may use the cache.
    for (config, opening) in hanging {
        metric!(
            counter("conncache.hanging") += 1,
            "phase" => if opening { "open" } else { "close" },
        );
        inner.driver.on_hanging(&config, opening);
    }
}
