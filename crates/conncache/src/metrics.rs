//! Statsd reporting for the cache, emitted through the [`metric!`](crate::metric) macro.
//!
//! Until [`configure_statsd`] is called, metrics are dropped without being formatted.
use std::collections::BTreeMap;
use std::io;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;

use cadence::{Metric, MetricBuilder, StatsdClient, UdpMetricSink};

#[doc(hidden)]
pub use cadence::prelude;

static REPORTER: OnceLock<Reporter> = OnceLock::new();

/// A statsd client, and the tags attached to everything it sends.
#[derive(Debug)]
pub struct Reporter {
    pub client: StatsdClient,
    tags: BTreeMap<String, String>,
}

impl Reporter {
    #[inline]
    pub fn send<'a, T>(&'a self, mut metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        for (tag, value) in &self.tags {
            metric = metric.with_tag(tag, value);
        }
        metric.send()
    }
}

/// Reports all metrics of this process to the statsd server at `host`.
///
/// Only the first call has an effect.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    tags: BTreeMap<String, String>,
) -> io::Result<()> {
    let addrs: Vec<_> = host.to_socket_addrs()?.collect();
    if let Some(addr) = addrs.first() {
        tracing::info!("Reporting metrics to statsd at {}", addr);
    }
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket).map_err(io::Error::other)?;

    let reporter = Reporter {
        client: StatsdClient::from_sink(prefix, sink),
        tags,
    };
    if REPORTER.set(reporter).is_err() {
        tracing::warn!("statsd metrics were already configured");
    }
    Ok(())
}

#[doc(hidden)]
#[inline]
pub fn with_reporter(f: impl FnOnce(&Reporter)) {
    if let Some(reporter) = REPORTER.get() {
        f(reporter);
    }
}

/// Emits a counter, gauge or timer.
///
/// ```ignore
/// metric!(counter("conncache.evict") += 1, "reason" => "lru");
/// metric!(gauge("conncache.entries") = 12);
/// metric!(timer("conncache.open.duration") = start.elapsed());
/// ```
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send count_with_tags($id, $value) $(, $k => $v)*)
    };
    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send gauge_with_tags($id, $value) $(, $k => $v)*)
    };
    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send time_with_tags($id, $value) $(, $k => $v)*)
    };
    (@send $method:ident($id:expr, $value:expr) $(, $k:expr => $v:expr)*) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_reporter(|reporter| {
            reporter.send(reporter.client.$method($id, $value)$(.with_tag($k, $v))*);
        })
    }};
}
