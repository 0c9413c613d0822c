//! A generic cache of long-lived connections.
//!
//! The [`ConnectionCache`] hands out shared connections keyed by their configuration. How
//! connections are opened and keyed is up to a [`ConnectionDriver`]. The cache makes sure that
//! each key is opened at most once at a time, keeps a bounded number of unused connections open,
//! and closes everything on shutdown.

#[macro_use]
pub mod metrics;

mod cache;
pub mod config;
mod driver;
mod entry;
mod error;
pub mod idle;
pub mod logging;
pub mod singleflight;
mod utils;
mod watchdog;

pub use cache::{ConnectionCache, Lease};
pub use config::CacheConfig;
pub use driver::{Connection, ConnectionDriver};
pub use entry::EntryStatus;
pub use error::CacheError;
pub use singleflight::Group;
