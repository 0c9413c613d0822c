use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::error::CacheError;

/// The lifecycle state of a cached connection.
///
/// Entries only move forward through these states, `Closed` being terminal. A closed entry that
/// is still referenced can be reopened, which starts over at `Opening`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EntryStatus {
    /// Freshly created, no open was attempted yet.
    #[default]
    Unspecified,
    Opening,
    /// Opening finished, the entry holds either a connection or the error that occurred.
    Open,
    Closing,
    Closed,
}

impl EntryStatus {
    /// Whether an open or close is currently running for this entry.
    pub fn is_working(self) -> bool {
        matches!(self, Self::Opening | Self::Closing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bookkeeping for the connection of one cache key.
pub(crate) struct Entry<Cfg, C> {
    /// Unique per entry, so that work started for a removed entry does not touch its successor.
    pub id: u64,
    pub config: Cfg,
    /// Number of leases and in-flight operations holding on to this entry.
    pub refs: usize,
    pub status: EntryStatus,
    /// Time of the last status change.
    pub since: Instant,
    pub handle: Option<Arc<C>>,
    pub error: Option<CacheError>,
}

impl<Cfg, C> Entry<Cfg, C> {
    pub fn new(id: u64, config: Cfg) -> Self {
        Self {
            id,
            config,
            refs: 0,
            status: EntryStatus::Unspecified,
            since: Instant::now(),
            handle: None,
            error: None,
        }
    }

    pub fn set_status(&mut self, status: EntryStatus) {
        self.status = status;
        self.since = Instant::now();
    }

    /// The result of opening this entry, as handed out to callers.
    pub fn result(&self) -> Result<Arc<C>, CacheError> {
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        self.handle.clone().ok_or(CacheError::ConnectionClosed)
    }
}

impl<Cfg, C> fmt::Debug for Entry<Cfg, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("id", &self.id)
            .field("refs", &self.refs)
            .field("status", &self.status)
            .field("since", &self.since)
            .field("has_handle", &self.handle.is_some())
            .field("error", &self.error)
            .finish()
    }
}
