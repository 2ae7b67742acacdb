//! Recent-spam coalescer
//!
//! Short-lived registry of spam incidents. While a record for (kind,
//! identifier) is active, further matches for it merge into the same incident
//! instead of starting a new action cycle.

use crate::automod::clock::{SharedClock, after};
use crate::automod::recent_actions::RecentActionKind;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// An in-progress spam incident
#[derive(Debug, Clone)]
pub struct RecentSpamRecord {
    pub kind: RecentActionKind,
    pub identifiers: HashSet<String>,
    pub timestamp: DateTime<Utc>,
    pub archive_id: Option<String>,
}

impl RecentSpamRecord {
    fn covers(&self, kind: RecentActionKind, identifier: Option<&str>) -> bool {
        self.kind == kind && identifier.is_none_or(|id| self.identifiers.contains(id))
    }
}

/// Registry of in-progress spam incidents
pub struct RecentSpamCoalescer {
    records: Mutex<Vec<RecentSpamRecord>>,
    ttl: Duration,
    clock: SharedClock,
}

impl RecentSpamCoalescer {
    #[must_use]
    pub fn new(clock: SharedClock, ttl: Duration) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            ttl,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RecentSpamRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_live(&self, record: &RecentSpamRecord, now: DateTime<Utc>) -> bool {
        after(record.timestamp, self.ttl) > now
    }

    /// Find the active incident for (kind, identifier)
    ///
    /// A `None` identifier matches any incident of that kind.
    #[must_use]
    pub fn find(&self, kind: RecentActionKind, identifier: Option<&str>) -> Option<RecentSpamRecord> {
        let now = self.clock.now();
        self.lock()
            .iter()
            .find(|record| self.is_live(record, now) && record.covers(kind, identifier))
            .cloned()
    }

    /// Start a new incident
    pub fn add<I, S>(&self, kind: RecentActionKind, identifiers: I, archive_id: Option<String>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let record = RecentSpamRecord {
            kind,
            identifiers: identifiers.into_iter().map(Into::into).collect(),
            timestamp: self.clock.now(),
            archive_id,
        };
        self.lock().push(record);
    }

    /// Merge `new_identifier` into the active incident covering
    /// (kind, existing); returns false if no incident is active
    pub fn merge(
        &self,
        kind: RecentActionKind,
        existing: Option<&str>,
        new_identifier: impl Into<String>,
    ) -> bool {
        let now = self.clock.now();
        let mut records = self.lock();
        let live = records
            .iter_mut()
            .find(|record| self.is_live(record, now) && record.covers(kind, existing));

        match live {
            Some(record) => {
                record.identifiers.insert(new_identifier.into());
                true
            }
            None => false,
        }
    }

    /// Drop expired incidents
    pub fn prune(&self) -> usize {
        let now = self.clock.now();
        let mut records = self.lock();
        let before = records.len();
        records.retain(|record| after(record.timestamp, self.ttl) > now);
        before - records.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
