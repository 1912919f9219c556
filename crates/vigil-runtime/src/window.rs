//! Retention windows
//!
//! A window decides which past events are still live. Every insertion
//! returns the entries it evicted, so callers can pair each `add` into an
//! aggregation with exactly one later `remove`:
//!
//! | Policy          | Eviction                                            |
//! |-----------------|-----------------------------------------------------|
//! | `Length(n)`     | oldest entries beyond the last `n`                  |
//! | `Time(d)`       | entries older than `d` relative to the newest event |
//! | `KeepAll`       | never                                               |
//!
//! Time windows use event timestamps. `expire` advances time without an
//! event (a watermark).

use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use vigil_core::{SharedEvent, WindowSpec};

/// Anything retained by a window must expose the time it entered.
pub trait Timestamped {
    fn timestamp(&self) -> DateTime<Utc>;
}

impl Timestamped for SharedEvent {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[derive(Debug, Clone, Copy)]
enum Retention {
    Length(usize),
    Time(Duration),
    KeepAll,
}

/// Ordered retention of entries under a window policy
#[derive(Debug)]
pub struct RetentionWindow<T> {
    retention: Retention,
    entries: VecDeque<T>,
}

impl<T: Timestamped> RetentionWindow<T> {
    pub fn new(spec: WindowSpec) -> Self {
        let retention = match spec {
            WindowSpec::Length(n) => Retention::Length(n),
            WindowSpec::Time(d) => Retention::Time(Duration::from_std(d).unwrap_or(Duration::MAX)),
            WindowSpec::KeepAll => Retention::KeepAll,
        };
        Self {
            retention,
            entries: VecDeque::new(),
        }
    }

    /// Add an entry, returning the entries it pushed out, oldest first.
    pub fn insert(&mut self, entry: T) -> Vec<T> {
        let now = entry.timestamp();
        self.entries.push_back(entry);
        match self.retention {
            Retention::Length(n) => {
                let excess = self.entries.len().saturating_sub(n);
                self.entries.drain(0..excess).collect()
            }
            Retention::Time(_) => self.expire(now),
            Retention::KeepAll => Vec::new(),
        }
    }

    /// Evict time-expired entries as of `now`. Count windows never expire.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<T> {
        let Retention::Time(size) = self.retention else {
            return Vec::new();
        };
        // A window wider than the representable time range keeps everything.
        let Some(cutoff) = now.checked_sub_signed(size) else {
            return Vec::new();
        };
        let expired_count = self
            .entries
            .iter()
            .position(|e| e.timestamp() > cutoff)
            .unwrap_or(self.entries.len());
        self.entries.drain(0..expired_count).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn is_time_based(&self) -> bool {
        matches!(self.retention, Retention::Time(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;
    use vigil_core::Event;

    fn event_at(id: &str, secs: i64) -> SharedEvent {
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        Arc::new(
            Event::new("SupportBean")
                .with_timestamp(base + Duration::seconds(secs))
                .with_field("theString", id),
        )
    }

    fn ids(events: &[SharedEvent]) -> Vec<&str> {
        events.iter().filter_map(|e| e.get_str("theString")).collect()
    }

    #[test]
    fn test_length_window_evicts_oldest() {
        let mut w = RetentionWindow::new(WindowSpec::Length(2));
        assert!(w.insert(event_at("e1", 0)).is_empty());
        assert!(w.insert(event_at("e2", 1)).is_empty());
        let evicted = w.insert(event_at("e3", 2));
        assert_eq!(ids(&evicted), vec!["e1"]);
        let retained: Vec<_> = w.iter().cloned().collect();
        assert_eq!(ids(&retained), vec!["e2", "e3"]);
    }

    #[test]
    fn test_last_event_window() {
        let mut w = RetentionWindow::new(WindowSpec::last_event());
        w.insert(event_at("G1", 0));
        let evicted = w.insert(event_at("G2", 1));
        assert_eq!(ids(&evicted), vec!["G1"]);
        assert_eq!(w.len(), 1);
    }

    #[test]
    fn test_evicted_entry_is_the_same_allocation() {
        let mut w = RetentionWindow::new(WindowSpec::Length(1));
        let first = event_at("e1", 0);
        w.insert(first.clone());
        let evicted = w.insert(event_at("e1", 1));
        assert!(Arc::ptr_eq(&evicted[0], &first));
    }

    #[test]
    fn test_time_window_expires_on_insert() {
        let mut w = RetentionWindow::new(WindowSpec::Time(std::time::Duration::from_secs(10)));
        w.insert(event_at("a", 0));
        w.insert(event_at("b", 5));
        assert!(w.insert(event_at("c", 10)).len() == 1);
        assert_eq!(w.len(), 2);
    }

    #[test]
    fn test_time_window_expire_by_watermark() {
        let mut w = RetentionWindow::new(WindowSpec::Time(std::time::Duration::from_secs(10)));
        w.insert(event_at("a", 0));
        w.insert(event_at("b", 5));
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let expired = w.expire(base + Duration::seconds(30));
        assert_eq!(ids(&expired), vec!["a", "b"]);
        assert!(w.is_empty());
    }

    #[test]
    fn test_huge_time_window_never_expires() {
        let mut w =
            RetentionWindow::new(WindowSpec::Time(std::time::Duration::from_secs(u64::MAX)));
        assert!(w.insert(event_at("a", 0)).is_empty());
        assert!(w.insert(event_at("b", 5)).is_empty());
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert!(w.expire(base + Duration::days(3650)).is_empty());
        assert_eq!(w.len(), 2);
    }

    #[test]
    fn test_keep_all_never_evicts() {
        let mut w = RetentionWindow::new(WindowSpec::KeepAll);
        for i in 0..100 {
            assert!(w.insert(event_at("x", i)).is_empty());
        }
        assert_eq!(w.len(), 100);
        assert!(w.expire(Utc::now()).is_empty());
    }
}
