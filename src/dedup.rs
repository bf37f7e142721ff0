//! De-duplication barrier: before insertion, reject entries whose
//! `exact_hash` matches a recent hash, or whose `simhash` is within Hamming
//! distance 3 of a recent entry. Kept as a rolling in-memory window bounded
//! by a wall-clock retention rather than a full table scan per article.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::normalize::hamming_distance;

struct Seen {
    exact_hash: String,
    simhash: u64,
    seen_at: DateTime<Utc>,
}

pub struct DedupWindow {
    retention: Duration,
    simhash_threshold: u32,
    entries: Mutex<VecDeque<Seen>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupVerdict {
    Unique,
    ExactDuplicate,
    SyndicationDuplicate,
}

impl DedupWindow {
    pub fn new(retention_days: i64, simhash_threshold: u32) -> Self {
        Self {
            retention: Duration::days(retention_days),
            simhash_threshold,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Checks `exact_hash`/`simhash` against the rolling window. Does NOT
    /// record the entry — call `record` only after the caller decides to
    /// actually insert it, so a rejected duplicate doesn't pollute the window.
    pub fn check(&self, exact_hash: &str, simhash: u64, now: DateTime<Utc>) -> DedupVerdict {
        let mut entries = self.entries.lock().unwrap();
        self.evict_stale(&mut entries, now);

        for entry in entries.iter() {
            if entry.exact_hash == exact_hash {
                return DedupVerdict::ExactDuplicate;
            }
        }
        for entry in entries.iter() {
            if hamming_distance(entry.simhash, simhash) <= self.simhash_threshold {
                return DedupVerdict::SyndicationDuplicate;
            }
        }
        DedupVerdict::Unique
    }

    pub fn record(&self, exact_hash: String, simhash: u64, now: DateTime<Utc>) {
        let mut entries = self.entries.lock().unwrap();
        self.evict_stale(&mut entries, now);
        entries.push_back(Seen { exact_hash, simhash, seen_at: now });
    }

    fn evict_stale(&self, entries: &mut VecDeque<Seen>, now: DateTime<Utc>) {
        while let Some(front) = entries.front() {
            if now.signed_duration_since(front.seen_at) > self.retention {
                entries.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_duplicate_is_flagged() {
        let window = DedupWindow::new(7, 3);
        let now = Utc::now();
        window.record("abc123".to_string(), 0, now);
        assert_eq!(window.check("abc123", 999, now), DedupVerdict::ExactDuplicate);
    }

    #[test]
    fn near_simhash_is_flagged_as_syndication() {
        let window = DedupWindow::new(7, 3);
        let now = Utc::now();
        window.record("hash-a".to_string(), 0b1010, now);
        assert_eq!(window.check("hash-b", 0b1011, now), DedupVerdict::SyndicationDuplicate);
    }

    #[test]
    fn distant_simhash_is_unique() {
        let window = DedupWindow::new(7, 3);
        let now = Utc::now();
        window.record("hash-a".to_string(), 0x0000_0000_0000_0000, now);
        assert_eq!(window.check("hash-b", 0xFFFF_FFFF_FFFF_FFFF, now), DedupVerdict::Unique);
    }

    #[test]
    fn stale_entries_are_evicted_and_no_longer_match() {
        let window = DedupWindow::new(7, 3);
        let old = Utc::now() - Duration::days(10);
        window.record("abc123".to_string(), 0, old);
        assert_eq!(window.check("abc123", 999, Utc::now()), DedupVerdict::Unique);
    }
}
