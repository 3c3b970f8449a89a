//! Sliding window log.
//!
//! Keeps the timestamp of every accepted request inside the trailing window.
//! Entries at or before `now - window` are pruned before counting, which
//! bounds the request rate over any trailing interval of `window` length,
//! not just over aligned buckets.

use std::collections::VecDeque;

use super::Decision;

/// Ordered request log: `(timestamp_ms, member)`, oldest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlidingWindow {
    entries: VecDeque<(u64, String)>,
}

impl SlidingWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(mut entries: Vec<(u64, String)>) -> Self {
        entries.sort_by_key(|(ts, _)| *ts);
        Self {
            entries: entries.into(),
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &(u64, String)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn prune(&mut self, cutoff: u64) {
        while matches!(self.entries.front(), Some((ts, _)) if *ts <= cutoff) {
            self.entries.pop_front();
        }
    }

    fn insert(&mut self, now: u64, member: &str) {
        // Clocks of different instances can disagree slightly; keep the log ordered.
        let idx = self.entries.partition_point(|(ts, _)| *ts <= now);
        self.entries.insert(idx, (now, member.to_string()));
    }

    pub fn check(&mut self, limit: u64, window_ms: u64, now: u64, member: &str) -> Decision {
        let cutoff = now.saturating_sub(window_ms);
        self.prune(cutoff);

        let count = self.entries.len() as u64;
        if limit == 0 || count >= limit {
            let oldest = self.entries.front().map(|(ts, _)| *ts).unwrap_or(now);
            let reset_time = oldest + window_ms;
            return Decision {
                allowed: false,
                total_hits: count as i64,
                remaining: 0,
                reset_time,
                window_start: cutoff,
                window_end: now,
                retry_after: Some(reset_time.saturating_sub(now).max(1)),
            };
        }

        self.insert(now, member);
        let total = count + 1;
        let oldest = self.entries.front().map(|(ts, _)| *ts).unwrap_or(now);

        Decision {
            allowed: true,
            total_hits: total as i64,
            remaining: limit - total,
            reset_time: oldest + window_ms,
            window_start: cutoff,
            window_end: now,
            retry_after: None,
        }
    }
}
