// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;

use tokio::time::Instant;

/// Offset state of one owned partition.
///
/// Every handed-out offset stays outstanding until it is acknowledged. The
/// committable offset is the lowest outstanding offset or, with nothing
/// outstanding, one past the highest offset ever handed out; it never moves
/// backwards because redeliveries only touch offsets that are already
/// outstanding.
#[derive(Debug, Clone)]
pub struct OffsetEntry {
    committed_offset: Option<i64>,
    next_offset: i64,
    last_delivered_offset: Option<i64>,
    /// deadline per outstanding offset; `None` once the deadline passed and
    /// the offset waits for redelivery
    outstanding: BTreeMap<i64, Option<Instant>>,
}

impl OffsetEntry {
    pub fn new(start_offset: i64, committed_offset: Option<i64>) -> Self {
        Self {
            committed_offset,
            next_offset: start_offset,
            last_delivered_offset: None,
            outstanding: BTreeMap::new(),
        }
    }

    pub fn committed_offset(&self) -> Option<i64> {
        self.committed_offset
    }

    pub fn last_delivered_offset(&self) -> Option<i64> {
        self.last_delivered_offset
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn committable_offset(&self) -> i64 {
        self.outstanding
            .keys()
            .next()
            .copied()
            .unwrap_or(self.next_offset)
    }

    pub fn record_delivery(&mut self, offset: i64, deadline: Instant) {
        self.outstanding.insert(offset, Some(deadline));
        self.last_delivered_offset = Some(offset);
        self.next_offset = self.next_offset.max(offset + 1);
    }

    /// Returns false when `offset` is not outstanding.
    pub fn record_ack(&mut self, offset: i64) -> bool {
        self.outstanding.remove(&offset).is_some()
    }

    /// Offsets whose deadline passed by `now`, in offset order. Each is
    /// reported once.
    pub fn expire(&mut self, now: Instant) -> Vec<i64> {
        let mut expired = Vec::new();
        for (offset, deadline) in self.outstanding.iter_mut() {
            if deadline.is_some_and(|deadline| deadline <= now) {
                *deadline = None;
                expired.push(*offset);
            }
        }
        expired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.outstanding.values().flatten().min().copied()
    }

    /// The offset to commit, if it moved past the last successful commit.
    pub fn pending_commit(&self) -> Option<i64> {
        let committable = self.committable_offset();
        match self.committed_offset {
            Some(committed) if committable <= committed => None,
            _ => Some(committable),
        }
    }

    pub fn mark_committed(&mut self, offset: i64) {
        self.committed_offset = Some(self.committed_offset.map_or(offset, |c| c.max(offset)));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand::Rng;

    use super::*;

    #[test]
    fn test_committable_covers_acknowledged_prefix_only() {
        let now = Instant::now();
        let mut entry = OffsetEntry::new(10, Some(10));
        assert_eq!(entry.pending_commit(), None);

        for offset in 10..13 {
            entry.record_delivery(offset, now);
        }
        assert!(entry.record_ack(11));
        assert_eq!(entry.committable_offset(), 10);
        assert_eq!(entry.pending_commit(), None);

        assert!(entry.record_ack(10));
        assert_eq!(entry.committable_offset(), 12);
        assert!(entry.record_ack(12));
        assert_eq!(entry.pending_commit(), Some(13));
        assert!(!entry.record_ack(12));

        entry.mark_committed(13);
        entry.mark_committed(11);
        assert_eq!(entry.committed_offset(), Some(13));
        assert_eq!(entry.pending_commit(), None);
    }

    #[test]
    fn test_fresh_group_commits_its_start() {
        let entry = OffsetEntry::new(7, None);
        assert_eq!(entry.pending_commit(), Some(7));
    }

    #[test]
    fn test_expiry_then_late_ack() {
        let start = Instant::now();
        let timeout = Duration::from_secs(15);
        let mut entry = OffsetEntry::new(0, None);
        entry.record_delivery(0, start + timeout);
        entry.record_delivery(1, start + timeout + Duration::from_secs(1));

        assert_eq!(entry.next_deadline(), Some(start + timeout));
        assert!(entry.expire(start + timeout - Duration::from_millis(1)).is_empty());
        assert_eq!(entry.expire(start + timeout), vec![0]);
        assert!(entry.expire(start + timeout).is_empty());
        assert_eq!(
            entry.next_deadline(),
            Some(start + timeout + Duration::from_secs(1))
        );

        // expired but not yet handed out again
        assert!(entry.record_ack(0));
        assert_eq!(entry.committable_offset(), 1);
    }

    #[test]
    fn test_random_histories_never_commit_unacked() {
        let mut rng = rand::thread_rng();
        let now = Instant::now();
        for _ in 0..200 {
            let mut entry = OffsetEntry::new(0, None);
            let mut delivered = 0;
            let mut unacked: Vec<i64> = Vec::new();
            let mut last_committable = 0;
            for _ in 0..50 {
                match rng.gen_range(0..3) {
                    0 => {
                        entry.record_delivery(delivered, now);
                        unacked.push(delivered);
                        delivered += 1;
                    }
                    1 if !unacked.is_empty() => {
                        let offset = unacked.swap_remove(rng.gen_range(0..unacked.len()));
                        assert!(entry.record_ack(offset));
                    }
                    _ => {
                        entry.expire(now);
                    }
                }
                let committable = entry.committable_offset();
                assert!(committable >= last_committable);
                if let Some(lowest) = unacked.iter().min() {
                    assert!(committable <= *lowest);
                } else {
                    assert_eq!(committable, delivered);
                }
                last_committable = committable;
            }
        }
    }
}
