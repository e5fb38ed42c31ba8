//! Per-partition acknowledgment tracking.
//!
//! Workers acknowledge messages in any order, but a Kafka commit covers
//! everything below the committed offset. The tracker only advances a
//! partition's commit position up to its lowest unsettled offset, so a
//! commit never skips a message that is still in flight or in retry.
//!
//! A message settles when it is acknowledged or when the pool releases it
//! after exhausting its retries. A released message is skipped like an
//! acknowledged one; it is not redelivered.

use dashmap::DashMap;
use std::collections::BTreeSet;

#[derive(Debug, Default)]
struct PartitionOffsets {
    in_flight: BTreeSet<i64>,
    highest_acked: Option<i64>,
    stored: Option<i64>,
}

impl PartitionOffsets {
    /// Next offset to consume that is safe to commit.
    fn committable(&self) -> Option<i64> {
        match self.in_flight.first() {
            Some(lowest) => Some(*lowest),
            None => self.highest_acked.map(|o| o + 1),
        }
    }
}

/// Tracks in-flight and acknowledged offsets for every partition.
#[derive(Default)]
pub struct OffsetTracker {
    partitions: DashMap<(String, i32), PartitionOffsets>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message handed to the pool.
    pub fn track(&self, topic: &str, partition: i32, offset: i64) {
        self.partitions
            .entry((topic.to_string(), partition))
            .or_default()
            .in_flight
            .insert(offset);
    }

    /// Record an acknowledgment. Returns the new commit position when it
    /// moved forward.
    pub fn ack(&self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        self.settle(topic, partition, offset)
    }

    /// Record a message the pool dropped. The commit position may move past
    /// it; returns the new position when it moved forward.
    pub fn release(&self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        self.settle(topic, partition, offset)
    }

    /// Stop tracking a message that never reached the pool.
    ///
    /// Unlike [`release`](Self::release), the commit position is not moved
    /// past the offset, so the message is read again after a restart.
    pub fn untrack(&self, topic: &str, partition: i32, offset: i64) {
        if let Some(mut entry) = self.partitions.get_mut(&(topic.to_string(), partition)) {
            entry.in_flight.remove(&offset);
        }
    }

    /// Settlements for partitions that are not tracked, e.g. revoked ones,
    /// are ignored.
    fn settle(&self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let mut entry = self.partitions.get_mut(&(topic.to_string(), partition))?;

        if !entry.in_flight.remove(&offset) {
            return None;
        }
        if entry.highest_acked.map_or(true, |h| offset > h) {
            entry.highest_acked = Some(offset);
        }

        let next = entry.committable()?;
        if entry.stored.map_or(true, |s| next > s) {
            entry.stored = Some(next);
            Some(next)
        } else {
            None
        }
    }

    /// Current commit position of a partition.
    pub fn committable(&self, topic: &str, partition: i32) -> Option<i64> {
        self.partitions
            .get(&(topic.to_string(), partition))
            .and_then(|p| p.stored)
    }

    /// Messages handed to the pool and not yet acknowledged.
    pub fn in_flight(&self, topic: &str, partition: i32) -> usize {
        self.partitions
            .get(&(topic.to_string(), partition))
            .map(|p| p.in_flight.len())
            .unwrap_or(0)
    }

    /// Unacknowledged messages across all partitions.
    pub fn total_in_flight(&self) -> usize {
        self.partitions.iter().map(|p| p.in_flight.len()).sum()
    }

    pub fn partitions(&self) -> Vec<(String, i32)> {
        let mut keys: Vec<_> = self.partitions.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Forget a revoked partition.
    pub fn forget_partition(&self, topic: &str, partition: i32) {
        self.partitions.remove(&(topic.to_string(), partition));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_acks_advance() {
        let tracker = OffsetTracker::new();
        for offset in 10..13 {
            tracker.track("t", 0, offset);
        }

        assert_eq!(tracker.ack("t", 0, 10), Some(11));
        assert_eq!(tracker.ack("t", 0, 11), Some(12));
        assert_eq!(tracker.ack("t", 0, 12), Some(13));
        assert_eq!(tracker.committable("t", 0), Some(13));
        assert_eq!(tracker.in_flight("t", 0), 0);
    }

    #[test]
    fn test_out_of_order_ack_waits_for_gap() {
        let tracker = OffsetTracker::new();
        for offset in 0..4 {
            tracker.track("t", 0, offset);
        }

        assert_eq!(tracker.ack("t", 0, 2), Some(0));
        assert_eq!(tracker.ack("t", 0, 3), None);
        assert_eq!(tracker.ack("t", 0, 1), None);
        assert_eq!(tracker.in_flight("t", 0), 1);

        assert_eq!(tracker.ack("t", 0, 0), Some(4));
    }

    #[test]
    fn test_unacked_message_blocks_commit() {
        let tracker = OffsetTracker::new();
        tracker.track("t", 0, 5);
        tracker.track("t", 0, 6);

        assert_eq!(tracker.ack("t", 0, 6), Some(5));
        assert_eq!(tracker.committable("t", 0), Some(5));
    }

    #[test]
    fn test_partitions_are_independent() {
        let tracker = OffsetTracker::new();
        tracker.track("t", 0, 1);
        tracker.track("t", 1, 100);
        tracker.track("u", 0, 7);

        assert_eq!(tracker.ack("t", 1, 100), Some(101));
        assert_eq!(tracker.in_flight("t", 0), 1);
        assert_eq!(tracker.total_in_flight(), 2);
        assert_eq!(
            tracker.partitions(),
            vec![("t".to_string(), 0), ("t".to_string(), 1), ("u".to_string(), 0)]
        );

        tracker.forget_partition("t", 0);
        assert_eq!(tracker.total_in_flight(), 1);
    }

    #[test]
    fn test_duplicate_ack_is_ignored() {
        let tracker = OffsetTracker::new();
        tracker.track("t", 0, 1);
        assert_eq!(tracker.ack("t", 0, 1), Some(2));
        assert_eq!(tracker.ack("t", 0, 1), None);
    }

    #[test]
    fn test_released_offset_does_not_block_partition() {
        let tracker = OffsetTracker::new();
        for offset in 0..100 {
            tracker.track("t", 0, offset);
        }

        assert_eq!(tracker.release("t", 0, 0), Some(1));
        for offset in 1..100 {
            tracker.ack("t", 0, offset);
        }

        assert_eq!(tracker.committable("t", 0), Some(100));
        assert_eq!(tracker.in_flight("t", 0), 0);
    }

    #[test]
    fn test_release_in_the_middle_waits_for_lower_offsets() {
        let tracker = OffsetTracker::new();
        for offset in 0..3 {
            tracker.track("t", 0, offset);
        }

        assert_eq!(tracker.release("t", 0, 1), Some(0));
        assert_eq!(tracker.ack("t", 0, 0), Some(2));
        assert_eq!(tracker.ack("t", 0, 2), Some(3));
    }

    #[test]
    fn test_released_highest_offset_advances_position() {
        let tracker = OffsetTracker::new();
        tracker.track("t", 0, 4);
        tracker.track("t", 0, 5);

        assert_eq!(tracker.ack("t", 0, 4), Some(5));
        assert_eq!(tracker.release("t", 0, 5), Some(6));
    }

    #[test]
    fn test_untracked_offset_is_not_skipped() {
        let tracker = OffsetTracker::new();
        for offset in 0..3 {
            tracker.track("t", 0, offset);
        }

        assert_eq!(tracker.ack("t", 0, 0), Some(1));
        assert_eq!(tracker.ack("t", 0, 1), Some(2));
        tracker.untrack("t", 0, 2);

        assert_eq!(tracker.in_flight("t", 0), 0);
        assert_eq!(tracker.committable("t", 0), Some(2));
    }

    #[test]
    fn test_ack_after_forget_is_ignored() {
        let tracker = OffsetTracker::new();
        tracker.track("t", 0, 1);
        tracker.forget_partition("t", 0);

        assert_eq!(tracker.ack("t", 0, 1), None);
        assert_eq!(tracker.release("t", 0, 1), None);
        assert!(tracker.partitions().is_empty());
    }
}
