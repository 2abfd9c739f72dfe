//! Sender-side and receiver-side loss bookkeeping.
//!
//! Both sides keep missing sequences as sorted, pairwise-disjoint
//! inclusive ranges, strictly between the highest acknowledged and the
//! highest seen sequence. The receiver list additionally carries per-range
//! NAK accounting: how often a range was reported and when the next
//! report is due.

use crate::packet::SeqRange;
use crate::seq::SeqNo;
use std::collections::VecDeque;

/// Sequences the sender must retransmit, fed by NAKs and timeout checks.
#[derive(Debug, Default)]
pub struct SenderLossList {
    ranges: VecDeque<SeqRange>,
    total: usize,
}

impl SenderLossList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Adds a range, merging with neighbours. Returns how many sequences
    /// were not present before (duplicate NAKs count zero).
    pub fn insert(&mut self, range: SeqRange) -> usize {
        let mut from = range.from;
        let mut to = range.to;
        let mut removed = 0usize;

        // Pull out every existing range that overlaps or touches the new
        // one, widening it as we go.
        let mut keep = VecDeque::with_capacity(self.ranges.len() + 1);
        let mut inserted = false;
        for existing in self.ranges.drain(..) {
            if existing.to.next().after_or_eq(from) && to.next().after_or_eq(existing.from) {
                // Overlapping or adjacent: absorb.
                if existing.from.offset_to(from) > 0 {
                    from = existing.from;
                }
                if to.offset_to(existing.to) > 0 {
                    to = existing.to;
                }
                removed += existing.len() as usize;
            } else if existing.from.after(to) {
                if !inserted {
                    keep.push_back(SeqRange { from, to });
                    inserted = true;
                }
                keep.push_back(existing);
            } else {
                keep.push_back(existing);
            }
        }
        if !inserted {
            keep.push_back(SeqRange { from, to });
        }
        self.ranges = keep;

        let merged_len = from.len_to(to) as usize;
        let added = merged_len - removed;
        self.total += added;
        added
    }

    /// Takes the lowest missing sequence for retransmission.
    pub fn pop_first(&mut self) -> Option<SeqNo> {
        let front = self.ranges.front_mut()?;
        let seq = front.from;
        self.total -= 1;
        if front.is_single() {
            self.ranges.pop_front();
        } else {
            front.from = front.from.next();
        }
        Some(seq)
    }

    /// Drops everything before `next_expected` (covered by an ACK).
    pub fn remove_up_to(&mut self, next_expected: SeqNo) {
        while let Some(front) = self.ranges.front_mut() {
            if next_expected.after(front.to) {
                self.total -= front.len() as usize;
                self.ranges.pop_front();
            } else if next_expected.after(front.from) {
                self.total -= front.from.offset_to(next_expected) as usize;
                front.from = next_expected;
                break;
            } else {
                break;
            }
        }
    }

    #[cfg(test)]
    fn ranges(&self) -> Vec<SeqRange> {
        self.ranges.iter().copied().collect()
    }
}

/// One missing range on the receiver, with NAK-report accounting.
#[derive(Debug, Clone, Copy)]
pub struct LossEntry {
    pub range: SeqRange,
    /// How many NAKs have carried this range.
    pub feedback_count: u32,
    /// When the next periodic NAK report for this range is due.
    pub next_report_us: u64,
}

/// Missing sequences on the receiver, discovered as gaps in arrival.
#[derive(Debug, Default)]
pub struct ReceiverLossList {
    entries: VecDeque<LossEntry>,
    total: usize,
}

impl ReceiverLossList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn first_seq(&self) -> Option<SeqNo> {
        self.entries.front().map(|e| e.range.from)
    }

    /// Records a freshly discovered gap. Gaps are found in arrival order,
    /// so the new range lands at the tail; a range overlapping the tail
    /// is merged rather than duplicated.
    pub fn insert(&mut self, range: SeqRange, report_deadline_us: u64) {
        if let Some(back) = self.entries.back_mut() {
            if back.range.to.next().after_or_eq(range.from) && !back.range.to.after_or_eq(range.to)
            {
                let add = back.range.to.offset_to(range.to) as usize;
                back.range.to = range.to;
                self.total += add;
                return;
            }
            if back.range.to.after_or_eq(range.to) && back.range.from.offset_to(range.from) >= 0 {
                return; // fully contained
            }
        }
        self.total += range.len() as usize;
        self.entries.push_back(LossEntry {
            range,
            feedback_count: 0,
            next_report_us: report_deadline_us,
        });
    }

    /// A missing packet arrived after all: removes it, splitting its
    /// range when it sat in the middle. Returns false when the sequence
    /// was not in the list (an original, not a recovered loss).
    pub fn remove_sequence(&mut self, seq: SeqNo) -> bool {
        let found = self
            .entries
            .iter()
            .position(|e| seq.after_or_eq(e.range.from) && e.range.to.after_or_eq(seq));
        let Some(idx) = found else {
            return false;
        };
        let entry = self.entries[idx];
        self.total -= 1;
        if entry.range.is_single() {
            self.entries.remove(idx);
        } else if seq == entry.range.from {
            self.entries[idx].range.from = seq.next();
        } else if seq == entry.range.to {
            self.entries[idx].range.to = seq.prev();
        } else {
            self.entries[idx].range.to = seq.prev();
            self.entries.insert(
                idx + 1,
                LossEntry {
                    range: SeqRange {
                        from: seq.next(),
                        to: entry.range.to,
                    },
                    feedback_count: entry.feedback_count,
                    next_report_us: entry.next_report_us,
                },
            );
        }
        true
    }

    /// Drops everything before `next_expected` (dropped or acknowledged).
    pub fn remove_up_to(&mut self, next_expected: SeqNo) {
        while let Some(front) = self.entries.front_mut() {
            if next_expected.after(front.range.to) {
                self.total -= front.range.len() as usize;
                self.entries.pop_front();
            } else if next_expected.after(front.range.from) {
                self.total -= front.range.from.offset_to(next_expected) as usize;
                front.range.from = next_expected;
                break;
            } else {
                break;
            }
        }
    }

    /// Collects ranges whose periodic report deadline has passed, bumping
    /// their feedback counters and re-arming the deadline.
    pub fn collect_due(&mut self, now_us: u64, next_deadline_us: u64) -> Vec<SeqRange> {
        let mut due = Vec::new();
        for entry in &mut self.entries {
            if entry.next_report_us <= now_us {
                due.push(entry.range);
                entry.feedback_count += 1;
                entry.next_report_us = next_deadline_us;
            }
        }
        due
    }

    /// All standing ranges, for an immediate full report.
    pub fn all_ranges(&self) -> Vec<SeqRange> {
        self.entries.iter().map(|e| e.range).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seq::MAX_SEQ;

    fn range(from: u32, to: u32) -> SeqRange {
        SeqRange {
            from: SeqNo::new(from),
            to: SeqNo::new(to),
        }
    }

    #[test]
    fn sender_insert_keeps_ranges_sorted_and_disjoint() {
        let mut list = SenderLossList::new();
        assert_eq!(list.insert(range(20, 25)), 6);
        assert_eq!(list.insert(range(5, 8)), 4);
        assert_eq!(list.insert(range(30, 30)), 1);
        assert_eq!(list.ranges(), vec![range(5, 8), range(20, 25), range(30, 30)]);
        assert_eq!(list.len(), 11);

        // Re-reporting is idempotent.
        assert_eq!(list.insert(range(20, 25)), 0);
        assert_eq!(list.len(), 11);
    }

    #[test]
    fn sender_insert_merges_overlap_and_adjacency() {
        let mut list = SenderLossList::new();
        list.insert(range(10, 12));
        list.insert(range(16, 18));
        // Bridges both neighbours (13 touches 12, 15 touches 16).
        assert_eq!(list.insert(range(13, 15)), 3);
        assert_eq!(list.ranges(), vec![range(10, 18)]);
        assert_eq!(list.len(), 9);
    }

    #[test]
    fn sender_pop_first_returns_lowest() {
        let mut list = SenderLossList::new();
        list.insert(range(7, 9));
        list.insert(range(3, 3));
        assert_eq!(list.pop_first(), Some(SeqNo::new(3)));
        assert_eq!(list.pop_first(), Some(SeqNo::new(7)));
        assert_eq!(list.pop_first(), Some(SeqNo::new(8)));
        assert_eq!(list.pop_first(), Some(SeqNo::new(9)));
        assert_eq!(list.pop_first(), None);
        assert!(list.is_empty());
    }

    #[test]
    fn sender_ack_trims_head() {
        let mut list = SenderLossList::new();
        list.insert(range(10, 20));
        list.remove_up_to(SeqNo::new(15));
        assert_eq!(list.ranges(), vec![range(15, 20)]);
        assert_eq!(list.len(), 6);
        list.remove_up_to(SeqNo::new(30));
        assert!(list.is_empty());
    }

    #[test]
    fn sender_wraps_cleanly() {
        let mut list = SenderLossList::new();
        list.insert(range(MAX_SEQ - 1, MAX_SEQ));
        assert_eq!(list.insert(range(0, 1)), 2); // adjacent across the wrap
        assert_eq!(list.ranges(), vec![range(MAX_SEQ - 1, 1)]);
        assert_eq!(list.pop_first(), Some(SeqNo::new(MAX_SEQ - 1)));
        assert_eq!(list.pop_first(), Some(SeqNo::new(MAX_SEQ)));
        assert_eq!(list.pop_first(), Some(SeqNo::new(0)));
    }

    #[test]
    fn receiver_split_on_arrival() {
        let mut list = ReceiverLossList::new();
        list.insert(range(100, 104), 500);
        assert!(list.remove_sequence(SeqNo::new(102)));
        assert_eq!(
            list.all_ranges(),
            vec![range(100, 101), range(103, 104)]
        );
        assert_eq!(list.len(), 4);

        assert!(list.remove_sequence(SeqNo::new(100)));
        assert!(list.remove_sequence(SeqNo::new(104)));
        assert_eq!(list.all_ranges(), vec![range(101, 101), range(103, 103)]);

        // Not in the list.
        assert!(!list.remove_sequence(SeqNo::new(102)));
        assert!(!list.remove_sequence(SeqNo::new(50)));
    }

    #[test]
    fn receiver_tail_merge() {
        let mut list = ReceiverLossList::new();
        list.insert(range(10, 12), 0);
        list.insert(range(13, 14), 0);
        assert_eq!(list.all_ranges(), vec![range(10, 14)]);
        assert_eq!(list.len(), 5);
        assert_eq!(list.first_seq(), Some(SeqNo::new(10)));
    }

    #[test]
    fn receiver_periodic_report_accounting() {
        let mut list = ReceiverLossList::new();
        list.insert(range(10, 12), 100);
        list.insert(range(20, 20), 900);

        // Only the first range is due at t=500.
        let due = list.collect_due(500, 800);
        assert_eq!(due, vec![range(10, 12)]);
        assert_eq!(list.entries[0].feedback_count, 1);

        // Re-armed to t=800; both fire at t=1000.
        let due = list.collect_due(1000, 2000);
        assert_eq!(due, vec![range(10, 12), range(20, 20)]);
        assert_eq!(list.entries[0].feedback_count, 2);
        assert_eq!(list.entries[1].feedback_count, 1);
    }

    #[test]
    fn receiver_drop_trims_head() {
        let mut list = ReceiverLossList::new();
        list.insert(range(10, 14), 0);
        list.remove_up_to(SeqNo::new(13));
        assert_eq!(list.all_ranges(), vec![range(13, 14)]);
        list.remove_up_to(SeqNo::new(15));
        assert!(list.is_empty());
    }
}
