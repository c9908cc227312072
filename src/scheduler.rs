//! Capacity-aware host selection.
//!
//! A capacity snapshot is turned into a static partition of slot numbers
//! `1..=total`: the first host owns slots `1..=c0`, the second `c0+1..=c1`
//! and so on, where `ci` is the cumulative sum of available slots. Slots are
//! handed out in increasing order, so the selected host only ever moves
//! forward through the snapshot until the partition is exhausted.

use std::collections::HashSet;

use crate::error::{MarionetteError, Result};
use crate::fleet::CapacityEntry;

/// Host chosen for one launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// 1-based slot number within the current epoch.
    pub slot: usize,
    pub host: String,
}

/// One capacity epoch: the snapshot, its cumulative sums and a cursor.
#[derive(Debug, Clone)]
pub struct SlotPartition {
    snapshot: Vec<CapacityEntry>,
    cumulative: Vec<usize>,
    /// Index of the host owning the last handed out slot.
    cursor: usize,
    /// Next slot number to hand out, starting at 1.
    next_slot: usize,
}

impl SlotPartition {
    /// Builds the partition, rejecting snapshots with repeated hosts or
    /// entries without any slot.
    pub fn new(snapshot: Vec<CapacityEntry>) -> Result<Self> {
        let mut seen = HashSet::new();
        for entry in &snapshot {
            if entry.available_slots == 0 {
                return Err(MarionetteError::Config(format!(
                    "The capacity of host '{}' is not positive.",
                    entry.identity
                )));
            }
            if !seen.insert(entry.identity.as_str()) {
                return Err(MarionetteError::DuplicateHost(entry.identity.clone()));
            }
        }
        let cumulative = cumulative_capacity(&snapshot);
        Ok(Self {
            snapshot,
            cumulative,
            cursor: 0,
            next_slot: 1,
        })
    }

    pub fn snapshot(&self) -> &[CapacityEntry] {
        &self.snapshot
    }

    pub fn cumulative(&self) -> &[usize] {
        &self.cumulative
    }

    pub fn total(&self) -> usize {
        self.cumulative.last().copied().unwrap_or(0)
    }

    /// Number of slots handed out so far.
    pub fn launched(&self) -> usize {
        self.next_slot - 1
    }

    pub fn is_exhausted(&self) -> bool {
        self.next_slot > self.total()
    }

    /// Hands out the next slot, or `None` once every slot is taken.
    pub fn assign(&mut self) -> Option<Assignment> {
        if self.is_exhausted() {
            return None;
        }
        while self.next_slot > self.cumulative[self.cursor] {
            self.cursor += 1;
        }
        let assignment = Assignment {
            slot: self.next_slot,
            host: self.snapshot[self.cursor].identity.clone(),
        };
        self.next_slot += 1;
        Some(assignment)
    }
}

/// `cumulative[i]` is the sum of the available slots of entries `0..=i`.
pub fn cumulative_capacity(snapshot: &[CapacityEntry]) -> Vec<usize> {
    snapshot
        .iter()
        .scan(0, |total, entry| {
            *total += entry.available_slots;
            Some(*total)
        })
        .collect()
}

/// Index of the host owning 1-based `slot`, if the slot exists.
pub fn host_for_slot(cumulative: &[usize], slot: usize) -> Option<usize> {
    if slot == 0 {
        return None;
    }
    cumulative.iter().position(|&bound| slot <= bound)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(slots: &[(&str, usize)]) -> Vec<CapacityEntry> {
        slots
            .iter()
            .map(|(host, n)| CapacityEntry::new(*host, *n))
            .collect()
    }

    #[test]
    fn test_cumulative_capacity() {
        let entries = snapshot(&[("a", 2), ("b", 3), ("c", 1)]);
        assert_eq!(cumulative_capacity(&entries), vec![2, 5, 6]);
        assert!(cumulative_capacity(&[]).is_empty());
    }

    #[test]
    fn test_host_for_slot_partitions_contiguously() {
        let cumulative = [2, 5, 6];
        let owners: Vec<_> = (1..=6)
            .map(|slot| host_for_slot(&cumulative, slot).unwrap())
            .collect();
        assert_eq!(owners, vec![0, 0, 1, 1, 1, 2]);
        assert_eq!(host_for_slot(&cumulative, 0), None);
        assert_eq!(host_for_slot(&cumulative, 7), None);
    }

    #[test]
    fn test_host_for_slot_is_monotonic() {
        let cumulative = [1, 4, 4 + 3, 7 + 8];
        let mut previous = 0;
        for slot in 1..=15 {
            let owner = host_for_slot(&cumulative, slot).unwrap();
            assert!(owner >= previous);
            previous = owner;
        }
    }

    #[test]
    fn test_assign_walks_hosts_in_snapshot_order() {
        let mut partition = SlotPartition::new(snapshot(&[("a", 2), ("b", 1)])).unwrap();
        assert_eq!(partition.total(), 3);
        let hosts: Vec<_> = std::iter::from_fn(|| partition.assign())
            .map(|a| (a.slot, a.host))
            .collect();
        assert_eq!(
            hosts,
            vec![(1, "a".to_string()), (2, "a".to_string()), (3, "b".to_string())]
        );
        assert!(partition.is_exhausted());
        assert_eq!(partition.launched(), 3);
        assert!(partition.assign().is_none());
    }

    #[test]
    fn test_assign_agrees_with_host_for_slot() {
        let entries = snapshot(&[("a", 3), ("b", 1), ("c", 4)]);
        let mut partition = SlotPartition::new(entries.clone()).unwrap();
        while let Some(assignment) = partition.assign() {
            let index = host_for_slot(partition.cumulative(), assignment.slot).unwrap();
            assert_eq!(entries[index].identity, assignment.host);
        }
    }

    #[test]
    fn test_empty_snapshot_is_exhausted() {
        let mut partition = SlotPartition::new(vec![]).unwrap();
        assert_eq!(partition.total(), 0);
        assert!(partition.is_exhausted());
        assert!(partition.assign().is_none());
    }

    #[test]
    fn test_rejects_duplicate_hosts() {
        let error = SlotPartition::new(snapshot(&[("a", 1), ("a", 2)])).unwrap_err();
        assert!(matches!(error, MarionetteError::DuplicateHost(host) if host == "a"));
    }

    #[test]
    fn test_rejects_non_positive_slots() {
        let error = SlotPartition::new(snapshot(&[("a", 0)])).unwrap_err();
        assert!(matches!(error, MarionetteError::Config(_)));
    }
}
