//! A sparse ordered set of storage sequences.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A set of positive sequence numbers plus the largest value ever inserted.
///
/// The replicator uses this to track sequences that have been handed out but
/// not yet confirmed complete; the complement of an advancing checkpoint.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceSet {
    seqs: BTreeSet<u64>,
    max_ever: u64,
}

impl SequenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empties the set. `max` becomes the new `max_ever`.
    pub fn clear(&mut self, max: u64) {
        self.seqs.clear();
        self.max_ever = max;
    }

    pub fn is_empty(&self) -> bool {
        self.seqs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.seqs.len()
    }

    /// The lowest sequence in the set, or 0 when empty.
    pub fn first(&self) -> u64 {
        self.seqs.iter().next().copied().unwrap_or(0)
    }

    /// The largest sequence ever inserted (reset only by [`Self::clear`]).
    pub fn max_ever(&self) -> u64 {
        self.max_ever
    }

    pub fn contains(&self, seq: u64) -> bool {
        self.seqs.contains(&seq)
    }

    pub fn insert(&mut self, seq: u64) {
        self.seqs.insert(seq);
        self.max_ever = self.max_ever.max(seq);
    }

    pub fn remove(&mut self, seq: u64) -> bool {
        self.seqs.remove(&seq)
    }

    /// The checkpoint implied by the set: every sequence at or below the
    /// returned value is complete. Equals `max_ever` when the set is empty,
    /// otherwise the lowest pending sequence minus one.
    pub fn completed_through(&self) -> u64 {
        match self.seqs.iter().next() {
            None => self.max_ever,
            Some(first) => first - 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove_contains() {
        let mut set = SequenceSet::new();
        assert!(set.is_empty());
        set.insert(10);
        set.insert(3);
        set.insert(7);
        assert!(set.contains(3));
        assert_eq!(set.first(), 3);
        assert_eq!(set.len(), 3);
        assert_eq!(set.max_ever(), 10);
        assert!(set.remove(3));
        assert!(!set.contains(3));
        assert_eq!(set.first(), 7);
        // max_ever survives removal
        set.remove(10);
        set.remove(7);
        assert!(set.is_empty());
        assert_eq!(set.max_ever(), 10);
    }

    #[test]
    fn completed_through_tracks_low_water() {
        let mut set = SequenceSet::new();
        assert_eq!(set.completed_through(), 0);
        for seq in 1..=5 {
            set.insert(seq);
        }
        assert_eq!(set.completed_through(), 0);
        set.remove(1);
        assert_eq!(set.completed_through(), 1);
        set.remove(3);
        // 2 still pending
        assert_eq!(set.completed_through(), 1);
        set.remove(2);
        assert_eq!(set.completed_through(), 3);
        set.remove(4);
        set.remove(5);
        assert_eq!(set.completed_through(), 5);
    }

    #[test]
    fn clear_resets_max() {
        let mut set = SequenceSet::new();
        set.insert(42);
        set.clear(7);
        assert!(set.is_empty());
        assert_eq!(set.max_ever(), 7);
        assert_eq!(set.completed_through(), 7);
    }
}
