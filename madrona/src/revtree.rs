//! Per-document revision history trees.
//!
//! A [`RevTree`] owns every known revision of one document. Revisions live in
//! a stable arena (`revs`) and reference their parent by arena index, so the
//! tree can be copied and serialized without pointer fix-ups. A separate
//! index vector holds the display order: after [`RevTree::sort`] the current
//! revision is at position 0 and leaves precede non-leaves.

use std::collections::HashSet;
use std::fmt;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::revid::RevId;

pub mod raw;

/// Flag bits carried by each revision.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct RevFlags(u8);

impl RevFlags {
    pub const LEAF: RevFlags = RevFlags(0x01);
    pub const DELETED: RevFlags = RevFlags(0x02);
    pub const HAS_ATTACHMENTS: RevFlags = RevFlags(0x04);
    pub const KEEP_BODY: RevFlags = RevFlags(0x08);
    pub const IS_CONFLICT: RevFlags = RevFlags(0x10);
    pub const NEW: RevFlags = RevFlags(0x20);
    pub const FOREIGN: RevFlags = RevFlags(0x40);
    pub const MARKED_FOR_PURGE: RevFlags = RevFlags(0x80);

    /// Caller-supplied flags that survive insertion.
    const PRESERVED: RevFlags = RevFlags(0x02 | 0x04 | 0x08 | 0x40);
    /// Flags written to disk. `NEW` and `MARKED_FOR_PURGE` are transient.
    pub(crate) const PERSISTED: RevFlags = RevFlags(0x5f);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> RevFlags {
        RevFlags(bits)
    }

    pub fn contains(self, other: RevFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: RevFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: RevFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: RevFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for RevFlags {
    type Output = RevFlags;
    fn bitor(self, rhs: RevFlags) -> RevFlags {
        RevFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitAnd for RevFlags {
    type Output = RevFlags;
    fn bitand(self, rhs: RevFlags) -> RevFlags {
        RevFlags(self.0 & rhs.0)
    }
}

impl std::ops::BitOrAssign for RevFlags {
    fn bitor_assign(&mut self, rhs: RevFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for RevFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (RevFlags::LEAF, "Leaf"),
            (RevFlags::DELETED, "Deleted"),
            (RevFlags::HAS_ATTACHMENTS, "HasAttachments"),
            (RevFlags::KEEP_BODY, "KeepBody"),
            (RevFlags::IS_CONFLICT, "IsConflict"),
            (RevFlags::NEW, "New"),
            (RevFlags::FOREIGN, "Foreign"),
            (RevFlags::MARKED_FOR_PURGE, "MarkedForPurge"),
        ];
        let mut listed = false;
        for (flag, name) in names {
            if self.contains(flag) {
                if listed {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                listed = true;
            }
        }
        if !listed {
            write!(f, "(none)")?;
        }
        Ok(())
    }
}

/// Index of a revision inside its tree's arena.
pub type RevIndex = u16;

const MAX_REVS: usize = u16::MAX as usize;

/// One node of a document's revision tree.
#[derive(Debug, Clone)]
pub struct Rev {
    rev_id: RevId,
    body: Option<Bytes>,
    sequence: u64,
    flags: RevFlags,
    parent: Option<RevIndex>,
}

impl Rev {
    pub fn rev_id(&self) -> &RevId {
        &self.rev_id
    }

    /// The stored body, if this revision retains one.
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// The storage sequence; 0 until the enclosing tree has been persisted.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn flags(&self) -> RevFlags {
        self.flags
    }

    pub fn parent(&self) -> Option<RevIndex> {
        self.parent
    }

    pub fn is_leaf(&self) -> bool {
        self.flags.contains(RevFlags::LEAF)
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.contains(RevFlags::DELETED)
    }

    pub fn is_conflict(&self) -> bool {
        self.flags.contains(RevFlags::IS_CONFLICT)
    }

    pub fn is_new(&self) -> bool {
        self.flags.contains(RevFlags::NEW)
    }

    pub fn is_foreign(&self) -> bool {
        self.flags.contains(RevFlags::FOREIGN)
    }

    pub fn has_attachments(&self) -> bool {
        self.flags.contains(RevFlags::HAS_ATTACHMENTS)
    }

    /// A live branch head: a leaf that is not a tombstone.
    pub fn is_active(&self) -> bool {
        self.is_leaf() && !self.is_deleted()
    }

    fn is_marked_for_purge(&self) -> bool {
        self.flags.contains(RevFlags::MARKED_FOR_PURGE)
    }
}

/// Outcome of [`RevTree::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    /// The revision was added; HTTP equivalent 201.
    Created(RevIndex),
    /// A revision with this id already exists; the tree is unchanged
    /// (HTTP equivalent 200).
    AlreadyExists(RevIndex),
}

impl Inserted {
    pub fn index(self) -> RevIndex {
        match self {
            Inserted::Created(i) | Inserted::AlreadyExists(i) => i,
        }
    }

    pub fn created(self) -> bool {
        matches!(self, Inserted::Created(_))
    }
}

/// The revision history of one document.
#[derive(Debug, Clone, Default)]
pub struct RevTree {
    revs: Vec<Rev>,
    order: Vec<RevIndex>,
    changed: bool,
    sorted: bool,
}

impl RevTree {
    pub fn new() -> Self {
        RevTree {
            revs: Vec::new(),
            order: Vec::new(),
            changed: false,
            sorted: true,
        }
    }

    /// Decodes a tree from its on-disk form. Revisions stored with sequence 0
    /// take `record_sequence`, the sequence of the enclosing record.
    pub fn decode(data: &[u8], record_sequence: u64) -> Result<Self> {
        raw::decode_tree(data, record_sequence)
    }

    /// Serializes the tree. Encoding sorts first so that the on-disk record
    /// order is exactly the display order.
    pub fn encode(&mut self) -> Result<Bytes> {
        self.sort();
        raw::encode_tree(self)
    }

    pub fn len(&self) -> usize {
        self.revs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revs.is_empty()
    }

    /// True if the tree has mutations not yet persisted.
    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn rev(&self, index: RevIndex) -> &Rev {
        &self.revs[index as usize]
    }

    pub fn get(&self, rev_id: &RevId) -> Option<RevIndex> {
        self.revs
            .iter()
            .position(|r| r.rev_id == *rev_id)
            .map(|i| i as RevIndex)
    }

    pub fn get_by_sequence(&self, sequence: u64) -> Option<RevIndex> {
        self.revs
            .iter()
            .position(|r| r.sequence == sequence)
            .map(|i| i as RevIndex)
    }

    /// The current (winning) revision: position 0 of the sorted order.
    pub fn current(&mut self) -> Option<RevIndex> {
        self.sort();
        self.order.first().copied()
    }

    /// Arena indices in display order. Sorts if needed.
    pub fn in_order(&mut self) -> &[RevIndex] {
        self.sort();
        &self.order
    }

    /// Ancestor chain starting at `index`, ending at a root.
    pub fn history(&self, index: RevIndex) -> Vec<RevIndex> {
        let mut chain = Vec::new();
        let mut cur = Some(index);
        while let Some(i) = cur {
            chain.push(i);
            cur = self.revs[i as usize].parent;
        }
        chain
    }

    /// True when more than one live branch head exists.
    pub fn has_conflict(&self) -> bool {
        self.revs.iter().filter(|r| r.is_active()).count() > 1
    }

    /// Inserts one revision.
    ///
    /// Fails with `BadRevisionId` (400) on a zero generation or a generation
    /// that is not the parent's plus one, `NotFound` (404) when the named
    /// parent is absent, and `Conflict` (409) when the insert would create a
    /// branch and `allow_conflict` is false.
    pub fn insert(
        &mut self,
        rev_id: RevId,
        body: Option<Bytes>,
        flags: RevFlags,
        parent: Option<&RevId>,
        allow_conflict: bool,
    ) -> Result<Inserted> {
        let generation = rev_id.generation();
        if generation == 0 {
            return Err(Error::bad_revision_id(format!("invalid revision id {rev_id}")));
        }

        if let Some(existing) = self.get(&rev_id) {
            return Ok(Inserted::AlreadyExists(existing));
        }

        let (parent_index, parent_generation) = match parent {
            Some(parent_id) => {
                let index = self
                    .get(parent_id)
                    .ok_or_else(|| Error::not_found(format!("parent revision {parent_id} not found")))?;
                if !allow_conflict && !self.revs[index as usize].is_leaf() {
                    return Err(Error::conflict(format!(
                        "parent revision {parent_id} is not a leaf"
                    )));
                }
                (Some(index), self.revs[index as usize].rev_id.generation())
            }
            None => {
                if !allow_conflict && !self.revs.is_empty() {
                    return Err(Error::conflict("document already has revisions"));
                }
                (None, 0)
            }
        };

        if generation != parent_generation + 1 {
            return Err(Error::bad_revision_id(format!(
                "generation {generation} does not follow parent generation {parent_generation}"
            )));
        }

        Ok(Inserted::Created(self.raw_insert(rev_id, body, parent_index, flags)))
    }

    /// Inserts a revision along with its ancestry, as received from a peer.
    ///
    /// `history` lists revision ids newest first; element 0 is the revision
    /// being inserted, the rest its ancestors. The first id already present
    /// in the tree is the common ancestor; everything before it is created as
    /// a bodyless intermediate carrying only the `Foreign` flag. Returns the
    /// index of the common ancestor within `history` (`history.len()` when
    /// no id was known). Generations must decrease by exactly one per step.
    pub fn insert_history(
        &mut self,
        history: &[RevId],
        body: Option<Bytes>,
        flags: RevFlags,
    ) -> Result<usize> {
        assert!(!history.is_empty());
        let mut last_generation = 0u32;
        let mut parent: Option<RevIndex> = None;
        let mut i = 0;
        while i < history.len() {
            let generation = history[i].generation();
            if generation == 0 || (last_generation > 0 && generation != last_generation - 1) {
                return Err(Error::bad_revision_id(
                    "history generations not in sequence",
                ));
            }
            last_generation = generation;
            if let Some(index) = self.get(&history[i]) {
                parent = Some(index);
                break;
            }
            i += 1;
        }

        let common_ancestor = i;
        if i > 0 {
            let ancestor_flags = flags & RevFlags::FOREIGN;
            let mut j = i;
            while j > 1 {
                j -= 1;
                parent = Some(self.raw_insert(history[j].clone(), None, parent, ancestor_flags));
            }
            self.raw_insert(history[0].clone(), body, parent, flags);
        }
        Ok(common_ancestor)
    }

    /// The deepest revision reachable from both inputs by parent walks.
    /// Order-independent; equal inputs return the revision itself.
    pub fn common_ancestor(&self, a: RevIndex, b: RevIndex) -> Option<RevIndex> {
        let ancestors_of_a: HashSet<RevIndex> = self.history(a).into_iter().collect();
        self.history(b)
            .into_iter()
            .find(|i| ancestors_of_a.contains(i))
    }

    /// Leaves, in display order, whose generation precedes `rev_id`'s. These
    /// are the candidate delta bases a puller may offer for it.
    pub fn possible_ancestors(&mut self, rev_id: &RevId) -> Vec<RevIndex> {
        let generation = rev_id.generation();
        self.sort();
        self.order
            .iter()
            .copied()
            .filter(|&i| {
                let rev = &self.revs[i as usize];
                rev.is_leaf() && rev.rev_id.generation() < generation
            })
            .collect()
    }

    /// Resolves a conflict between two leaves. The losing branch is purged
    /// back to the branch point, and `merged_body` becomes a new child of the
    /// winner with a deterministically derived id. Returns the merged
    /// revision's index.
    pub fn resolve_conflict(
        &mut self,
        winner: &RevId,
        loser: &RevId,
        merged_body: Bytes,
    ) -> Result<RevIndex> {
        let winner_index = self
            .get(winner)
            .ok_or_else(|| Error::not_found(format!("revision {winner} not found")))?;
        let loser_index = self
            .get(loser)
            .ok_or_else(|| Error::not_found(format!("revision {loser} not found")))?;
        if !self.revs[winner_index as usize].is_leaf() || !self.revs[loser_index as usize].is_leaf()
        {
            return Err(Error::conflict("conflict resolution requires two leaves"));
        }

        let merged_id = RevId::for_merge(winner, loser, &merged_body);
        self.purge(loser);
        // The purge compacted the arena; re-resolve the winner.
        let winner_index = self
            .get(winner)
            .ok_or_else(|| Error::not_found(format!("revision {winner} not found")))?;
        let merged = self.raw_insert(
            merged_id,
            Some(merged_body),
            Some(winner_index),
            RevFlags::default(),
        );
        self.sorted = false;
        self.sort();
        Ok(merged)
    }

    /// Limits every leaf's ancestry to `max_depth` revisions, removing
    /// anything deeper. Returns the number of revisions removed.
    pub fn prune(&mut self, max_depth: u32) -> usize {
        assert!(max_depth > 0);
        if self.revs.len() <= max_depth as usize {
            return 0;
        }

        let mut pruned = 0;
        for i in 0..self.revs.len() {
            if !self.revs[i].is_leaf() {
                continue;
            }
            let mut depth = 0u32;
            let mut ancestor = Some(i as RevIndex);
            while let Some(a) = ancestor {
                depth += 1;
                if depth > max_depth && !self.revs[a as usize].is_marked_for_purge() {
                    self.revs[a as usize].flags.insert(RevFlags::MARKED_FOR_PURGE);
                    pruned += 1;
                }
                ancestor = self.revs[a as usize].parent;
            }
        }
        if pruned == 0 {
            return 0;
        }

        for i in 0..self.revs.len() {
            if let Some(p) = self.revs[i].parent {
                if self.revs[p as usize].is_marked_for_purge() {
                    self.revs[i].parent = None;
                }
            }
        }
        self.compact();
        pruned
    }

    /// Purges the branch ending in `leaf`, walking toward the root and
    /// stopping at the first revision that still has another live child.
    /// Returns the number of revisions removed.
    pub fn purge(&mut self, leaf: &RevId) -> usize {
        let Some(mut index) = self.get(leaf) else {
            return 0;
        };
        if !self.revs[index as usize].is_leaf() {
            return 0;
        }
        let mut purged = 0;
        loop {
            purged += 1;
            self.revs[index as usize].flags.insert(RevFlags::MARKED_FOR_PURGE);
            let parent = self.revs[index as usize].parent.take();
            match parent {
                Some(p) if self.confirm_leaf(p) => index = p,
                _ => break,
            }
        }
        self.compact();
        self.sorted = false;
        self.sort();
        purged
    }

    /// Removes every revision.
    pub fn purge_all(&mut self) -> usize {
        let purged = self.revs.len();
        self.revs.clear();
        self.order.clear();
        self.changed = true;
        self.sorted = true;
        purged
    }

    /// Drops the bodies of saved revisions that are neither leaves nor marked
    /// `KeepBody`.
    pub fn remove_non_leaf_bodies(&mut self) {
        for rev in &mut self.revs {
            if rev.body.is_some()
                && !rev
                    .flags
                    .intersects(RevFlags::LEAF | RevFlags::NEW | RevFlags::KEEP_BODY)
            {
                rev.body = None;
                self.changed = true;
            }
        }
    }

    /// Drops one revision's retained body.
    pub fn remove_body(&mut self, index: RevIndex) {
        let rev = &mut self.revs[index as usize];
        if rev.flags.contains(RevFlags::KEEP_BODY) {
            rev.flags.remove(RevFlags::KEEP_BODY);
            rev.body = None;
            self.changed = true;
        }
    }

    /// Called after the tree has been persisted: clears `New` markers and
    /// stamps the freshly assigned sequence on every revision written in
    /// this save.
    pub fn saved(&mut self, sequence: u64) {
        for rev in &mut self.revs {
            rev.flags.remove(RevFlags::NEW);
            if rev.sequence == 0 {
                rev.sequence = sequence;
            }
        }
        self.changed = false;
    }

    /// Orders the display vector: leaves first, then live before deleted,
    /// non-conflicts before conflicts, higher revision id first.
    pub fn sort(&mut self) {
        if self.sorted {
            return;
        }
        let revs = &self.revs;
        self.order.sort_by(|&a, &b| {
            let ra = &revs[a as usize];
            let rb = &revs[b as usize];
            rb.is_leaf()
                .cmp(&ra.is_leaf())
                .then(ra.is_deleted().cmp(&rb.is_deleted()))
                .then(ra.is_conflict().cmp(&rb.is_conflict()))
                .then(rb.rev_id.cmp(&ra.rev_id))
        });
        self.sorted = true;
        self.check_for_resolved_conflict();
    }

    fn raw_insert(
        &mut self,
        rev_id: RevId,
        body: Option<Bytes>,
        parent: Option<RevIndex>,
        flags: RevFlags,
    ) -> RevIndex {
        assert!(self.revs.len() < MAX_REVS);
        let index = self.revs.len() as RevIndex;
        let mut new_flags = RevFlags::LEAF | RevFlags::NEW | (flags & RevFlags::PRESERVED);

        if let Some(p) = parent {
            let parent_rev = &self.revs[p as usize];
            // Extending a non-leaf, or a branch already in conflict, creates
            // or continues a conflicting branch.
            let conflict = !parent_rev.is_leaf() || parent_rev.is_conflict();
            if conflict {
                new_flags |= RevFlags::IS_CONFLICT;
            }
            self.revs[p as usize].flags.remove(RevFlags::LEAF);
            if flags.contains(RevFlags::KEEP_BODY) {
                // Only one revision on the main branch may retain its body.
                let mut ancestor = Some(p);
                while let Some(a) = ancestor {
                    if conflict && !self.revs[a as usize].is_conflict() {
                        break;
                    }
                    self.revs[a as usize].flags.remove(RevFlags::KEEP_BODY);
                    ancestor = self.revs[a as usize].parent;
                }
            }
        } else if !self.revs.is_empty() {
            // A second root.
            new_flags |= RevFlags::IS_CONFLICT;
        }

        self.changed = true;
        if !self.order.is_empty() {
            self.sorted = false;
        }
        self.revs.push(Rev {
            rev_id,
            body,
            sequence: 0,
            flags: new_flags,
            parent,
        });
        self.order.push(index);
        index
    }

    /// If `index` has no children, re-marks it as a leaf.
    fn confirm_leaf(&mut self, index: RevIndex) -> bool {
        if self.revs.iter().any(|r| r.parent == Some(index)) {
            return false;
        }
        self.revs[index as usize].flags.insert(RevFlags::LEAF);
        true
    }

    /// With no non-conflict leaf remaining, the winning chain stops being a
    /// conflict: clear the markers from position 0 down to its root.
    fn check_for_resolved_conflict(&mut self) {
        if !self.sorted || self.order.is_empty() {
            return;
        }
        let head = self.order[0];
        if !self.revs[head as usize].is_conflict() {
            return;
        }
        let mut cur = Some(head);
        while let Some(i) = cur {
            self.revs[i as usize].flags.remove(RevFlags::IS_CONFLICT);
            cur = self.revs[i as usize].parent;
        }
    }

    fn compact(&mut self) {
        let mut remap = vec![u16::MAX; self.revs.len()];
        let mut next = 0u16;
        for (i, rev) in self.revs.iter().enumerate() {
            if !rev.is_marked_for_purge() {
                remap[i] = next;
                next += 1;
            }
        }
        let old_revs = std::mem::take(&mut self.revs);
        self.revs = old_revs
            .into_iter()
            .enumerate()
            .filter(|(i, _)| remap[*i] != u16::MAX)
            .map(|(_, mut rev)| {
                rev.parent = rev
                    .parent
                    .and_then(|p| (remap[p as usize] != u16::MAX).then_some(remap[p as usize]));
                rev
            })
            .collect();
        let old_order = std::mem::take(&mut self.order);
        self.order = old_order
            .into_iter()
            .filter(|&i| remap[i as usize] != u16::MAX)
            .map(|i| remap[i as usize])
            .collect();
        self.changed = true;
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    /// A small tree with a conflict branch, used by the codec tests too.
    pub(crate) fn sample_tree() -> RevTree {
        let mut tree = RevTree::new();
        let mut insert = |id: &str, parent: Option<&str>, flags: RevFlags| {
            let parent = parent.map(|p| p.parse::<RevId>().unwrap());
            tree.insert(
                id.parse().unwrap(),
                Some(Bytes::from(format!("{{\"rev\":\"{id}\"}}"))),
                flags,
                parent.as_ref(),
                true,
            )
            .unwrap();
        };
        insert("1-aa", None, RevFlags::default());
        insert("2-bb", Some("1-aa"), RevFlags::KEEP_BODY);
        insert("3-cc", Some("2-bb"), RevFlags::default());
        insert("3-dd", Some("2-bb"), RevFlags::DELETED);
        insert("4-ee", Some("3-cc"), RevFlags::HAS_ATTACHMENTS);
        tree
    }
}
