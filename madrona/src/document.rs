//! Versioned documents: a revision tree plus its storage identity.

use std::fmt;

use bytes::Bytes;
use tracing::trace;

use crate::error::{Error, Result};
use crate::revid::RevId;
use crate::revtree::{RevFlags, RevIndex, RevTree};
use crate::store::{RecordMeta, StorageEngine, StoreTransaction};

/// Flags describing a stored document as a whole.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct DocFlags(u8);

impl DocFlags {
    pub const EXISTS: DocFlags = DocFlags(0x01);
    pub const DELETED: DocFlags = DocFlags(0x02);
    pub const CONFLICTED: DocFlags = DocFlags(0x04);
    pub const HAS_ATTACHMENTS: DocFlags = DocFlags(0x08);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> DocFlags {
        DocFlags(bits)
    }

    pub fn contains(self, other: DocFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for DocFlags {
    type Output = DocFlags;
    fn bitor(self, rhs: DocFlags) -> DocFlags {
        DocFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for DocFlags {
    fn bitor_assign(&mut self, rhs: DocFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for DocFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocFlags({:#04x})", self.0)
    }
}

/// Limit applied to document ids at the API boundary.
pub const MAX_DOC_ID_LEN: usize = 240;

/// A put request, mirroring the wire-facing document API.
///
/// With `existing` set, `history` lists the incoming revision first followed
/// by its ancestry (newest to oldest), as produced by a peer. Otherwise a
/// new revision is created whose parent is `history[0]` (or the document is
/// created when `history` is empty) and whose id is derived from the parent,
/// the deletion flag and the body.
#[derive(Debug, Clone, Default)]
pub struct PutRequest {
    pub body: Option<Bytes>,
    pub history: Vec<RevId>,
    pub existing: bool,
    pub allow_conflict: bool,
    pub deleted: bool,
    pub has_attachments: bool,
    pub keep_body: bool,
    pub foreign: bool,
}

/// Outcome of [`VersionedDoc::put`].
#[derive(Debug, Clone)]
pub struct PutOutcome {
    /// The id of the (possibly pre-existing) target revision.
    pub rev_id: RevId,
    /// For history inserts: how far into the history the common ancestor
    /// was found. 0 means the revision was already present.
    pub common_ancestor: usize,
    /// Whether anything was actually added to the tree.
    pub created: bool,
}

/// A document's revision tree together with its storage identity.
#[derive(Debug, Clone)]
pub struct VersionedDoc {
    doc_id: String,
    sequence: u64,
    flags: DocFlags,
    tree: RevTree,
}

impl VersionedDoc {
    /// Loads a document. With `must_exist`, an absent document is a
    /// `NotFound` error; otherwise it comes back empty with zero flags.
    pub fn get<S: StorageEngine>(store: &S, doc_id: &str, must_exist: bool) -> Result<VersionedDoc> {
        validate_doc_id(doc_id)?;
        match store.get(doc_id)? {
            Some(record) => {
                let tree = RevTree::decode(&record.body, record.sequence)?;
                Ok(VersionedDoc {
                    doc_id: record.doc_id,
                    sequence: record.sequence,
                    flags: record.flags,
                    tree,
                })
            }
            None if must_exist => Err(Error::not_found(format!("no document {doc_id:?}"))),
            None => Ok(VersionedDoc {
                doc_id: doc_id.to_string(),
                sequence: 0,
                flags: DocFlags::default(),
                tree: RevTree::new(),
            }),
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn flags(&self) -> DocFlags {
        self.flags
    }

    pub fn exists(&self) -> bool {
        self.flags.contains(DocFlags::EXISTS)
    }

    pub fn tree(&self) -> &RevTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut RevTree {
        &mut self.tree
    }

    /// The winning revision's id.
    pub fn current_rev_id(&mut self) -> Option<RevId> {
        let index = self.tree.current()?;
        Some(self.tree.rev(index).rev_id().clone())
    }

    /// Applies a [`PutRequest`] to the in-memory tree. Call
    /// [`Self::save`] afterwards to persist.
    pub fn put(&mut self, request: &PutRequest) -> Result<PutOutcome> {
        let mut flags = RevFlags::default();
        if request.deleted {
            flags |= RevFlags::DELETED;
        }
        if request.has_attachments {
            flags |= RevFlags::HAS_ATTACHMENTS;
        }
        if request.keep_body {
            flags |= RevFlags::KEEP_BODY;
        }
        if request.foreign {
            flags |= RevFlags::FOREIGN;
        }

        if request.existing {
            let history = &request.history;
            if history.is_empty() {
                return Err(Error::bad_revision_id("empty revision history"));
            }
            let common_ancestor =
                self.tree
                    .insert_history(history, request.body.clone(), flags)?;
            Ok(PutOutcome {
                rev_id: history[0].clone(),
                common_ancestor,
                created: common_ancestor > 0,
            })
        } else {
            let parent = request.history.first();
            if let Some(parent_id) = parent {
                if self.tree.get(parent_id).is_none() {
                    return Err(Error::not_found(format!(
                        "parent revision {parent_id} not found"
                    )));
                }
            }
            let rev_id = RevId::for_put(
                parent,
                request.deleted,
                request.body.as_deref().unwrap_or(&[]),
            );
            let inserted = self.tree.insert(
                rev_id.clone(),
                request.body.clone(),
                flags,
                parent,
                request.allow_conflict,
            )?;
            Ok(PutOutcome {
                rev_id,
                common_ancestor: usize::from(inserted.created()),
                created: inserted.created(),
            })
        }
    }

    /// Purges one branch (walking up to the nearest branch point), or the
    /// whole document when `rev_id` is `None`. Returns the number of
    /// revisions removed.
    pub fn purge_revision(&mut self, rev_id: Option<&RevId>) -> usize {
        match rev_id {
            Some(id) => self.tree.purge(id),
            None => self.tree.purge_all(),
        }
    }

    /// Resolves a conflict between two leaf revisions; see
    /// [`RevTree::resolve_conflict`].
    pub fn resolve_conflict(
        &mut self,
        winner: &RevId,
        loser: &RevId,
        merged_body: Bytes,
    ) -> Result<RevIndex> {
        self.tree.resolve_conflict(winner, loser, merged_body)
    }

    /// Persists the document in its own transaction.
    pub fn save<S: StorageEngine>(&mut self, store: &S, max_depth: u32) -> Result<u64> {
        let mut txn = store.begin_transaction()?;
        let sequence = self.save_in(&mut txn, max_depth)?;
        txn.commit()?;
        Ok(sequence)
    }

    /// Persists the document as part of an enclosing transaction: prunes to
    /// `max_depth`, drops non-retained bodies, encodes, writes, and stamps
    /// the new sequence onto the revisions written in this save.
    pub fn save_in<T: StoreTransaction>(&mut self, txn: &mut T, max_depth: u32) -> Result<u64> {
        if !self.tree.changed() {
            return Ok(self.sequence);
        }
        if self.tree.is_empty() {
            // Everything was purged; remove the record entirely.
            txn.delete(&self.doc_id)?;
            self.flags = DocFlags::default();
            self.sequence = 0;
            return Ok(0);
        }

        let pruned = self.tree.prune(max_depth);
        if pruned > 0 {
            trace!(doc = %self.doc_id, pruned, "pruned revisions");
        }
        self.tree.remove_non_leaf_bodies();

        let mut flags = DocFlags::EXISTS;
        let current = self
            .tree
            .current()
            .expect("non-empty tree has a current revision");
        if self.tree.rev(current).is_deleted() {
            flags |= DocFlags::DELETED;
        }
        if self.tree.has_conflict() {
            flags |= DocFlags::CONFLICTED;
        }
        let attachments = (0..self.tree.len()).any(|i| {
            let rev = self.tree.rev(i as RevIndex);
            rev.is_leaf() && rev.has_attachments()
        });
        if attachments {
            flags |= DocFlags::HAS_ATTACHMENTS;
        }
        let rev_id = self.tree.rev(current).rev_id().clone();

        let raw = self.tree.encode()?;
        let sequence = txn.put(
            &self.doc_id,
            raw,
            RecordMeta {
                flags,
                rev_id: Some(rev_id),
            },
        )?;
        self.tree.saved(sequence);
        self.sequence = sequence;
        self.flags = flags;
        Ok(sequence)
    }
}

fn validate_doc_id(doc_id: &str) -> Result<()> {
    if doc_id.is_empty() || doc_id.len() > MAX_DOC_ID_LEN || doc_id.contains('\0') {
        return Err(Error::bad_doc_id(format!("invalid document id {doc_id:?}")));
    }
    Ok(())
}
