//! The on-disk form of a revision tree.
//!
//! A tree serializes to a concatenation of variable-length records, one per
//! revision, in display order. Each record is a fixed header followed by the
//! compact revision id and the body:
//!
//! ```text
//! flags      u8      persisted flag bits
//! revid_len  u8      length of the compact revision id
//! parent     u16 le  display-order index of the parent, 0xffff = none
//! sequence   u64 le  storage sequence (0 = assigned by the enclosing save)
//! body_len   u32 le
//! revid      [u8]
//! body       [u8]
//! ```
//!
//! Because records appear in display order and parents are display-order
//! indices, decoding reproduces the exact order the tree was sorted into
//! when it was encoded.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::revid::RevId;

use super::{Rev, RevFlags, RevIndex, RevTree};

const NO_PARENT: u16 = u16::MAX;
const HEADER_LEN: usize = 1 + 1 + 2 + 8 + 4;

pub(super) fn encode_tree(tree: &RevTree) -> Result<Bytes> {
    debug_assert!(tree.sorted);
    let mut position = vec![0u16; tree.revs.len()];
    for (pos, &arena) in tree.order.iter().enumerate() {
        position[arena as usize] = pos as u16;
    }

    let mut out = BytesMut::new();
    for &arena in &tree.order {
        let rev = &tree.revs[arena as usize];
        let revid = rev.rev_id.to_compact();
        if revid.len() > u8::MAX as usize {
            return Err(Error::bad_revision_id("revision id too long to encode"));
        }
        let body = rev.body.as_deref().unwrap_or(&[]);
        out.put_u8((rev.flags & RevFlags::PERSISTED).bits());
        out.put_u8(revid.len() as u8);
        out.put_u16_le(match rev.parent {
            Some(p) => position[p as usize],
            None => NO_PARENT,
        });
        out.put_u64_le(rev.sequence);
        out.put_u32_le(body.len() as u32);
        out.put_slice(&revid);
        out.put_slice(body);
    }
    Ok(out.freeze())
}

pub(super) fn decode_tree(mut data: &[u8], record_sequence: u64) -> Result<RevTree> {
    let mut revs: Vec<Rev> = Vec::new();
    while !data.is_empty() {
        if data.remaining() < HEADER_LEN {
            return Err(Error::corrupt_revision_data("truncated revision record"));
        }
        let flags = RevFlags::from_bits(data.get_u8());
        let revid_len = data.get_u8() as usize;
        let parent = data.get_u16_le();
        let mut sequence = data.get_u64_le();
        let body_len = data.get_u32_le() as usize;
        if data.remaining() < revid_len + body_len {
            return Err(Error::corrupt_revision_data("truncated revision record"));
        }
        let rev_id = RevId::from_compact(&data[..revid_len])
            .map_err(|err| Error::corrupt_revision_data(err))?;
        data.advance(revid_len);
        let body = if body_len > 0 {
            Some(Bytes::copy_from_slice(&data[..body_len]))
        } else {
            None
        };
        data.advance(body_len);
        if sequence == 0 {
            sequence = record_sequence;
        }
        revs.push(Rev {
            rev_id,
            body,
            sequence,
            flags,
            parent: (parent != NO_PARENT).then_some(parent),
        });
    }

    // Validate parent linkage: in range and acyclic.
    let count = revs.len();
    for start in 0..count {
        let mut steps = 0;
        let mut cur = Some(start as RevIndex);
        while let Some(i) = cur {
            if i as usize >= count {
                return Err(Error::corrupt_revision_data("revision parent out of range"));
            }
            steps += 1;
            if steps > count {
                return Err(Error::corrupt_revision_data("revision parent cycle"));
            }
            cur = revs[i as usize].parent;
        }
    }

    let order = (0..count as u16).collect();
    Ok(RevTree {
        revs,
        order,
        changed: false,
        sorted: true,
    })
}

#[cfg(test)]
mod tests {
    use super::super::tests_support::sample_tree;
    use super::*;

    #[test]
    fn round_trip_preserves_order_and_linkage() {
        let mut tree = sample_tree();
        tree.saved(4);
        let encoded = tree.encode().unwrap();
        let mut decoded = RevTree::decode(&encoded, 4).unwrap();

        assert_eq!(decoded.len(), tree.len());
        let expected: Vec<_> = tree
            .in_order()
            .to_vec()
            .into_iter()
            .map(|i| tree.rev(i).rev_id().clone())
            .collect();
        let actual: Vec<_> = decoded
            .in_order()
            .to_vec()
            .into_iter()
            .map(|i| decoded.rev(i).rev_id().clone())
            .collect();
        assert_eq!(actual, expected);

        for id in &expected {
            let a = tree.get(id).unwrap();
            let b = decoded.get(id).unwrap();
            let parent_a = tree.rev(a).parent().map(|p| tree.rev(p).rev_id().clone());
            let parent_b = decoded
                .rev(b)
                .parent()
                .map(|p| decoded.rev(p).rev_id().clone());
            assert_eq!(parent_a, parent_b, "parent of {id}");
            assert_eq!(tree.rev(a).sequence(), decoded.rev(b).sequence());
            assert_eq!(
                (tree.rev(a).flags() & RevFlags::PERSISTED).bits(),
                decoded.rev(b).flags().bits()
            );
            assert_eq!(tree.rev(a).body(), decoded.rev(b).body());
        }
        assert!(!decoded.changed());
    }

    #[test]
    fn decode_stamps_pending_sequences() {
        let mut tree = sample_tree();
        // Not saved: every sequence is still 0 in the encoded form.
        let encoded = tree.encode().unwrap();
        let decoded = RevTree::decode(&encoded, 9).unwrap();
        for i in 0..decoded.len() {
            assert_eq!(decoded.rev(i as RevIndex).sequence(), 9);
        }
    }

    #[test]
    fn truncated_input_is_corrupt() {
        let mut tree = sample_tree();
        let encoded = tree.encode().unwrap();
        for cut in [1, HEADER_LEN - 1, encoded.len() - 1] {
            let err = RevTree::decode(&encoded[..cut], 0).unwrap_err();
            assert_eq!(
                err.internal_code(),
                Some(crate::error::ErrorCode::CorruptRevisionData),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn bogus_parent_is_corrupt() {
        let mut data = BytesMut::new();
        let revid = "1-aa".parse::<RevId>().unwrap().to_compact();
        data.put_u8(RevFlags::LEAF.bits());
        data.put_u8(revid.len() as u8);
        data.put_u16_le(7); // points past the single record
        data.put_u64_le(1);
        data.put_u32_le(0);
        data.put_slice(&revid);
        assert!(RevTree::decode(&data, 0).is_err());
    }

    #[test]
    fn empty_input_decodes_to_empty_tree() {
        let tree = RevTree::decode(&[], 0).unwrap();
        assert!(tree.is_empty());
    }
}
