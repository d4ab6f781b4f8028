//! Revision identifiers.
//!
//! A revision id is an ASCII byte string of the form `<generation>-<digest>`
//! in revision-tree mode, or `<generation>@<peer>` in version-vector mode.
//! The generation is a positive decimal integer; the digest is an opaque
//! token. Ids are compared by `(generation, digest)` so that `10-x` sorts
//! after `9-x`.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

/// Longest revision id accepted, constrained by the on-disk format.
pub const MAX_REV_ID_LEN: usize = 255;

/// An owned revision identifier.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RevId(Vec<u8>);

impl RevId {
    /// Parses and validates an id. The generation must be a non-zero decimal
    /// number and the digest part must be non-empty.
    pub fn parse(bytes: impl AsRef<[u8]>) -> Result<Self> {
        let bytes = bytes.as_ref();
        let id = RevId(bytes.to_vec());
        if bytes.len() > MAX_REV_ID_LEN || id.generation() == 0 {
            return Err(Error::bad_revision_id(format!(
                "invalid revision id {:?}",
                String::from_utf8_lossy(bytes)
            )));
        }
        Ok(id)
    }

    /// The generation prefix, or 0 if the id is malformed.
    pub fn generation(&self) -> u32 {
        let sep = match self.separator_index() {
            Some(i) if i > 0 => i,
            _ => return 0,
        };
        let digits = &self.0[..sep];
        if digits.len() > 9 || !digits.iter().all(|b| b.is_ascii_digit()) {
            return 0;
        }
        std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    /// The digest (or peer id) following the separator.
    pub fn digest(&self) -> &[u8] {
        match self.separator_index() {
            Some(i) => &self.0[i + 1..],
            None => &[],
        }
    }

    /// True for `<gen>@<peer>` style ids.
    pub fn is_version(&self) -> bool {
        self.separator_index()
            .map(|i| self.0[i] == b'@')
            .unwrap_or(false)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Constructors only accept ASCII ids.
        std::str::from_utf8(&self.0).unwrap_or("")
    }

    fn separator_index(&self) -> Option<usize> {
        self.0.iter().position(|b| *b == b'-' || *b == b'@')
    }

    /// Compact binary form stored in the raw tree: unsigned LEB128 generation
    /// followed by the digest bytes.
    pub fn to_compact(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len());
        let mut gen = self.generation();
        loop {
            let byte = (gen & 0x7f) as u8;
            gen >>= 7;
            if gen == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
        out.extend_from_slice(self.digest());
        out
    }

    /// Decodes [`Self::to_compact`] output back into the expanded form.
    pub fn from_compact(bytes: &[u8]) -> Result<Self> {
        let mut gen: u32 = 0;
        let mut shift = 0;
        let mut i = 0;
        loop {
            let byte = *bytes
                .get(i)
                .ok_or_else(|| Error::bad_revision_id("truncated compact revision id"))?;
            gen |= ((byte & 0x7f) as u32) << shift;
            i += 1;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift > 28 {
                return Err(Error::bad_revision_id("compact generation overflow"));
            }
        }
        let digest = &bytes[i..];
        let mut expanded = gen.to_string().into_bytes();
        expanded.push(b'-');
        expanded.extend_from_slice(digest);
        RevId::parse(expanded)
    }

    /// Derives the id of a new revision from its parent, its tombstone flag
    /// and its body: generation is the parent's plus one, the digest is the
    /// hex SHA-1 of the length-prefixed parent id, a deletion byte and the
    /// body bytes.
    pub fn for_put(parent: Option<&RevId>, deleted: bool, body: &[u8]) -> RevId {
        let generation = parent.map(|p| p.generation()).unwrap_or(0) + 1;
        Self::derive(generation, parent, deleted, body)
    }

    /// Derives the id of a merged revision created by conflict resolution.
    /// The digest is computed from the winning revision exactly as in
    /// [`Self::for_put`]; the generation tops both branches.
    pub fn for_merge(winner: &RevId, loser: &RevId, merged_body: &[u8]) -> RevId {
        let generation = winner.generation().max(loser.generation()) + 1;
        Self::derive(generation, Some(winner), false, merged_body)
    }

    fn derive(generation: u32, parent: Option<&RevId>, deleted: bool, body: &[u8]) -> RevId {
        let mut sha = Sha1::new();
        match parent {
            Some(p) => {
                sha.update([p.as_bytes().len() as u8]);
                sha.update(p.as_bytes());
            }
            None => sha.update([0u8]),
        }
        sha.update([deleted as u8]);
        sha.update(body);
        let digest = sha.finalize();
        let mut bytes = generation.to_string().into_bytes();
        bytes.push(b'-');
        bytes.extend_from_slice(hex::encode(digest).as_bytes());
        RevId(bytes)
    }

    fn sort_key(&self) -> (u32, &[u8], u8) {
        let sep = self
            .separator_index()
            .map(|i| self.0[i])
            .unwrap_or(b'-');
        (self.generation(), self.digest(), sep)
    }
}

impl Ord for RevId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for RevId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RevId({self})")
    }
}

impl FromStr for RevId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        RevId::parse(s.as_bytes())
    }
}

impl Serialize for RevId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(self.as_str())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for RevId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(de::Error::custom)
        } else {
            let bytes = Vec::<u8>::deserialize(deserializer)?;
            RevId::parse(bytes).map_err(de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_parsing() {
        assert_eq!("1-abc".parse::<RevId>().unwrap().generation(), 1);
        assert_eq!("123-f00".parse::<RevId>().unwrap().generation(), 123);
        assert_eq!("7@alice".parse::<RevId>().unwrap().generation(), 7);
        assert!("0-abc".parse::<RevId>().is_err());
        assert!("-abc".parse::<RevId>().is_err());
        assert!("12".parse::<RevId>().is_err());
        assert!("x-abc".parse::<RevId>().is_err());
        assert!("1234567890-a".parse::<RevId>().is_err());
    }

    #[test]
    fn version_style() {
        let id: RevId = "3@deadbeef".parse().unwrap();
        assert!(id.is_version());
        assert_eq!(id.digest(), b"deadbeef");
        assert!(!"3-deadbeef".parse::<RevId>().unwrap().is_version());
    }

    #[test]
    fn ordering_by_generation() {
        let a: RevId = "9-zzz".parse().unwrap();
        let b: RevId = "10-aaa".parse().unwrap();
        assert!(a < b);
        let c: RevId = "2-abc".parse().unwrap();
        let d: RevId = "2-abd".parse().unwrap();
        assert!(c < d);
    }

    #[test]
    fn compact_round_trip() {
        for text in ["1-abc", "200-deadbeef", "999999-x"] {
            let id: RevId = text.parse().unwrap();
            let compact = id.to_compact();
            let back = RevId::from_compact(&compact).unwrap();
            assert_eq!(back, id, "{text}");
        }
    }

    // Digest fixtures from the conflict-resolution behavior of the wire
    // protocol's reference peer.
    #[test]
    fn derived_merge_ids() {
        let winner: RevId = "4-dddd".parse().unwrap();
        let loser: RevId = "3-aaaaaa".parse().unwrap();
        let body = br#"{"merged":true}"#;
        let merged = RevId::for_merge(&winner, &loser, body);
        assert_eq!(
            merged.as_str(),
            "5-940fe7e020dbf8db0f82a5d764870c4b6c88ae99"
        );

        let put = RevId::for_put(Some(&loser), false, body);
        assert_eq!(put.as_str(), "4-333ee0677b5f1e1e5064b050d417a31d2455dc30");
    }

    #[test]
    fn derived_ids_are_valid_children() {
        let parent: RevId = "1-abc".parse().unwrap();
        let child = RevId::for_put(Some(&parent), true, b"{}");
        assert_eq!(child.generation(), 2);
        let root = RevId::for_put(None, false, b"{}");
        assert_eq!(root.generation(), 1);
    }
}
