//! The SHA-1 content key identifying a blob.

use std::fmt;
use std::str::FromStr;

use data_encoding::{BASE64, BASE64URL_NOPAD};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

use madrona::Error;

/// Prefix of the digest-string form.
pub const DIGEST_PREFIX: &str = "sha1-";
/// Extension of blob files on disk.
pub const FILE_SUFFIX: &str = ".blob";

/// A raw SHA-1 digest used as the unique identifier of a blob.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlobKey([u8; 20]);

impl BlobKey {
    /// Computes the key of a byte string.
    pub fn compute(data: impl AsRef<[u8]>) -> Self {
        let digest = Sha1::digest(data.as_ref());
        BlobKey(digest.into())
    }

    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        BlobKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The `sha1-` prefixed base-64 digest string.
    pub fn digest_string(&self) -> String {
        format!("{DIGEST_PREFIX}{}", BASE64.encode(&self.0))
    }

    /// The name of the file holding this blob: URL-safe base-64 plus the
    /// `.blob` suffix.
    pub fn filename(&self) -> String {
        format!("{}{FILE_SUFFIX}", BASE64URL_NOPAD.encode(&self.0))
    }

    /// Parses a digest string, with or without the `sha1-` prefix.
    pub fn from_digest_string(s: &str) -> Result<Self, Error> {
        let body = s.strip_prefix(DIGEST_PREFIX).unwrap_or(s);
        let bytes = BASE64
            .decode(body.as_bytes())
            .map_err(|_| Error::corrupt_data(format!("invalid blob digest {s:?}")))?;
        bytes
            .try_into()
            .map(BlobKey)
            .map_err(|_| Error::corrupt_data(format!("invalid blob digest length in {s:?}")))
    }

    /// Parses a blob filename produced by [`Self::filename`].
    pub fn from_filename(name: &str) -> Result<Self, Error> {
        let stem = name
            .strip_suffix(FILE_SUFFIX)
            .ok_or_else(|| Error::corrupt_data(format!("not a blob filename: {name:?}")))?;
        let bytes = BASE64URL_NOPAD
            .decode(stem.as_bytes())
            .map_err(|_| Error::corrupt_data(format!("not a blob filename: {name:?}")))?;
        bytes
            .try_into()
            .map(BlobKey)
            .map_err(|_| Error::corrupt_data(format!("bad key length in filename {name:?}")))
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.digest_string())
    }
}

impl fmt::Debug for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobKey({})", self.to_hex())
    }
}

impl FromStr for BlobKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        BlobKey::from_digest_string(s)
    }
}

impl Serialize for BlobKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.digest_string())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for BlobKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(de::Error::custom)
        } else {
            let bytes = Vec::<u8>::deserialize(deserializer)?;
            bytes
                .try_into()
                .map(BlobKey)
                .map_err(|_| de::Error::custom("expected 20 bytes"))
        }
    }
}
