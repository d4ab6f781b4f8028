//! The content-addressed blob store.
//!
//! Blobs are files in a single directory, named by the URL-safe base-64 of
//! the SHA-1 of their contents. New blobs stream into a uniquely named temp
//! file and are installed with an atomic rename, so concurrent installs of
//! the same content are harmless. Keys always digest the plaintext; when
//! encryption is enabled, only the file contents are sealed.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use bytes::Bytes;
use rand::Rng;
use sha1::{Digest, Sha1};
use tracing::{debug, trace};

use madrona::{Error, ErrorCode, Result};

use crate::key::BlobKey;

const NONCE_LEN: usize = 12;

/// Transparent encryption applied to stored blob files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionAlgorithm {
    #[default]
    None,
    Aes256Gcm,
}

/// Store configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// Create the directory if it does not exist.
    pub create: bool,
    /// Opened read-only when false.
    pub writeable: bool,
    pub encryption_algorithm: EncryptionAlgorithm,
    pub encryption_key: Option<[u8; 32]>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            create: true,
            writeable: true,
            encryption_algorithm: EncryptionAlgorithm::None,
            encryption_key: None,
        }
    }
}

/// A directory of content-addressed blobs. Thread-safe; all state lives in
/// the filesystem.
#[derive(Debug)]
pub struct BlobStore {
    dir: PathBuf,
    options: Options,
}

impl BlobStore {
    pub fn open(dir: impl Into<PathBuf>, options: Options) -> Result<Self> {
        let dir = dir.into();
        if options.create {
            fs::create_dir_all(&dir)?;
        } else if !dir.is_dir() {
            return Err(Error::not_found(format!("no blob store at {}", dir.display())));
        }
        if options.encryption_algorithm != EncryptionAlgorithm::None
            && options.encryption_key.is_none()
        {
            return Err(Error::internal(
                ErrorCode::UnsupportedEncryption,
                "encryption enabled without a key",
            ));
        }
        Ok(BlobStore { dir, options })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn is_encrypted(&self) -> bool {
        self.options.encryption_algorithm != EncryptionAlgorithm::None
    }

    pub fn get(&self, key: BlobKey) -> Blob<'_> {
        Blob {
            path: self.dir.join(key.filename()),
            key,
            store: self,
        }
    }

    pub fn has(&self, key: BlobKey) -> bool {
        self.get(key).exists()
    }

    /// Stores a byte string, verifying it against `expected` when given.
    pub fn put(&self, data: impl AsRef<[u8]>, expected: Option<BlobKey>) -> Result<BlobKey> {
        let mut stream = self.write_stream()?;
        stream.write(data.as_ref())?;
        stream.install(expected)
    }

    /// Opens a stream for writing a new blob.
    pub fn write_stream(&self) -> Result<BlobWriteStream<'_>> {
        if !self.options.writeable {
            return Err(Error::storage("blob store is read-only"));
        }
        let temp_path = self
            .dir
            .join(format!("incoming-{:016x}.tmp", rand::thread_rng().gen::<u64>()));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;
        Ok(BlobWriteStream {
            store: self,
            temp_path,
            file: Some(file),
            sha: Sha1::new(),
            key: None,
            installed: false,
        })
    }

    pub fn count(&self) -> Result<u64> {
        Ok(self.keys()?.len() as u64)
    }

    pub fn total_size(&self) -> Result<u64> {
        let mut total = 0;
        for key in self.keys()? {
            total += fs::metadata(self.dir.join(key.filename()))?.len();
        }
        Ok(total)
    }

    /// Every valid blob key present in the directory.
    pub fn keys(&self) -> Result<Vec<BlobKey>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Ok(key) = BlobKey::from_filename(&name.to_string_lossy()) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// Garbage collection: deletes every blob whose key is not in `in_use`.
    /// Files that do not parse as blob keys are left alone. Returns the
    /// number of files deleted.
    pub fn delete_all_except(&self, in_use: &HashSet<BlobKey>) -> Result<usize> {
        let mut deleted = 0;
        for key in self.keys()? {
            if !in_use.contains(&key) {
                fs::remove_file(self.dir.join(key.filename()))?;
                deleted += 1;
            }
        }
        debug!(deleted, "collected unreferenced blobs");
        Ok(deleted)
    }

    /// Removes the store directory and everything in it.
    pub fn delete_store(self) -> Result<()> {
        fs::remove_dir_all(&self.dir)?;
        Ok(())
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = self.cipher()?;
        let nonce_bytes: [u8; NONCE_LEN] = rand::thread_rng().gen();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| Error::internal(ErrorCode::UnsupportedEncryption, "encryption failed"))?;
        let mut out = nonce_bytes.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open_contents(&self, path: &Path) -> Result<BlobReader> {
        if !self.is_encrypted() {
            return Ok(BlobReader::File(File::open(path)?));
        }
        let sealed = fs::read(path)?;
        if sealed.len() < NONCE_LEN {
            return Err(Error::corrupt_data("sealed blob too short"));
        }
        let cipher = self.cipher()?;
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::corrupt_data("blob decryption failed"))?;
        Ok(BlobReader::Mem(Cursor::new(plaintext)))
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        match (self.options.encryption_algorithm, &self.options.encryption_key) {
            (EncryptionAlgorithm::Aes256Gcm, Some(key)) => Ok(Aes256Gcm::new(key.into())),
            _ => Err(Error::internal(
                ErrorCode::UnsupportedEncryption,
                "store is not configured for encryption",
            )),
        }
    }
}

/// A handle to one (possibly absent) blob in a store.
#[derive(Debug)]
pub struct Blob<'a> {
    path: PathBuf,
    key: BlobKey,
    store: &'a BlobStore,
}

impl Blob<'_> {
    pub fn key(&self) -> BlobKey {
        self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// The stored file size. An overestimate of the content length when the
    /// store is encrypted, since sealing adds a nonce and a tag.
    pub fn content_length(&self) -> Result<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    /// Reads the full (decrypted) contents.
    pub fn contents(&self) -> Result<Bytes> {
        let mut reader = self.reader()?;
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        Ok(out.into())
    }

    /// Opens a reader over the (decrypted) contents.
    pub fn reader(&self) -> Result<BlobReader> {
        self.store.open_contents(&self.path)
    }

    pub fn delete(self) -> Result<()> {
        fs::remove_file(&self.path)?;
        Ok(())
    }
}

/// Streaming reader over blob contents.
#[derive(Debug)]
pub enum BlobReader {
    File(File),
    Mem(Cursor<Vec<u8>>),
}

impl Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            BlobReader::File(f) => f.read(buf),
            BlobReader::Mem(c) => c.read(buf),
        }
    }
}

/// A stream for writing a new blob.
///
/// Data accumulates in a temp file while an incremental SHA-1 runs over the
/// plaintext; [`Self::install`] derives the final name from the digest and
/// renames the file into place.
#[derive(Debug)]
pub struct BlobWriteStream<'a> {
    store: &'a BlobStore,
    temp_path: PathBuf,
    file: Option<File>,
    sha: Sha1,
    key: Option<BlobKey>,
    installed: bool,
}

impl<'a> BlobWriteStream<'a> {
    /// Appends bytes. No more writes are accepted once the key has been
    /// computed.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::storage("blob write stream already finalized"))?;
        file.write_all(data)?;
        self.sha.update(data);
        Ok(())
    }

    /// Finalizes the digest and returns the blob's key.
    pub fn compute_key(&mut self) -> Result<BlobKey> {
        if let Some(key) = self.key {
            return Ok(key);
        }
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        let key = BlobKey::from_bytes(self.sha.clone().finalize().into());
        self.key = Some(key);
        Ok(key)
    }

    /// Adds the blob to the store. If `expected` is given and does not match
    /// the computed key, the temp file is discarded and the install fails
    /// with `CorruptRevisionData`. Installing content that is already
    /// present succeeds trivially.
    pub fn install(mut self, expected: Option<BlobKey>) -> Result<BlobKey> {
        let key = self.compute_key()?;
        if let Some(expected) = expected {
            if expected != key {
                fs::remove_file(&self.temp_path)?;
                self.installed = true;
                return Err(Error::corrupt_data(format!(
                    "blob digest mismatch: expected {expected}, computed {key}"
                )));
            }
        }

        let dest = self.store.dir.join(key.filename());
        if dest.exists() {
            // Same key, same content.
            fs::remove_file(&self.temp_path)?;
            self.installed = true;
            trace!(%key, "blob already present");
            return Ok(key);
        }

        if self.store.is_encrypted() {
            let plaintext = fs::read(&self.temp_path)?;
            let sealed = self.store.seal(&plaintext)?;
            fs::write(&self.temp_path, sealed)?;
        }
        fs::rename(&self.temp_path, &dest)?;
        self.installed = true;
        trace!(%key, "installed blob");
        Ok(key)
    }
}

impl Drop for BlobWriteStream<'_> {
    fn drop(&mut self) {
        if !self.installed {
            self.file.take();
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &Path) -> BlobStore {
        BlobStore::open(dir, Options::default()).unwrap()
    }

    fn encrypted(dir: &Path) -> BlobStore {
        BlobStore::open(
            dir,
            Options {
                encryption_algorithm: EncryptionAlgorithm::Aes256Gcm,
                encryption_key: Some([7u8; 32]),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());

        let data: Vec<u8> = (0..100_000u32).map(|i| i as u8).collect();
        let mut stream = store.write_stream().unwrap();
        for chunk in data.chunks(8192) {
            stream.write(chunk).unwrap();
        }
        let key = stream.install(None).unwrap();
        assert_eq!(key, BlobKey::compute(&data));

        let blob = store.get(key);
        assert!(blob.exists());
        assert_eq!(blob.content_length().unwrap(), data.len() as u64);
        assert_eq!(blob.contents().unwrap().as_ref(), &data[..]);
    }

    #[test]
    fn install_checks_expected_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());

        let wrong = BlobKey::compute(b"something else");
        let mut stream = store.write_stream().unwrap();
        stream.write(b"actual data").unwrap();
        let err = stream.install(Some(wrong)).unwrap_err();
        assert_eq!(err.internal_code(), Some(ErrorCode::CorruptRevisionData));
        // The rejected temp file is gone.
        assert_eq!(store.count().unwrap(), 0);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);

        let right = BlobKey::compute(b"actual data");
        assert_eq!(store.put(b"actual data", Some(right)).unwrap(), right);
    }

    #[test]
    fn duplicate_install_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let a = store.put(b"same bytes", None).unwrap();
        let b = store.put(b"same bytes", None).unwrap();
        assert_eq!(a, b);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn abandoned_stream_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        {
            let mut stream = store.write_stream().unwrap();
            stream.write(b"never installed").unwrap();
        }
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn garbage_collection() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let keep = store.put(b"keep me", None).unwrap();
        let drop_me = store.put(b"drop me", None).unwrap();
        // A stray non-blob file is ignored.
        fs::write(dir.path().join("notes.txt"), b"hello").unwrap();

        let mut in_use = HashSet::new();
        in_use.insert(keep);
        assert_eq!(store.delete_all_except(&in_use).unwrap(), 1);

        assert!(store.get(keep).exists());
        assert!(!store.get(drop_me).exists());
        assert!(dir.path().join("notes.txt").is_file());
    }

    #[test]
    fn encrypted_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = encrypted(dir.path());

        let data = b"secret attachment bytes".to_vec();
        let key = store.put(&data, None).unwrap();
        // The key digests the plaintext.
        assert_eq!(key, BlobKey::compute(&data));

        let blob = store.get(key);
        assert_eq!(blob.contents().unwrap().as_ref(), &data[..]);
        // Sealing pads the file, so the length is an overestimate.
        assert!(blob.content_length().unwrap() > data.len() as u64);

        // The raw file on disk is not the plaintext.
        let raw = fs::read(blob.path()).unwrap();
        assert_ne!(raw, data);

        // A store without the key cannot read it back.
        let plain = open(dir.path());
        assert!(plain.get(key).exists());
        assert_ne!(plain.get(key).contents().unwrap().as_ref(), &data[..]);
    }

    #[test]
    fn encryption_requires_a_key() {
        let dir = tempfile::tempdir().unwrap();
        let err = BlobStore::open(
            dir.path(),
            Options {
                encryption_algorithm: EncryptionAlgorithm::Aes256Gcm,
                encryption_key: None,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.internal_code(), Some(ErrorCode::UnsupportedEncryption));
    }

    #[test]
    fn read_only_store_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        open(dir.path()).put(b"seed", None).unwrap();

        let store = BlobStore::open(
            dir.path(),
            Options {
                create: false,
                writeable: false,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(store.write_stream().is_err());
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn total_size_sums_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        store.put(b"12345", None).unwrap();
        store.put(b"123", None).unwrap();
        assert_eq!(store.total_size().unwrap(), 8);
    }
}
