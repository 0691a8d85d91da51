//! Content-addressed attachment storage.
//!
//! Blobs are stored as individual files under the database's `Attachments/`
//! directory, named by the SHA-1 digest of their contents:
//! `<hex[0..2]>/<hex[2..40]>`. Writes stream into a temp file under
//! `pending/` and are moved into place with an atomic rename, either
//! immediately or when the enclosing transaction commits.
//!
//! When the store is opened with an encryption key, each file is wrapped in
//! an authenticated container: an 8-byte magic, a random 12-byte nonce, and
//! the AES-256-GCM ciphertext (which carries its own 16-byte tag). The blob
//! key is always the digest of the plaintext.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use bytes::Bytes;
use data_encoding::BASE64;
use parking_lot::RwLock;
use rand::RngCore;
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::error::{Error, Result};

const PENDING_DIR: &str = "pending";
const CONTAINER_MAGIC: &[u8; 8] = b"quillenc";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// SHA-1 digest identifying a blob by its plaintext contents.
///
/// The canonical text form is `sha1-<base64>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobKey([u8; 20]);

impl BlobKey {
    /// Digest `data` into a key.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        BlobKey(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        BlobKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Lowercase hex form used for file names.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha1-{}", BASE64.encode(&self.0))
    }
}

impl fmt::Debug for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobKey({self})")
    }
}

impl FromStr for BlobKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let b64 = s
            .strip_prefix("sha1-")
            .ok_or_else(|| Error::invalid_parameter(format!("not a blob key: {s:?}")))?;
        let bytes = BASE64
            .decode(b64.as_bytes())
            .map_err(|_| Error::invalid_parameter(format!("bad base64 in blob key: {s:?}")))?;
        let bytes: [u8; 20] = bytes
            .try_into()
            .map_err(|_| Error::invalid_parameter("blob key digest must be 20 bytes"))?;
        Ok(BlobKey(bytes))
    }
}

/// 256-bit key wrapping blob files in an encrypted container.
#[derive(Clone)]
pub struct EncryptionKey(pub [u8; 32]);

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Content-addressed blob store rooted at a directory.
///
/// The encryption key is shared across clones so a rotation is seen by
/// every handle.
#[derive(Debug, Clone)]
pub struct BlobStore {
    dir: PathBuf,
    key: Arc<RwLock<Option<EncryptionKey>>>,
}

impl BlobStore {
    /// Open (creating if needed) a blob store at `dir`.
    ///
    /// Leftover temp files from a previous run are removed.
    pub fn open(dir: impl AsRef<Path>, key: Option<EncryptionKey>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join(PENDING_DIR))?;
        for entry in fs::read_dir(dir.join(PENDING_DIR))? {
            let entry = entry?;
            let _ = fs::remove_file(entry.path());
        }
        Ok(BlobStore {
            dir,
            key: Arc::new(RwLock::new(key)),
        })
    }

    /// Path a blob with this key is (or would be) stored at.
    pub fn file_path(&self, key: &BlobKey) -> PathBuf {
        let hex = key.to_hex();
        self.dir.join(&hex[..2]).join(&hex[2..])
    }

    pub fn has(&self, key: &BlobKey) -> bool {
        self.file_path(key).is_file()
    }

    /// Plaintext size of the stored blob.
    pub fn get_size(&self, key: &BlobKey) -> Result<u64> {
        let meta = fs::metadata(self.file_path(key)).map_err(not_found)?;
        let len = meta.len();
        if self.key.read().is_some() {
            let overhead = (CONTAINER_MAGIC.len() + NONCE_LEN + TAG_LEN) as u64;
            if len < overhead {
                return Err(Error::corrupt("blob container shorter than its header"));
            }
            Ok(len - overhead)
        } else {
            Ok(len)
        }
    }

    /// Read the entire blob into memory.
    pub fn get_contents(&self, key: &BlobKey) -> Result<Bytes> {
        let raw = fs::read(self.file_path(key)).map_err(not_found)?;
        match &*self.key.read() {
            None => Ok(raw.into()),
            Some(enc) => decrypt_container(enc, &raw).map(Bytes::from),
        }
    }

    /// Open a random-access reader over the blob's plaintext.
    pub fn open_read_stream(&self, key: &BlobKey) -> Result<BlobReadStream> {
        if self.key.read().is_some() {
            // The container format is not seekable; decrypt up front.
            let contents = self.get_contents(key)?;
            let len = contents.len() as u64;
            Ok(BlobReadStream {
                inner: ReadInner::Buffered { data: contents },
                pos: 0,
                len,
            })
        } else {
            let file = File::open(self.file_path(key)).map_err(not_found)?;
            let len = file.metadata()?.len();
            Ok(BlobReadStream {
                inner: ReadInner::Plain { file },
                pos: 0,
                len,
            })
        }
    }

    /// Store `data` in one step, verifying `expected` if given.
    pub fn put(&self, data: &[u8], expected: Option<&BlobKey>) -> Result<BlobKey> {
        let mut stream = self.open_write_stream()?;
        stream.write_all(data)?;
        let pending = stream.finish()?;
        self.install(pending, expected)
    }

    /// Open a streaming writer. The data is not visible until the returned
    /// [`PendingBlob`] is passed to [`BlobStore::install`].
    pub fn open_write_stream(&self) -> Result<BlobWriteStream> {
        let name = format!("{}.blob", random_hex());
        let path = self.dir.join(PENDING_DIR).join(name);
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        Ok(BlobWriteStream {
            file: Some(file),
            path,
            hasher: Sha1::new(),
            len: 0,
        })
    }

    /// Move a finished write into the content-addressed tree.
    ///
    /// Fails with `Corrupt` (and discards the temp file) if `expected` does
    /// not match the digest of the written data.
    pub fn install(&self, pending: PendingBlob, expected: Option<&BlobKey>) -> Result<BlobKey> {
        let key = pending.key;
        if let Some(expected) = expected {
            if *expected != key {
                let _ = fs::remove_file(&pending.path);
                return Err(Error::corrupt(format!(
                    "blob digest mismatch: expected {expected}, got {key}"
                )));
            }
        }
        let dest = self.file_path(&key);
        if dest.is_file() {
            // Already stored; dedup by dropping the new copy.
            let _ = fs::remove_file(&pending.path);
            return Ok(key);
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        match &*self.key.read() {
            None => fs::rename(&pending.path, &dest)?,
            Some(enc) => {
                let plaintext = fs::read(&pending.path)?;
                let container = encrypt_container(enc, &plaintext)?;
                // Write next to the destination, then rename, so a partial
                // write never masquerades as a complete blob.
                let tmp = dest.with_extension("tmp");
                fs::write(&tmp, container)?;
                fs::rename(&tmp, &dest)?;
                let _ = fs::remove_file(&pending.path);
            }
        }
        debug!(blob = %key, len = pending.len, "installed blob");
        Ok(key)
    }

    /// Discard a finished write without installing it.
    pub fn discard(&self, pending: PendingBlob) {
        let _ = fs::remove_file(&pending.path);
    }

    pub fn delete(&self, key: &BlobKey) -> Result<()> {
        fs::remove_file(self.file_path(key)).map_err(not_found)?;
        Ok(())
    }

    /// Rewrite every stored blob under `new_key`, or strip the container
    /// when `new_key` is `None`.
    ///
    /// Other blob operations block for the duration. Each file is
    /// rewritten via a temp-and-rename, so a crash mid-rotation leaves
    /// every blob readable under exactly one of the two keys.
    pub fn rekey(&self, new_key: Option<EncryptionKey>) -> Result<()> {
        let mut key = self.key.write();
        for blob in self.all_keys()? {
            let path = self.file_path(&blob);
            let raw = fs::read(&path)?;
            let plaintext = match &*key {
                None => raw,
                Some(old) => decrypt_container(old, &raw)?,
            };
            let rewritten = match &new_key {
                None => plaintext,
                Some(new) => encrypt_container(new, &plaintext)?,
            };
            let tmp = path.with_extension("rekey");
            fs::write(&tmp, rewritten)?;
            fs::rename(&tmp, &path)?;
        }
        *key = new_key;
        debug!("blob store rekeyed");
        Ok(())
    }

    /// Remove the whole store directory.
    pub fn delete_store(self) -> Result<()> {
        fs::remove_dir_all(&self.dir)?;
        Ok(())
    }

    /// Every key currently present, for the compaction orphan sweep.
    pub fn all_keys(&self) -> Result<Vec<BlobKey>> {
        let mut keys = Vec::new();
        for prefix in fs::read_dir(&self.dir)? {
            let prefix = prefix?;
            if !prefix.file_type()?.is_dir() {
                continue;
            }
            let prefix_name = prefix.file_name();
            let prefix_name = prefix_name.to_string_lossy();
            if prefix_name.len() != 2 {
                continue;
            }
            for entry in fs::read_dir(prefix.path())? {
                let entry = entry?;
                let rest = entry.file_name();
                let hex_name = format!("{}{}", prefix_name, rest.to_string_lossy());
                if let Ok(raw) = hex::decode(&hex_name) {
                    if let Ok(bytes) = <[u8; 20]>::try_from(raw.as_slice()) {
                        keys.push(BlobKey::from_bytes(bytes));
                    }
                }
            }
        }
        Ok(keys)
    }
}

fn not_found(err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound
    } else {
        err.into()
    }
}

fn random_hex() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn encrypt_container(key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|_| Error::invalid_parameter("encryption key must be 32 bytes"))?;
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| Error::corrupt("blob encryption failed"))?;
    let mut out = Vec::with_capacity(CONTAINER_MAGIC.len() + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(CONTAINER_MAGIC);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt_container(key: &EncryptionKey, raw: &[u8]) -> Result<Vec<u8>> {
    if raw.len() < CONTAINER_MAGIC.len() + NONCE_LEN + TAG_LEN
        || &raw[..CONTAINER_MAGIC.len()] != CONTAINER_MAGIC
    {
        return Err(Error::corrupt("not an encrypted blob container"));
    }
    let nonce = &raw[CONTAINER_MAGIC.len()..CONTAINER_MAGIC.len() + NONCE_LEN];
    let ciphertext = &raw[CONTAINER_MAGIC.len() + NONCE_LEN..];
    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|_| Error::invalid_parameter("encryption key must be 32 bytes"))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::corrupt("blob container failed authentication"))
}

/// In-flight streaming write. Data lands in a pending temp file.
#[derive(Debug)]
pub struct BlobWriteStream {
    file: Option<File>,
    path: PathBuf,
    hasher: Sha1,
    len: u64,
}

impl BlobWriteStream {
    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let file = self.file.as_mut().ok_or(Error::NotInTransaction)?;
        file.write_all(data)?;
        self.hasher.update(data);
        self.len += data.len() as u64;
        Ok(())
    }

    /// Digest of the bytes written so far.
    pub fn compute_key(&self) -> BlobKey {
        BlobKey(self.hasher.clone().finalize().into())
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Flush and close, producing a handle that can be installed or
    /// discarded.
    pub fn finish(mut self) -> Result<PendingBlob> {
        let mut file = self.file.take().ok_or(Error::NotInTransaction)?;
        file.sync_all()?;
        drop(file);
        Ok(PendingBlob {
            key: BlobKey(self.hasher.clone().finalize().into()),
            path: std::mem::take(&mut self.path),
            len: self.len,
        })
    }
}

impl Drop for BlobWriteStream {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// A fully written, not-yet-installed blob.
#[derive(Debug)]
pub struct PendingBlob {
    pub key: BlobKey,
    path: PathBuf,
    len: u64,
}

impl PendingBlob {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Random-access reader over a blob's plaintext.
#[derive(Debug)]
pub struct BlobReadStream {
    inner: ReadInner,
    pos: u64,
    len: u64,
}

#[derive(Debug)]
enum ReadInner {
    Plain { file: File },
    Buffered { data: Bytes },
}

impl BlobReadStream {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn seek(&mut self, pos: u64) -> Result<()> {
        if pos > self.len {
            return Err(Error::invalid_parameter("seek past end of blob"));
        }
        if let ReadInner::Plain { file } = &mut self.inner {
            use std::io::Seek;
            file.seek(std::io::SeekFrom::Start(pos))?;
        }
        self.pos = pos;
        Ok(())
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match &mut self.inner {
            ReadInner::Plain { file } => file.read(buf)?,
            ReadInner::Buffered { data } => {
                let start = self.pos as usize;
                let end = (start + buf.len()).min(data.len());
                let n = end.saturating_sub(start);
                buf[..n].copy_from_slice(&data[start..end]);
                n
            }
        };
        self.pos += n as u64;
        Ok(n)
    }
}
