use crate::crypto::{self, CryptoError, EncryptionKey, NONCE_LEN, SALT_LEN, TAG_LEN};
use crate::error::{Error, Result};
use crate::fsio;
use crate::keys::{KeyChain, ResolvedKey};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempPath;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

pub const BLOB_MAGIC: &[u8; 8] = b"NWVAULT\0";
pub const BLOB_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 60;
pub const SEALED_EXTENSION: &str = "enc";

/// Upper bound accepted when parsing; keeps a corrupted header from pinning
/// the CPU in the KDF before authentication gets a chance to fail.
pub const MAX_KDF_ITERATIONS: u32 = 10_000_000;

const KDF_RAW: u8 = 0;
const KDF_PBKDF2_SHA512: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KdfParams {
    /// The master key came straight from a key file.
    RawKey,
    Pbkdf2Sha512 { iterations: u32 },
}

impl KdfParams {
    fn id(&self) -> u8 {
        match self {
            KdfParams::RawKey => KDF_RAW,
            KdfParams::Pbkdf2Sha512 { .. } => KDF_PBKDF2_SHA512,
        }
    }

    fn iterations(&self) -> u32 {
        match self {
            KdfParams::RawKey => 0,
            KdfParams::Pbkdf2Sha512 { iterations } => *iterations,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub kdf: KdfParams,
    pub salt: [u8; SALT_LEN],
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

impl EncryptedBlob {
    pub fn header_bytes(&self) -> [u8; HEADER_SIZE] {
        header_bytes(self.kdf, &self.salt, &self.nonce)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.ciphertext.len() + TAG_LEN);
        buf.extend_from_slice(&self.header_bytes());
        buf.extend_from_slice(&self.ciphertext);
        buf.extend_from_slice(&self.tag);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, CryptoError> {
        if buf.len() < HEADER_SIZE + TAG_LEN {
            return Err(CryptoError::Malformed("blob too short"));
        }
        if &buf[..8] != BLOB_MAGIC {
            return Err(CryptoError::Malformed("bad magic"));
        }
        let version = read_u32(&buf[8..12])?;
        if version != BLOB_VERSION {
            return Err(CryptoError::Malformed("unsupported format version"));
        }
        if buf[13..16] != [0u8; 3] {
            return Err(CryptoError::Malformed("reserved bytes set"));
        }
        let iterations = read_u32(&buf[16..20])?;
        let kdf = match (buf[12], iterations) {
            (KDF_RAW, 0) => KdfParams::RawKey,
            (KDF_RAW, _) => return Err(CryptoError::Malformed("raw key with kdf iterations")),
            (KDF_PBKDF2_SHA512, n) if n > MAX_KDF_ITERATIONS => {
                return Err(CryptoError::Malformed("kdf iterations out of range"))
            }
            (KDF_PBKDF2_SHA512, n) => KdfParams::Pbkdf2Sha512 { iterations: n },
            _ => return Err(CryptoError::Malformed("unknown kdf")),
        };
        let salt: [u8; SALT_LEN] = buf[20..36]
            .try_into()
            .map_err(|_| CryptoError::Malformed("salt"))?;
        let nonce: [u8; NONCE_LEN] = buf[36..60]
            .try_into()
            .map_err(|_| CryptoError::Malformed("nonce"))?;
        let tag_start = buf.len() - TAG_LEN;
        let tag: [u8; TAG_LEN] = buf[tag_start..]
            .try_into()
            .map_err(|_| CryptoError::Malformed("tag"))?;
        Ok(Self {
            kdf,
            salt,
            nonce,
            ciphertext: buf[HEADER_SIZE..tag_start].to_vec(),
            tag,
        })
    }
}

fn header_bytes(
    kdf: KdfParams,
    salt: &[u8; SALT_LEN],
    nonce: &[u8; NONCE_LEN],
) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    buf[..8].copy_from_slice(BLOB_MAGIC);
    buf[8..12].copy_from_slice(&BLOB_VERSION.to_le_bytes());
    buf[12] = kdf.id();
    // 13..16 reserved, zero
    buf[16..20].copy_from_slice(&kdf.iterations().to_le_bytes());
    buf[20..36].copy_from_slice(salt);
    buf[36..60].copy_from_slice(nonce);
    buf
}

fn read_u32(bytes: &[u8]) -> Result<u32, CryptoError> {
    let arr: [u8; 4] = bytes
        .try_into()
        .map_err(|_| CryptoError::Malformed("truncated field"))?;
    Ok(u32::from_le_bytes(arr))
}

fn seal_with(
    master: &EncryptionKey,
    kdf: KdfParams,
    salt: [u8; SALT_LEN],
    plaintext: &[u8],
) -> Result<EncryptedBlob, CryptoError> {
    let nonce = crypto::generate_nonce();
    let header = header_bytes(kdf, &salt, &nonce);
    let key = crypto::aead_key(master, &salt)?;
    let mut sealed = crypto::encrypt(&key, &nonce, plaintext, &header)?;
    let tag_start = sealed
        .len()
        .checked_sub(TAG_LEN)
        .ok_or(CryptoError::Encrypt)?;
    let tag: [u8; TAG_LEN] = sealed[tag_start..]
        .try_into()
        .map_err(|_| CryptoError::Encrypt)?;
    sealed.truncate(tag_start);
    Ok(EncryptedBlob {
        kdf,
        salt,
        nonce,
        ciphertext: sealed,
        tag,
    })
}

fn open_with(
    master: &EncryptionKey,
    blob: &EncryptedBlob,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let key = crypto::aead_key(master, &blob.salt)?;
    let mut sealed = Vec::with_capacity(blob.ciphertext.len() + TAG_LEN);
    sealed.extend_from_slice(&blob.ciphertext);
    sealed.extend_from_slice(&blob.tag);
    crypto::decrypt(&key, &blob.nonce, &sealed, &blob.header_bytes())
}

pub fn encrypt(plaintext: &[u8], key: &EncryptionKey) -> Result<EncryptedBlob, CryptoError> {
    seal_with(key, KdfParams::RawKey, crypto::generate_salt(), plaintext)
}

pub fn encrypt_with_password(
    plaintext: &[u8],
    password: &[u8],
    iterations: u32,
) -> Result<EncryptedBlob, CryptoError> {
    let salt = crypto::generate_salt();
    let master = crypto::derive_key(password, &salt, iterations)?;
    seal_with(&master, KdfParams::Pbkdf2Sha512 { iterations }, salt, plaintext)
}

/// Fails with `Authentication` for a password-sealed blob: a raw key can
/// never open one.
pub fn decrypt(
    blob: &EncryptedBlob,
    key: &EncryptionKey,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    match blob.kdf {
        KdfParams::RawKey => open_with(key, blob),
        KdfParams::Pbkdf2Sha512 { .. } => Err(CryptoError::Authentication),
    }
}

pub fn decrypt_with_password(
    blob: &EncryptedBlob,
    password: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    match blob.kdf {
        KdfParams::Pbkdf2Sha512 { iterations } => {
            let master = crypto::derive_key(password, &blob.salt, iterations)?;
            open_with(&master, blob)
        }
        KdfParams::RawKey => Err(CryptoError::Authentication),
    }
}

/// `vendor.toml` -> `vendor.toml.enc`
pub fn sealed_path(plain: &Path) -> PathBuf {
    let mut name = plain.as_os_str().to_owned();
    name.push(".");
    name.push(SEALED_EXTENSION);
    PathBuf::from(name)
}

/// `vendor.toml.enc` -> `vendor.toml`; `None` when the path is not sealed.
pub fn plain_path(sealed: &Path) -> Option<PathBuf> {
    match sealed.extension() {
        Some(ext) if ext == SEALED_EXTENSION => Some(sealed.with_extension("")),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    Saved,
    Unchanged,
    Aborted,
}

/// Decrypted configuration on disk for the duration of an edit session.
/// Overwritten with random bytes and unlinked when dropped.
pub struct PlaintextScratch {
    path: Option<TempPath>,
}

impl PlaintextScratch {
    pub fn create(dir: &Path, suffix: &str, contents: &[u8]) -> Result<Self> {
        let file = tempfile::Builder::new()
            .prefix(".nacwatch-edit-")
            .suffix(suffix)
            .tempfile_in(dir)
            .map_err(|e| Error::io(dir, e))?;
        let path = file.into_temp_path();
        fsio::restrict_permissions(&path)?;
        fs::write(&path, contents).map_err(|e| Error::io(&path, e))?;
        Ok(Self { path: Some(path) })
    }

    pub fn path(&self) -> &Path {
        match &self.path {
            Some(p) => &**p,
            None => Path::new(""),
        }
    }

    pub fn read(&self) -> Result<Zeroizing<Vec<u8>>> {
        let path = self.path();
        fs::read(path)
            .map(Zeroizing::new)
            .map_err(|e| Error::io(path, e))
    }
}

impl Drop for PlaintextScratch {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        if let Ok(meta) = fs::metadata(&path) {
            if let Err(err) = fsio::overwrite_random(&path, meta.len()) {
                warn!(path = %path.display(), error = %err, "failed to scrub scratch file");
            }
        }
        let shown = path.display().to_string();
        if let Err(err) = path.close() {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %shown, error = %err, "failed to remove scratch file");
            }
        }
    }
}

/// Seals and opens configuration documents with a key resolved once from a
/// [`KeyChain`] and reused for the lifetime of the vault.
pub struct ConfigVault {
    keys: KeyChain,
    resolved: Mutex<Option<Arc<ResolvedKey>>>,
}

impl ConfigVault {
    pub fn new(keys: KeyChain) -> Self {
        Self {
            keys,
            resolved: Mutex::new(None),
        }
    }

    pub fn with_key(key: EncryptionKey) -> Self {
        Self::new(KeyChain::from_key(key))
    }

    fn key(&self) -> Result<Arc<ResolvedKey>> {
        let mut guard = self.resolved.lock();
        if let Some(resolved) = guard.as_ref() {
            return Ok(Arc::clone(resolved));
        }
        let resolved = Arc::new(self.keys.resolve()?);
        *guard = Some(Arc::clone(&resolved));
        Ok(resolved)
    }

    pub fn key_source(&self) -> Result<String> {
        Ok(self.key()?.source.clone())
    }

    pub fn seal_bytes(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self.key()?;
        let blob = key.material.seal(plaintext).map_err(|err| {
            warn!(key_source = %key.source, error = %err, "sealing failed");
            Error::Integrity {
                subject: "new sealed document".to_string(),
                key_source: key.source.clone(),
            }
        })?;
        Ok(blob.to_bytes())
    }

    pub fn open_bytes(&self, subject: &str, bytes: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let key = self.key()?;
        EncryptedBlob::from_bytes(bytes)
            .and_then(|blob| key.material.open(&blob))
            .map_err(|err| {
                warn!(
                    subject,
                    key_source = %key.source,
                    error = %err,
                    "vault authentication failed"
                );
                Error::Integrity {
                    subject: subject.to_string(),
                    key_source: key.source.clone(),
                }
            })
    }

    pub fn open_path(&self, path: &Path) -> Result<Zeroizing<Vec<u8>>> {
        let bytes = fs::read(path).map_err(|e| Error::io(path, e))?;
        self.open_bytes(&path.display().to_string(), &bytes)
    }

    /// Writes `<plain>.enc` (or `out`) and optionally scrubs the plaintext.
    pub fn seal_file(
        &self,
        plain: &Path,
        out: Option<&Path>,
        delete_plaintext: bool,
    ) -> Result<PathBuf> {
        let plaintext = fs::read(plain)
            .map(Zeroizing::new)
            .map_err(|e| Error::io(plain, e))?;
        let target = out.map(Path::to_path_buf).unwrap_or_else(|| sealed_path(plain));
        let sealed = self.seal_bytes(&plaintext)?;
        fsio::write_atomic(&target, &sealed)?;
        info!(source = %plain.display(), target = %target.display(), "sealed configuration");
        if delete_plaintext {
            fsio::secure_delete(plain)?;
            info!(path = %plain.display(), "plaintext securely deleted");
        }
        Ok(target)
    }

    pub fn open_file(&self, sealed: &Path, out: Option<&Path>) -> Result<PathBuf> {
        let target = match out {
            Some(p) => p.to_path_buf(),
            None => plain_path(sealed).ok_or_else(|| {
                Error::config(
                    sealed.display().to_string(),
                    "path",
                    format!("has no .{SEALED_EXTENSION} extension; pass an output path"),
                )
            })?,
        };
        let plaintext = self.open_path(sealed)?;
        fsio::write_atomic(&target, &plaintext)?;
        info!(
            source = %sealed.display(),
            target = %target.display(),
            "opened sealed configuration"
        );
        Ok(target)
    }

    /// Decrypts `sealed` into a scratch file, hands it to `edit`, then
    /// validates and re-seals the result. `edit` returns `false` to abandon
    /// the session without touching the sealed file.
    pub fn edit_sealed<E, V>(&self, sealed: &Path, edit: E, validate: V) -> Result<EditOutcome>
    where
        E: FnOnce(&Path) -> Result<bool>,
        V: FnOnce(&[u8]) -> Result<()>,
    {
        let original = self.open_path(sealed)?;
        let dir = match sealed.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let suffix = plain_path(sealed)
            .and_then(|p| p.extension().map(|e| format!(".{}", e.to_string_lossy())))
            .unwrap_or_default();
        let scratch = PlaintextScratch::create(dir, &suffix, &original)?;
        debug!(scratch = %scratch.path().display(), "editing sealed configuration");

        if !edit(scratch.path())? {
            info!(path = %sealed.display(), "edit session abandoned; sealed file untouched");
            return Ok(EditOutcome::Aborted);
        }
        let edited = scratch.read()?;
        if edited[..] == original[..] {
            return Ok(EditOutcome::Unchanged);
        }
        validate(&edited)?;
        let resealed = self.seal_bytes(&edited)?;
        fsio::write_atomic(sealed, &resealed)?;
        info!(path = %sealed.display(), "re-sealed edited configuration");
        Ok(EditOutcome::Saved)
    }
}
