use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub const KEY_LEN: usize = 64; // 512-bit master key
pub const AEAD_KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;
pub const MIN_KDF_ITERATIONS: u32 = 100_000;
pub const DEFAULT_KDF_ITERATIONS: u32 = 210_000;

const HKDF_INFO: &[u8] = b"nacwatch-config-vault-v1";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("malformed blob: {0}")]
    Malformed(&'static str),

    #[error("authentication failed")]
    Authentication,

    #[error("kdf iteration count {0} is below the minimum of {MIN_KDF_ITERATIONS}")]
    WeakKdf(u32),

    #[error("key must be {KEY_LEN} bytes, got {0}")]
    KeyLength(usize),

    #[error("encryption failed")]
    Encrypt,
}

/// 512-bit master key. Zeroized on drop and never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::KeyLength(bytes.len()));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(bytes);
        let out = Self(key);
        key.zeroize();
        Ok(out)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Short public identifier of the key, safe to log.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        hex::encode(&digest[..8])
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

impl PartialEq for EncryptionKey {
    fn eq(&self, other: &Self) -> bool {
        Sha256::digest(self.0) == Sha256::digest(other.0)
    }
}

impl Eq for EncryptionKey {}

pub fn generate_key() -> EncryptionKey {
    let mut bytes = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut bytes);
    let key = EncryptionKey(bytes);
    bytes.zeroize();
    key
}

pub fn derive_key(
    password: &[u8],
    salt: &[u8],
    iterations: u32,
) -> Result<EncryptionKey, CryptoError> {
    if iterations < MIN_KDF_ITERATIONS {
        return Err(CryptoError::WeakKdf(iterations));
    }
    let mut out = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha512>(password, salt, iterations, &mut out);
    let key = EncryptionKey(out);
    out.zeroize();
    Ok(key)
}

/// Per-blob AEAD key: HKDF-SHA256 over the master key, salted with the blob salt.
pub fn aead_key(
    master: &EncryptionKey,
    salt: &[u8],
) -> Result<Zeroizing<[u8; AEAD_KEY_LEN]>, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), master.as_bytes());
    let mut okm = Zeroizing::new([0u8; AEAD_KEY_LEN]);
    hk.expand(HKDF_INFO, &mut *okm)
        .map_err(|_| CryptoError::KeyLength(AEAD_KEY_LEN))?;
    Ok(okm)
}

/// Returns ciphertext with the 16-byte tag appended.
pub fn encrypt(
    key: &[u8; AEAD_KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = XNonce::from_slice(nonce);
    cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Encrypt)
}

pub fn decrypt(
    key: &[u8; AEAD_KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ciphertext_and_tag: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = XNonce::from_slice(nonce);
    let plaintext = cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext_and_tag,
                aad,
            },
        )
        .map_err(|_| CryptoError::Authentication)?;
    Ok(Zeroizing::new(plaintext))
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}
