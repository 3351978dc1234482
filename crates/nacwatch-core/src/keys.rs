//! Encryption key resolution.
//!
//! Sources are consulted in order and the first one that yields key material
//! wins. A source that yields material which later fails authentication is
//! reported by name; the chain never falls through to the next source after
//! a failed decrypt.

use crate::crypto::{generate_key, EncryptionKey, KEY_LEN};
use crate::error::{Error, Result};
use crate::fsio;
use crate::vault::EncryptedBlob;
use std::fmt;
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zeroize::Zeroizing;

pub const KEY_FILE_NAME: &str = "encryption.key";
pub const PASSWORD_ENV: &str = "NACWATCH_CONFIG_PASSWORD";

pub enum KeyMaterial {
    KeyFile(EncryptionKey),
    Password(Zeroizing<String>),
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyMaterial::KeyFile(key) => write!(f, "KeyFile({})", key.fingerprint()),
            KeyMaterial::Password(_) => f.write_str("Password(<redacted>)"),
        }
    }
}

impl KeyMaterial {
    pub fn seal(&self, plaintext: &[u8]) -> Result<EncryptedBlob, crate::crypto::CryptoError> {
        match self {
            KeyMaterial::KeyFile(key) => crate::vault::encrypt(plaintext, key),
            KeyMaterial::Password(pw) => crate::vault::encrypt_with_password(
                plaintext,
                pw.as_bytes(),
                crate::crypto::DEFAULT_KDF_ITERATIONS,
            ),
        }
    }

    pub fn open(
        &self,
        blob: &EncryptedBlob,
    ) -> Result<Zeroizing<Vec<u8>>, crate::crypto::CryptoError> {
        match self {
            KeyMaterial::KeyFile(key) => crate::vault::decrypt(blob, key),
            KeyMaterial::Password(pw) => crate::vault::decrypt_with_password(blob, pw.as_bytes()),
        }
    }
}

#[derive(Debug)]
pub struct ResolvedKey {
    pub material: KeyMaterial,
    pub source: String,
}

/// One way of obtaining key material. `Ok(None)` means "not available here,
/// ask the next source".
pub trait KeySource: Send + Sync {
    fn describe(&self) -> String;
    fn resolve(&self) -> Result<Option<KeyMaterial>>;
}

pub struct KeyFileSource {
    path: PathBuf,
    required: bool,
}

impl KeyFileSource {
    /// A key file the operator named explicitly; its absence is an error.
    pub fn explicit(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            required: true,
        }
    }

    /// The conventional location; skipped silently when absent.
    pub fn conventional(config_dir: &Path) -> Self {
        Self {
            path: config_dir.join(KEY_FILE_NAME),
            required: false,
        }
    }
}

impl KeySource for KeyFileSource {
    fn describe(&self) -> String {
        format!("key file {}", self.path.display())
    }

    fn resolve(&self) -> Result<Option<KeyMaterial>> {
        if !self.path.exists() {
            if self.required {
                return Err(Error::config(
                    self.path.display().to_string(),
                    "key file",
                    "does not exist",
                ));
            }
            return Ok(None);
        }
        load_key_file(&self.path).map(|key| Some(KeyMaterial::KeyFile(key)))
    }
}

pub struct EnvPasswordSource {
    var: String,
}

impl EnvPasswordSource {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvPasswordSource {
    fn default() -> Self {
        Self::new(PASSWORD_ENV)
    }
}

impl KeySource for EnvPasswordSource {
    fn describe(&self) -> String {
        format!("environment variable {}", self.var)
    }

    fn resolve(&self) -> Result<Option<KeyMaterial>> {
        match std::env::var(&self.var) {
            Ok(value) if !value.is_empty() => {
                Ok(Some(KeyMaterial::Password(Zeroizing::new(value))))
            }
            _ => Ok(None),
        }
    }
}

pub struct PromptSource {
    prompt: String,
}

impl Default for PromptSource {
    fn default() -> Self {
        Self {
            prompt: "Config vault password: ".to_string(),
        }
    }
}

impl KeySource for PromptSource {
    fn describe(&self) -> String {
        "interactive prompt".to_string()
    }

    fn resolve(&self) -> Result<Option<KeyMaterial>> {
        if !std::io::stdin().is_terminal() {
            debug!("stdin is not a terminal; skipping password prompt");
            return Ok(None);
        }
        let password = rpassword::prompt_password(&self.prompt)
            .map_err(|e| Error::io(Path::new("/dev/tty"), e))?;
        if password.is_empty() {
            return Err(Error::config("<prompt>", "password", "must not be empty"));
        }
        Ok(Some(KeyMaterial::Password(Zeroizing::new(password))))
    }
}

/// A source that hands out a fixed key; used when the caller already holds one.
pub struct StaticKeySource {
    key: EncryptionKey,
    label: String,
}

impl StaticKeySource {
    pub fn new(key: EncryptionKey, label: impl Into<String>) -> Self {
        Self {
            key,
            label: label.into(),
        }
    }
}

impl KeySource for StaticKeySource {
    fn describe(&self) -> String {
        self.label.clone()
    }

    fn resolve(&self) -> Result<Option<KeyMaterial>> {
        Ok(Some(KeyMaterial::KeyFile(self.key.clone())))
    }
}

pub struct KeyChain {
    sources: Vec<Box<dyn KeySource>>,
}

impl KeyChain {
    pub fn new(sources: Vec<Box<dyn KeySource>>) -> Self {
        Self { sources }
    }

    /// explicit key file > conventional key file > env password > prompt
    pub fn standard(explicit_key_file: Option<PathBuf>, config_dir: &Path) -> Self {
        let mut sources: Vec<Box<dyn KeySource>> = Vec::with_capacity(4);
        if let Some(path) = explicit_key_file {
            sources.push(Box::new(KeyFileSource::explicit(path)));
        }
        sources.push(Box::new(KeyFileSource::conventional(config_dir)));
        sources.push(Box::new(EnvPasswordSource::default()));
        sources.push(Box::new(PromptSource::default()));
        Self::new(sources)
    }

    pub fn from_key(key: EncryptionKey) -> Self {
        Self::new(vec![Box::new(StaticKeySource::new(key, "supplied key"))])
    }

    pub fn resolve(&self) -> Result<ResolvedKey> {
        for source in &self.sources {
            if let Some(material) = source.resolve()? {
                let source = source.describe();
                debug!(source = %source, "encryption key resolved");
                return Ok(ResolvedKey { material, source });
            }
        }
        Err(Error::config(
            "<credentials>",
            "encryption key",
            format!("not found: no key file, no {PASSWORD_ENV}, and no terminal to prompt on"),
        ))
    }
}

pub fn load_key_file(path: &Path) -> Result<EncryptionKey> {
    let bytes = Zeroizing::new(fs::read(path).map_err(|e| Error::io(path, e))?);
    EncryptionKey::from_bytes(&bytes).map_err(|_| {
        Error::config(
            path.display().to_string(),
            "key file",
            format!("must contain exactly {KEY_LEN} bytes, found {}", bytes.len()),
        )
    })
}

/// Writes a fresh random key file. Refuses to overwrite an existing one.
pub fn create_key_file(path: &Path) -> Result<EncryptionKey> {
    let key = generate_key();
    fsio::create_exclusive(path, key.as_bytes())?;
    info!(path = %path.display(), fingerprint = %key.fingerprint(), "created encryption key file");
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct Absent;
    impl KeySource for Absent {
        fn describe(&self) -> String {
            "absent".into()
        }
        fn resolve(&self) -> Result<Option<KeyMaterial>> {
            Ok(None)
        }
    }

    struct MustNotRun;
    impl KeySource for MustNotRun {
        fn describe(&self) -> String {
            "must-not-run".into()
        }
        fn resolve(&self) -> Result<Option<KeyMaterial>> {
            panic!("chain consulted a source after an earlier one resolved");
        }
    }

    #[test]
    fn first_resolved_source_wins() {
        let chain = KeyChain::new(vec![
            Box::new(Absent),
            Box::new(StaticKeySource::new(generate_key(), "static")),
            Box::new(MustNotRun),
        ]);
        let resolved = chain.resolve().unwrap();
        assert_eq!(resolved.source, "static");
    }

    #[test]
    fn empty_chain_is_a_config_error() {
        let chain = KeyChain::new(vec![Box::new(Absent)]);
        let err = chain.resolve().unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn conventional_key_file_precedes_env_password() {
        let dir = tempdir().unwrap();
        create_key_file(&dir.path().join(KEY_FILE_NAME)).unwrap();
        std::env::set_var("NACWATCH_TEST_PW_PRECEDENCE", "from-env");
        let chain = KeyChain::new(vec![
            Box::new(KeyFileSource::conventional(dir.path())),
            Box::new(EnvPasswordSource::new("NACWATCH_TEST_PW_PRECEDENCE")),
        ]);
        let resolved = chain.resolve().unwrap();
        assert!(matches!(resolved.material, KeyMaterial::KeyFile(_)));
        assert!(resolved.source.contains(KEY_FILE_NAME));
    }

    #[test]
    fn env_password_used_when_no_key_file() {
        let dir = tempdir().unwrap();
        std::env::set_var("NACWATCH_TEST_PW_FALLBACK", "from-env");
        let chain = KeyChain::new(vec![
            Box::new(KeyFileSource::conventional(dir.path())),
            Box::new(EnvPasswordSource::new("NACWATCH_TEST_PW_FALLBACK")),
        ]);
        let resolved = chain.resolve().unwrap();
        match resolved.material {
            KeyMaterial::Password(pw) => assert_eq!(pw.as_str(), "from-env"),
            other => panic!("unexpected material {other:?}"),
        }
    }

    #[test]
    fn missing_explicit_key_file_is_an_error() {
        let dir = tempdir().unwrap();
        let chain = KeyChain::new(vec![
            Box::new(KeyFileSource::explicit(dir.path().join("nope.key"))),
            Box::new(StaticKeySource::new(generate_key(), "static")),
        ]);
        assert!(matches!(chain.resolve().unwrap_err(), Error::Config { .. }));
    }

    #[test]
    fn key_file_must_hold_full_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.key");
        fs::write(&path, [0u8; 16]).unwrap();
        let err = load_key_file(&path).unwrap_err();
        assert!(err.to_string().contains("64 bytes"));
    }

    #[test]
    fn created_key_file_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(KEY_FILE_NAME);
        let key = create_key_file(&path).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), KEY_LEN as u64);
        assert_eq!(load_key_file(&path).unwrap(), key);
        assert!(create_key_file(&path).is_err());
    }
}
