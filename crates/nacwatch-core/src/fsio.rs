//! Small filesystem helpers shared by the vault and config code.
//!
//! Every rewrite of an existing file goes through a sibling temp file that is
//! fsynced and renamed over the target, so a crash mid-write leaves either the
//! old bytes or the new bytes, never a truncated mix.

use crate::error::{Error, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::warn;

pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = parent_dir(path);
    fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    let mut tmp = NamedTempFile::new_in(parent).map_err(|e| Error::io(parent, e))?;
    restrict_permissions(tmp.path())?;
    tmp.write_all(bytes).map_err(|e| Error::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| Error::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| Error::io(path, e.error))?;
    sync_dir(parent);
    Ok(())
}

/// Creates `path` only if it does not exist yet, with owner-only permissions.
pub fn create_exclusive(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = parent_dir(path);
    fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(|e| Error::io(path, e))?;
    file.write_all(bytes).map_err(|e| Error::io(path, e))?;
    file.sync_all().map_err(|e| Error::io(path, e))?;
    Ok(())
}

/// Overwrites the file with random bytes before unlinking it.
pub fn secure_delete(path: &Path) -> Result<()> {
    let len = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::io(path, e)),
    };
    overwrite_random(path, len)?;
    fs::remove_file(path).map_err(|e| Error::io(path, e))
}

pub fn overwrite_random(path: &Path, len: u64) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| Error::io(path, e))?;
    let mut remaining = len;
    let mut buf = [0u8; 8192];
    while remaining > 0 {
        let chunk = remaining.min(buf.len() as u64) as usize;
        OsRng.fill_bytes(&mut buf[..chunk]);
        file.write_all(&buf[..chunk])
            .map_err(|e| Error::io(path, e))?;
        remaining -= chunk as u64;
    }
    file.sync_all().map_err(|e| Error::io(path, e))
}

pub fn restrict_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .map_err(|e| Error::io(path, e))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Err(err) = File::open(dir).and_then(|d| d.sync_all()) {
            warn!(dir = %dir.display(), error = %err, "directory fsync failed");
        }
    }
    #[cfg(not(unix))]
    let _ = dir;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_atomic_replaces_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.toml");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn create_exclusive_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("encryption.key");
        create_exclusive(&path, b"one").unwrap();
        assert!(create_exclusive(&path, b"two").is_err());
        assert_eq!(fs::read(&path).unwrap(), b"one");
    }

    #[test]
    fn secure_delete_removes_file_and_tolerates_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.toml");
        fs::write(&path, b"token = \"abc\"").unwrap();
        secure_delete(&path).unwrap();
        assert!(!path.exists());
        secure_delete(&path).unwrap();
    }
}
