use crate::error::{Error, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "nacwatch";
pub const APP_NAME: &str = "nacwatch";
pub const HOME_ENV: &str = "NACWATCH_HOME";

pub const VENDOR_CONFIG: &str = "vendor.toml";
pub const AUTOMATION_CONFIG: &str = "automation.toml";

/// `--config-dir` beats `NACWATCH_HOME`, which beats the platform config dir.
pub fn config_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir.to_path_buf());
    }
    if let Ok(home) = std::env::var(HOME_ENV) {
        if !home.is_empty() {
            return Ok(PathBuf::from(home));
        }
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME).ok_or_else(|| {
        Error::config(
            "<environment>",
            HOME_ENV,
            "is unset and no platform config directory could be determined",
        )
    })?;
    Ok(dirs.config_dir().to_path_buf())
}

/// Relative paths in the config documents are relative to the config dir.
pub fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
