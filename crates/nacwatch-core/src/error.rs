use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("config error in {file}: `{field}` {reason}")]
    Config {
        file: String,
        field: String,
        reason: String,
    },

    #[error("integrity check failed for {subject} using key from {key_source}: wrong key or tampered data")]
    Integrity { subject: String, key_source: String },

    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    #[error("report generation failed: {0}")]
    Generation(String),

    #[error("history store error: {0}")]
    Store(String),

    #[error("retention refused: {0}")]
    Retention(String),

    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Stable failure label used in log lines and process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Config,
    Integrity,
    TransientNetwork,
    Generation,
    Store,
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Config => "config",
            ErrorCategory::Integrity => "integrity",
            ErrorCategory::TransientNetwork => "transient_network",
            ErrorCategory::Generation => "generation",
            ErrorCategory::Store => "store",
            ErrorCategory::Other => "other",
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            ErrorCategory::Other => 1,
            ErrorCategory::Config => 2,
            ErrorCategory::Integrity => 3,
            ErrorCategory::TransientNetwork => 4,
            ErrorCategory::Generation => 5,
            ErrorCategory::Store => 6,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    pub fn config(
        file: impl Into<String>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::Config {
            file: file.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config { .. } => ErrorCategory::Config,
            Error::Integrity { .. } => ErrorCategory::Integrity,
            Error::TransientNetwork(_) => ErrorCategory::TransientNetwork,
            Error::Generation(_) => ErrorCategory::Generation,
            Error::Store(_) => ErrorCategory::Store,
            Error::Retention(_) | Error::Io { .. } => ErrorCategory::Other,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Store(err.to_string())
    }
}
