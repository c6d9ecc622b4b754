//! Typed failure taxonomy.
//!
//! Functions in this crate return `anyhow::Result` and attach context at every
//! filesystem or process boundary. Where a caller needs to tell failure kinds
//! apart, the root cause is an [`InstallError`] which can be recovered with
//! [`anyhow::Error::downcast_ref`] through any number of context layers.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstallError {
    /// The bootspec document has no version we understand.
    #[error("unsupported bootspec schema in {path}: {found}")]
    UnsupportedSchema { path: PathBuf, found: String },

    #[error("malformed bootspec {path}: {reason}")]
    MalformedSpec { path: PathBuf, reason: String },

    #[error("I/O failure on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to build boot stub: {0}")]
    Build(String),

    #[error("failed to sign {subject}: {reason}")]
    Signing { subject: String, reason: String },

    #[error("key enrollment refused: {0}")]
    EnrollmentRefused(String),

    /// Raised by the boot-time check, never by the install path.
    #[error("{diagnostic} ({path}: expected {expected}, found {actual})")]
    IntegrityMismatch {
        diagnostic: String,
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// The retention plan tried to remove the active generation.
    #[error("internal invariant violated: retention plan removes active generation {0}")]
    RetentionViolation(u64),
}

impl InstallError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Extension for attaching an [`InstallError::Io`] root cause to `std::io` results.
pub trait IoResultExt<T> {
    fn at_path(self, path: impl Into<PathBuf>) -> Result<T, InstallError>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn at_path(self, path: impl Into<PathBuf>) -> Result<T, InstallError> {
        self.map_err(|source| InstallError::io(path, source))
    }
}

/// Pipeline stage a generation failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Read,
    Stage,
    Build,
    Sign,
    Write,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Read => write!(f, "read"),
            Stage::Stage => write!(f, "stage"),
            Stage::Build => write!(f, "build"),
            Stage::Sign => write!(f, "sign"),
            Stage::Write => write!(f, "write"),
        }
    }
}

/// Returns the typed cause of `err`, if it has one.
pub fn kind_of(err: &anyhow::Error) -> Option<&InstallError> {
    err.downcast_ref::<InstallError>()
}
