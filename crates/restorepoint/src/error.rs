//! Error types for restore points

use std::path::PathBuf;

/// Result type for restore point operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from creating, loading or restoring a restore point
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Host(#[from] syscmd::Error),

    #[error("invalid manifest {}: {source}", path.display())]
    Manifest {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize manifest: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("no restore points under {}", .0.display())]
    NoRestorePoints(PathBuf),

    #[error("{} is not a restore point (no manifest.toml)", .0.display())]
    NotARestorePoint(PathBuf),

    #[error("backup copy {} is gone", .0.display())]
    MissingCopy(PathBuf),

    #[error("backup copy {} does not match its recorded digest", .0.display())]
    Tampered(PathBuf),
}
