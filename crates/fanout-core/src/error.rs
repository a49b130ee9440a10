use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FanoutError>;

#[derive(Debug, Error)]
pub enum FanoutError {
    /// Mismatched inputs or invalid settings, raised before any work is dispatched.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    /// A chunk could not be decompressed or decoded; the whole read fails.
    #[error("corrupt chunk {}: {reason}", path.display())]
    StorageCorruption { path: PathBuf, reason: String },

    #[error("failed to parse record from {input:?}: {reason}")]
    Parse { input: String, reason: String },

    #[error("failed to encode record: {0}")]
    Encode(String),

    #[error("failed to decode compressed record: {0}")]
    Decode(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FanoutError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn corruption(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::StorageCorruption {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
