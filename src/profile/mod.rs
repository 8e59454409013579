pub mod store;

pub use store::{Profile, ProfileStore, DEFAULT_PROFILE};

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("Threshold index {index} out of range for {len} sensors")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Expected {expected} thresholds, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Invalid profile name: {0:?}")]
    InvalidName(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Profile file {} could not be read, not overwriting it", .0.display())]
    ReadOnly(std::path::PathBuf),
}

impl ProfileError {
    /// Persistence failures happen after the in-memory change was applied;
    /// everything else means nothing changed.
    pub fn is_persistence(&self) -> bool {
        matches!(self, ProfileError::IoError(_) | ProfileError::ReadOnly(_))
    }
}

pub type Result<T> = std::result::Result<T, ProfileError>;
