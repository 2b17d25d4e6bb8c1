use thiserror::Error;

use crate::guess::GuessWhat;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read kernel memory at address {address:#x}: {message}")]
    MemoryReadFailed { address: u64, message: String },

    #[error("Invalid offset: {0}")]
    InvalidOffset(String),

    #[error("Overflow while guessing {what}: offset {offset} reached threshold {threshold}")]
    ThresholdExceeded {
        what: GuessWhat,
        offset: u64,
        threshold: u64,
    },

    #[error("Max retries exceeded while waiting for {0} to be checked")]
    RetriesExhausted(GuessWhat),

    #[error("Missing prerequisite: {0}")]
    MissingPrerequisite(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to generate event for {what}: {message}")]
    EventGeneration { what: GuessWhat, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error is a recoverable memory fault
    pub fn is_fault(&self) -> bool {
        matches!(self, Error::MemoryReadFailed { .. })
    }

    /// Check if this error is a "file not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}
