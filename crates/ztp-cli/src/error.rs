//! Error types for the CLI

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] ztp_common::Error),

    #[error("{message}")]
    CommandFailed { message: String },
}

impl Error {
    pub fn command_failed(message: impl Into<String>) -> Self {
        Error::CommandFailed {
            message: message.into(),
        }
    }

    /// True when the run was interrupted rather than failed
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Core(ztp_common::Error::Cancelled { .. }))
    }
}
