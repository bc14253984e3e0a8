use thiserror::Error;

/// Top-level error type for ferrite operations.
#[derive(Debug, Error)]
pub enum FerriteError {
    // --- Startup errors (the server refuses to run) ---
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("RDB error: {0}")]
    Rdb(String),

    #[error("Bind error: {0}")]
    Bind(String),

    // --- Connection-scoped errors (the connection closes, the server continues) ---
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Replication error: {0}")]
    Replication(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FerriteError {
    /// Whether this error is fatal at startup (process exits non-zero).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Rdb(_) | Self::Bind(_))
    }
}

/// Result type alias for ferrite operations.
pub type Result<T> = std::result::Result<T, FerriteError>;
