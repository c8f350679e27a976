//! Error types for luavm-protect

use thiserror::Error;

/// Protection error types
#[derive(Debug, Error)]
pub enum ProtectError {
    /// Source text is not valid Lua (or uses syntax outside the supported subset)
    #[error("Lua parse error: line {line}: {message}")]
    Parse { line: u32, message: String },

    /// Program exceeds what the bytecode encoding can address
    #[error("Compilation failed: {0}")]
    Compile(String),

    /// Checksum or length mismatch while decoding an encrypted chunk
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// File not found
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ProtectError {
    pub(crate) fn parse(line: u32, message: impl Into<String>) -> Self {
        Self::Parse {
            line,
            message: message.into(),
        }
    }
}

/// Result type for protection operations
pub type ProtectResult<T> = Result<T, ProtectError>;
