//! Bootstrap-specific error types
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Preset or address-book data that makes a service impossible to resolve.
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// The PKI toolchain produced output that violates its stdout contract.
    #[error("Toolchain contract violation: {0}")]
    Toolchain(String),
    /// Parsed key material does not match the keys supplied for generation.
    /// Signals a corrupted or mismatched toolchain run; never downgraded.
    #[error("Key material mismatch: {0}")]
    KeyMismatch(String),
    #[error("Tool execution failed: {0}")]
    Runner(String),
    #[error("Template error: {0}")]
    Template(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, BootstrapError>;
