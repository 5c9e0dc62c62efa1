//! Error types shared across podgrid crates.

use thiserror::Error;

/// Result type alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// A pod identity string that does not follow `"<group> #<index>"`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("missing ' #' separator in pod identity {0:?}")]
    MissingSeparator(String),

    #[error("empty group name in pod identity {0:?}")]
    EmptyGroup(String),

    #[error("invalid sequence index in pod identity {0:?}")]
    InvalidIndex(String),
}

/// Errors raised while loading or validating `podgrid.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration: {0:?}")]
    Duration(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}
