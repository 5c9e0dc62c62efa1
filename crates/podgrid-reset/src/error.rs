use thiserror::Error;

/// Result type alias for reset requests.
pub type ResetResult<T> = Result<T, ResetError>;

/// A reset request rejected before any pod was touched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResetError {
    #[error("resetting whole clusters requires --force when no indices are given")]
    ForceRequired,

    #[error("no cluster patterns given")]
    NoClusters,
}
