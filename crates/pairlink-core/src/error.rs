//! Error types for pairlink

use thiserror::Error;

/// Main error type for pairlink operations
#[derive(Error, Debug)]
pub enum P2pError {
    /// Operation invoked before the engine finished starting
    #[error("Client not ready: call start() first")]
    NotReady,

    /// Transient network failure (sync loop, send, login)
    #[error("Network error: {0}")]
    Network(String),

    /// The chat substrate rejected an operation on a room
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Ciphertext did not authenticate under the expected key.
    /// Expected for bus-broadcast traffic not addressed to us; callers on
    /// the receive path drop this silently.
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// A bounded wait was exhausted
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Key material was malformed
    #[error("Identity error: {0}")]
    Identity(String),

    /// Pairing payload was malformed or carried an unknown tag
    #[error("Invalid pairing payload: {0}")]
    InvalidPairing(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using P2pError
pub type P2pResult<T> = Result<T, P2pError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = P2pError::Forbidden("M_FORBIDDEN".to_string());
        assert_eq!(format!("{}", err), "Forbidden: M_FORBIDDEN");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: P2pError = io_err.into();
        assert!(matches!(err, P2pError::Io(_)));
    }
}
