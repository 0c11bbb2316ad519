use thiserror::Error;

/// Result type used across the engine
pub type XfsResult<T> = Result<T, XfsError>;

#[derive(Debug, Error)]
pub enum XfsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Filesystem shut down")]
    Shutdown,

    #[error("No space left: {0}")]
    NoSpace(String),

    #[error("Reservation of {needed} bytes for {class} exceeds log size of {total} bytes")]
    ReservationTooLarge {
        class: String,
        needed: u64,
        total: u64,
    },

    #[error("Transaction overran its reservation: reserved {reserved} bytes, needed {needed}")]
    Overrun {
        reserved: u64,
        needed: u64,
    },

    #[error("Log space wait interrupted")]
    Interrupted,

    #[error("Lock order violation: {0}")]
    LockOrder(String),

    #[error("Invalid transaction use: {0}")]
    InvalidTransaction(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    Exists(String),

    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Corrupt metadata: {0}")]
    Corrupt(String),

    #[error("Log recovery failed: {0}")]
    RecoveryFailed(String),
}

impl XfsError {
    /// Errors that leave the mounted instance unusable
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            XfsError::Shutdown | XfsError::Overrun { .. } | XfsError::RecoveryFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(XfsError::Shutdown.is_fatal());
        assert!(XfsError::RecoveryFailed("bad crc".to_string()).is_fatal());
        assert!(!XfsError::NoSpace("inodes".to_string()).is_fatal());
        assert!(!XfsError::Interrupted.is_fatal());
    }

    #[test]
    fn test_reservation_message() {
        let err = XfsError::ReservationTooLarge {
            class: "Rename".to_string(),
            needed: 4096,
            total: 1024,
        };
        assert_eq!(
            err.to_string(),
            "Reservation of 4096 bytes for Rename exceeds log size of 1024 bytes"
        );
    }
}
