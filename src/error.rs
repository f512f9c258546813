use thiserror::Error;

/// Unified error type for the swivel pool
#[derive(Error, Debug)]
pub enum SwivelError {
    // Catalog errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database connection failed: {0}")]
    DatabaseConnection(String),

    // Pool errors
    #[error("No available proxy")]
    NoAvailableProxy,

    #[error("Proxy not found: {id}")]
    ProxyNotFound { id: i64 },

    #[error("Rotation failed: {0}")]
    RotationFailed(String),

    // Entry parsing
    #[error("Invalid proxy entry: {0}")]
    Parse(String),

    #[error("Invalid proxy address: {0}")]
    InvalidAddress(String),

    // Vendor APIs
    #[error("Vendor API error: {0}")]
    Vendor(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // Forwarder
    #[error("Forwarder error: {0}")]
    Forwarder(String),

    #[error("CONNECT failed: {0}")]
    ConnectFailed(String),

    // Configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for swivel operations
pub type Result<T> = std::result::Result<T, SwivelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            SwivelError::NoAvailableProxy.to_string(),
            "No available proxy"
        );
        assert_eq!(
            SwivelError::Parse("missing fields".to_string()).to_string(),
            "Invalid proxy entry: missing fields"
        );
    }
}
