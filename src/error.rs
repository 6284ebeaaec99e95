use thiserror::Error;

/// Errors that can occur when working with Kinetra trainers
#[derive(Error, Debug)]
pub enum KinetraError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Device not found during scanning
    #[error("Kinetra device not found")]
    DeviceNotFound,

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Device disconnected unexpectedly
    #[error("Device disconnected")]
    Disconnected,

    /// Scan could not be started or aborted mid-flight
    #[error("Scan failed: {0}")]
    ScanFailed(String),

    /// Operation timeout
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// The transport rejected an operation because another one is in flight
    ///
    /// The link's firmware reports this when a read or write lands while it is
    /// still servicing a previous operation. The operation queue retries these
    /// with backoff; seeing one surface to application code means the queue
    /// exhausted its retries.
    #[error("Transport busy")]
    TransportBusy,

    /// A write gave up after exhausting its retry budget
    #[error("Write failed after {attempts} attempts: {last_error}")]
    WriteExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Description of the last underlying error
        last_error: String,
    },

    /// Invalid command parameters
    #[error("Invalid command parameters: {0}")]
    InvalidParameters(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Required GATT characteristic missing after service discovery
    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(String),

    /// Message parsing failed
    #[error("Failed to parse packet: {0}")]
    ParseError(String),

    /// Device is not ready for commands
    #[error("Device not ready: {reason}")]
    NotReady {
        /// Reason why device is not ready
        reason: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for Kinetra operations
pub type Result<T> = std::result::Result<T, KinetraError>;

impl KinetraError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionFailed(_)
                | Self::Disconnected
                | Self::DeviceNotFound
        )
    }

    /// Check if this error is the transport's busy signature
    ///
    /// Only busy errors are retried by the operation queue; everything else
    /// fails the write immediately.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        match self {
            Self::TransportBusy => true,
            Self::Ble(e) => e.to_string().to_lowercase().contains("busy"),
            _ => false,
        }
    }

    /// Check if retrying the same operation may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.is_busy() || matches!(self, Self::Timeout { .. } | Self::NotReady { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let connection_error = KinetraError::ConnectionFailed("test".to_string());
        assert!(connection_error.is_connection_error());
        assert!(!connection_error.is_retryable());
        assert!(!connection_error.is_busy());

        let timeout_error = KinetraError::Timeout { timeout_ms: 5000 };
        assert!(!timeout_error.is_connection_error());
        assert!(timeout_error.is_retryable());
        assert!(!timeout_error.is_busy());

        let busy_error = KinetraError::TransportBusy;
        assert!(busy_error.is_busy());
        assert!(busy_error.is_retryable());
        assert!(!busy_error.is_connection_error());
    }

    #[test]
    fn test_error_display() {
        let error = KinetraError::InvalidParameters("weight out of range".to_string());
        let error_string = format!("{error}");
        assert!(error_string.contains("Invalid command parameters"));
        assert!(error_string.contains("weight out of range"));
    }

    #[test]
    fn test_write_exhausted_display() {
        let error = KinetraError::WriteExhausted {
            attempts: 3,
            last_error: "Transport busy".to_string(),
        };
        let error_string = format!("{error}");
        assert!(error_string.contains("3 attempts"));
    }
}
