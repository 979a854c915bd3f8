//! Machine-readable VM error codes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Error code recorded on a VM when it enters `ERROR`.
///
/// Known codes get their own variant; anything else reported by an
/// agent or operator is carried verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorCode {
    ProvisioningTimeout,
    BootTimeout,
    NetworkError,
    CloudApiError,
    HeartbeatTimeout,
    HeartbeatUnhealthy,
    /// Provisioning retries exhausted.
    ProvisioningFailed,
    /// Boot retries exhausted.
    BootFailed,
    Other(String),
}

impl ErrorCode {
    /// Wire form, e.g. `BOOT_TIMEOUT`.
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::ProvisioningTimeout => "PROVISIONING_TIMEOUT",
            ErrorCode::BootTimeout => "BOOT_TIMEOUT",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::CloudApiError => "CLOUD_API_ERROR",
            ErrorCode::HeartbeatTimeout => "HEARTBEAT_TIMEOUT",
            ErrorCode::HeartbeatUnhealthy => "HEARTBEAT_UNHEALTHY",
            ErrorCode::ProvisioningFailed => "PROVISIONING_FAILED",
            ErrorCode::BootFailed => "BOOT_FAILED",
            ErrorCode::Other(s) => s,
        }
    }

    /// Transient infrastructure failures that the retry pipeline may
    /// re-drive. Whether a retry actually happens also depends on the
    /// status the VM was in when it failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::ProvisioningTimeout
                | ErrorCode::BootTimeout
                | ErrorCode::NetworkError
                | ErrorCode::CloudApiError
                | ErrorCode::HeartbeatTimeout
        )
    }
}

impl From<String> for ErrorCode {
    fn from(s: String) -> Self {
        match s.as_str() {
            "PROVISIONING_TIMEOUT" => ErrorCode::ProvisioningTimeout,
            "BOOT_TIMEOUT" => ErrorCode::BootTimeout,
            "NETWORK_ERROR" => ErrorCode::NetworkError,
            "CLOUD_API_ERROR" => ErrorCode::CloudApiError,
            "HEARTBEAT_TIMEOUT" => ErrorCode::HeartbeatTimeout,
            "HEARTBEAT_UNHEALTHY" => ErrorCode::HeartbeatUnhealthy,
            "PROVISIONING_FAILED" => ErrorCode::ProvisioningFailed,
            "BOOT_FAILED" => ErrorCode::BootFailed,
            _ => ErrorCode::Other(s),
        }
    }
}

impl From<&str> for ErrorCode {
    fn from(s: &str) -> Self {
        ErrorCode::from(s.to_string())
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        code.as_str().to_string()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_set() {
        assert!(ErrorCode::ProvisioningTimeout.is_retryable());
        assert!(ErrorCode::BootTimeout.is_retryable());
        assert!(ErrorCode::NetworkError.is_retryable());
        assert!(ErrorCode::CloudApiError.is_retryable());
        assert!(ErrorCode::HeartbeatTimeout.is_retryable());
        assert!(!ErrorCode::HeartbeatUnhealthy.is_retryable());
        assert!(!ErrorCode::from("GPU_XID_79").is_retryable());
    }

    #[test]
    fn unknown_codes_round_trip_verbatim() {
        let code = ErrorCode::from("GPU_XID_79");
        assert_eq!(code, ErrorCode::Other("GPU_XID_79".to_string()));
        let json = serde_json::to_string(&code).unwrap();
        assert_eq!(json, "\"GPU_XID_79\"");
        assert_eq!(serde_json::from_str::<ErrorCode>("\"BOOT_TIMEOUT\"").unwrap(), ErrorCode::BootTimeout);
    }
}
