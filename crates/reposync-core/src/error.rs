//! Error taxonomy for the sync engine.

use thiserror::Error;

/// Classified failure of a sync operation.
///
/// Per-descriptor errors are captured in the report and do not abort the
/// pool; `Config` and `Fatal` raised from the driver end the sync.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Connectivity, HTTP 5xx, timeout, partial transfer. Retryable.
    #[error("transport error (HTTP {code}): {message}")]
    Transport { code: u32, message: String },

    /// HTTP 401. Never retried; the caller may refresh credentials.
    #[error("unauthorized: {0}")]
    Auth(String),

    #[error("size mismatch: read {actual} bytes, was expecting {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("checksum mismatch: computed {actual}, expected {expected}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Another live process holds the path lock.
    #[error("path is locked by live process {holder}")]
    Requeue { holder: u32 },

    /// Bad caller-supplied configuration; fatal for the sync.
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem full, permission denied, and other catastrophes.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl SyncError {
    /// True for errors worth another attempt within a descriptor's budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transport { .. }
                | SyncError::SizeMismatch { .. }
                | SyncError::ChecksumMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(SyncError::Transport {
            code: 503,
            message: "busy".into()
        }
        .is_retryable());
        assert!(SyncError::SizeMismatch {
            expected: 10,
            actual: 7
        }
        .is_retryable());
        assert!(!SyncError::Auth("401".into()).is_retryable());
        assert!(!SyncError::Requeue { holder: 1 }.is_retryable());
        assert!(!SyncError::Config("proxy url without port".into()).is_retryable());
    }
}
