//! Error types for the bundle update engine
//!
//! One taxonomy covers the whole pipeline (resolve, fetch, validate, stage,
//! activate) so the host only ever sees a stable error code next to the
//! boolean outcome of `update_bundle`.

use thiserror::Error;

/// Result type alias for update engine operations
pub type UpdateResult<T> = std::result::Result<T, UpdateError>;

/// Main error type for the update engine
#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Manifest resolution failed: {0}")]
    ResolveFailed(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server returned HTTP {status}")]
    HttpStatus { status: u16 },

    #[error("Server is rate limiting downloads")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Request timed out")]
    Timeout,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Update cancelled")]
    Cancelled,

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("A checksum is required but none was supplied")]
    ChecksumRequired,

    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("Archive has no bundle entry point (looked for: {expected})")]
    MissingEntryPoint { expected: String },

    #[error("Not enough disk space to stage bundle")]
    DiskFull,

    #[error("Failed to unpack bundle: {0}")]
    UnpackError(String),

    #[error("An update is already in progress")]
    AlreadyInProgress,

    #[error("Activation failed: {0}")]
    ActivationFailed(String),

    #[error("Bundle {bundle_id} is older than minimum bundle id {min_bundle_id}")]
    IncompatibleBundle {
        bundle_id: String,
        min_bundle_id: String,
    },

    #[error("Bundle {0} was rolled back earlier and will not be reinstalled")]
    PreviouslyRolledBack(String),

    #[error("Invalid bundle id: {0}")]
    InvalidBundleId(String),

    #[error("Invalid channel: {0}")]
    InvalidChannel(String),

    #[error("No activation pending for bundle {0}")]
    NoPendingActivation(String),

    #[error("State store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for UpdateError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpdateError::Timeout
        } else if err.is_builder() {
            UpdateError::InvalidUrl(err.to_string())
        } else if let Some(status) = err.status() {
            UpdateError::HttpStatus {
                status: status.as_u16(),
            }
        } else {
            UpdateError::Network(err.to_string())
        }
    }
}

impl UpdateError {
    /// Stable machine-readable code, used in `Failed` events
    pub fn code(&self) -> &'static str {
        match self {
            UpdateError::ResolveFailed(_) => "RESOLVE_FAILED",
            UpdateError::Network(_) => "NETWORK_ERROR",
            UpdateError::HttpStatus { .. } => "NETWORK_ERROR",
            UpdateError::RateLimited { .. } => "NETWORK_ERROR",
            UpdateError::Timeout => "NETWORK_ERROR",
            UpdateError::InvalidUrl(_) => "INVALID_URL",
            UpdateError::Cancelled => "CANCELLED",
            UpdateError::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            UpdateError::ChecksumRequired => "CHECKSUM_MISMATCH",
            UpdateError::CorruptArchive(_) => "CORRUPT_ARCHIVE",
            UpdateError::MissingEntryPoint { .. } => "MISSING_ENTRY_POINT",
            UpdateError::DiskFull => "DISK_FULL",
            UpdateError::UnpackError(_) => "UNPACK_ERROR",
            UpdateError::AlreadyInProgress => "ALREADY_IN_PROGRESS",
            UpdateError::ActivationFailed(_) => "ACTIVATION_FAILED",
            UpdateError::IncompatibleBundle { .. } => "INCOMPATIBLE_BUNDLE",
            UpdateError::PreviouslyRolledBack(_) => "PREVIOUSLY_ROLLED_BACK",
            UpdateError::InvalidBundleId(_) => "INVALID_BUNDLE_ID",
            UpdateError::InvalidChannel(_) => "INVALID_CHANNEL",
            UpdateError::NoPendingActivation(_) => "NO_PENDING_ACTIVATION",
            UpdateError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            UpdateError::Config(_) => "CONFIG_ERROR",
            UpdateError::Io(e) if is_disk_full(e) => "DISK_FULL",
            UpdateError::Io(_) => "IO_ERROR",
            UpdateError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

/// Whether an IO error means the volume ran out of space
pub fn is_disk_full(err: &std::io::Error) -> bool {
    if err.kind() == std::io::ErrorKind::StorageFull {
        return true;
    }
    // ENOSPC on unix, ERROR_DISK_FULL / ERROR_HANDLE_DISK_FULL on windows
    #[cfg(unix)]
    let codes: &[i32] = &[28];
    #[cfg(windows)]
    let codes: &[i32] = &[112, 39];
    #[cfg(not(any(unix, windows)))]
    let codes: &[i32] = &[];
    err.raw_os_error().map(|c| codes.contains(&c)).unwrap_or(false)
}

/// Trait for error recovery strategies
pub trait ErrorRecovery {
    /// Check if the error is retryable
    fn is_retryable(&self) -> bool;

    /// Get suggested retry delay in milliseconds
    fn retry_delay_ms(&self) -> Option<u64>;

    /// Get recovery action suggestion
    fn recovery_action(&self) -> RecoveryAction;
}

/// Recovery action suggestions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Retry the operation with backoff
    Retry,
    /// Discard the downloaded bundle; the running bundle is untouched
    Discard,
    /// Revert to the last known-good bundle
    Rollback,
    /// Reject immediately, nothing to clean up
    Reject,
    /// Abort; the engine cannot continue
    Abort,
}

impl ErrorRecovery for UpdateError {
    fn is_retryable(&self) -> bool {
        match self {
            UpdateError::Network(_) | UpdateError::Timeout | UpdateError::RateLimited { .. } => true,
            UpdateError::HttpStatus { status } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            UpdateError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    fn retry_delay_ms(&self) -> Option<u64> {
        match self {
            UpdateError::RateLimited {
                retry_after_secs: Some(secs),
            } => Some(secs.saturating_mul(1000)),
            UpdateError::RateLimited { .. } | UpdateError::HttpStatus { status: 429 } => Some(5000),
            UpdateError::Timeout => Some(1000),
            _ if self.is_retryable() => Some(500),
            _ => None,
        }
    }

    fn recovery_action(&self) -> RecoveryAction {
        match self {
            _ if self.is_retryable() => RecoveryAction::Retry,
            UpdateError::ChecksumMismatch { .. }
            | UpdateError::ChecksumRequired
            | UpdateError::CorruptArchive(_)
            | UpdateError::MissingEntryPoint { .. }
            | UpdateError::DiskFull
            | UpdateError::UnpackError(_) => RecoveryAction::Discard,
            UpdateError::ActivationFailed(_) => RecoveryAction::Rollback,
            UpdateError::StoreUnavailable(_) => RecoveryAction::Abort,
            _ => RecoveryAction::Reject,
        }
    }
}
