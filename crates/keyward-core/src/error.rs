use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type HsmResult<T> = Result<T, HsmError>;

#[derive(Debug, Error)]
pub enum HsmError {
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("key inactive: {0}")]
    KeyInactive(String),
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),
    #[error("crypto operation failed: {0}")]
    CryptoOperationFailed(String),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("label already in use: {0}")]
    DuplicateLabel(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("configuration error: {0}")]
    Config(String),
}

/// Stable, serialisable tag for an [`HsmError`], used by response envelopes and
/// persisted operation records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DeviceUnavailable,
    AuthenticationFailed,
    KeyNotFound,
    KeyInactive,
    KeyGenerationFailed,
    CryptoOperationFailed,
    UnsupportedAlgorithm,
    DuplicateLabel,
    InvalidInput,
    Storage,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::DeviceUnavailable => "device_unavailable",
            ErrorKind::AuthenticationFailed => "authentication_failed",
            ErrorKind::KeyNotFound => "key_not_found",
            ErrorKind::KeyInactive => "key_inactive",
            ErrorKind::KeyGenerationFailed => "key_generation_failed",
            ErrorKind::CryptoOperationFailed => "crypto_operation_failed",
            ErrorKind::UnsupportedAlgorithm => "unsupported_algorithm",
            ErrorKind::DuplicateLabel => "duplicate_label",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Storage => "storage",
            ErrorKind::Config => "config",
        }
    }
}

impl HsmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HsmError::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            HsmError::AuthenticationFailed(_) => ErrorKind::AuthenticationFailed,
            HsmError::KeyNotFound(_) => ErrorKind::KeyNotFound,
            HsmError::KeyInactive(_) => ErrorKind::KeyInactive,
            HsmError::KeyGenerationFailed(_) => ErrorKind::KeyGenerationFailed,
            HsmError::CryptoOperationFailed(_) => ErrorKind::CryptoOperationFailed,
            HsmError::UnsupportedAlgorithm(_) => ErrorKind::UnsupportedAlgorithm,
            HsmError::DuplicateLabel(_) => ErrorKind::DuplicateLabel,
            HsmError::InvalidInput(_) => ErrorKind::InvalidInput,
            HsmError::Storage(_) => ErrorKind::Storage,
            HsmError::Config(_) => ErrorKind::Config,
        }
    }

    pub fn device<E: std::fmt::Display>(err: E) -> Self {
        Self::DeviceUnavailable(err.to_string())
    }
    pub fn crypto<E: std::fmt::Display>(err: E) -> Self {
        Self::CryptoOperationFailed(err.to_string())
    }
    pub fn keygen<E: std::fmt::Display>(err: E) -> Self {
        Self::KeyGenerationFailed(err.to_string())
    }
    pub fn storage<E: std::fmt::Display>(err: E) -> Self {
        Self::Storage(err.to_string())
    }
    pub fn invalid<E: std::fmt::Display>(err: E) -> Self {
        Self::InvalidInput(err.to_string())
    }
    pub fn config<E: std::fmt::Display>(err: E) -> Self {
        Self::Config(err.to_string())
    }
}
