//! Enclave error types and the boundary status taxonomy

use std::fmt;
use thiserror::Error;

/// Result type for enclave operations
pub type TeeResult<T> = std::result::Result<T, TeeError>;

/// Enclave error types
#[derive(Error, Debug)]
pub enum TeeError {
    /// Caller supplied an invalid argument
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Allocation inside the enclave failed
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// The hardware session backing the enclave is gone
    #[error("Enclave lost, reinitialization required")]
    EnclaveLost,

    /// Enclave image or lifecycle state is invalid for this call
    #[error("Invalid enclave: {0}")]
    InvalidEnclave(String),

    /// Enclave has not been initialized
    #[error("Enclave not initialized")]
    EnclaveNotInitialized,

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    CryptoFailed(String),

    /// Sealing failed
    #[error("Sealing failed: {0}")]
    SealingFailed(String),

    /// Unsealing failed authentication
    #[error("Unsealing failed: {0}")]
    UnsealingFailed(String),

    /// Sealed blob is structurally invalid
    #[error("Malformed sealed data: {0}")]
    MalformedSealedData(String),

    /// Attestation evidence could not be produced
    #[error("Attestation failed: {0}")]
    AttestationFailed(String),

    /// Key not found in the key table
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Key id already in use
    #[error("Key already exists: {0}")]
    KeyAlreadyExists(String),

    /// Caller buffer cannot hold the output
    #[error("Buffer too small: {required} bytes required, {provided} provided")]
    BufferTooSmall { required: usize, provided: usize },

    /// Operation is not supported on this platform
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

impl TeeError {
    /// Status code reported across the boundary for this error
    pub fn status(&self) -> StatusCode {
        match self {
            TeeError::InvalidParameter(_) | TeeError::KeyAlreadyExists(_) => {
                StatusCode::InvalidParameter
            }
            TeeError::OutOfMemory(_) => StatusCode::OutOfMemory,
            TeeError::EnclaveLost => StatusCode::EnclaveLost,
            TeeError::InvalidEnclave(_) => StatusCode::InvalidEnclave,
            TeeError::EnclaveNotInitialized => StatusCode::NotInitialized,
            TeeError::CryptoFailed(_) => StatusCode::CryptoFailed,
            TeeError::SealingFailed(_) => StatusCode::SealFailed,
            TeeError::UnsealingFailed(_) | TeeError::MalformedSealedData(_) => {
                StatusCode::UnsealFailed
            }
            TeeError::AttestationFailed(_) => StatusCode::AttestationFailed,
            TeeError::KeyNotFound(_) => StatusCode::KeyNotFound,
            TeeError::BufferTooSmall { .. } => StatusCode::BufferTooSmall,
            TeeError::NotSupported(_) => StatusCode::NotSupported,
            TeeError::Config(_)
            | TeeError::Io(_)
            | TeeError::Serialization(_)
            | TeeError::Other(_) => StatusCode::Unknown,
        }
    }

    /// Whether the enclave instance is unusable until reinitialized
    pub fn is_fatal(&self) -> bool {
        matches!(self, TeeError::EnclaveLost)
    }

    /// Whether the caller can retry after re-querying the output size
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TeeError::BufferTooSmall { .. })
    }

    pub(crate) fn buffer_too_small(required: usize, provided: usize) -> Self {
        TeeError::BufferTooSmall { required, provided }
    }

    /// Keep lifecycle errors as they are and fold anything else into the
    /// operation's own failure variant
    pub(crate) fn or_fail_with(self, wrap: fn(String) -> TeeError) -> Self {
        match self {
            TeeError::EnclaveLost | TeeError::EnclaveNotInitialized => self,
            other => wrap(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for TeeError {
    fn from(err: serde_json::Error) -> Self {
        TeeError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for TeeError {
    fn from(err: anyhow::Error) -> Self {
        TeeError::Other(err.to_string())
    }
}

/// Closed status taxonomy of the enclave boundary.
///
/// The numeric values are part of the wire contract and never change.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Success = 0,
    InvalidParameter = 1,
    OutOfMemory = 2,
    EnclaveLost = 3,
    InvalidEnclave = 4,
    NotInitialized = 5,
    CryptoFailed = 6,
    SealFailed = 7,
    UnsealFailed = 8,
    AttestationFailed = 9,
    KeyNotFound = 10,
    BufferTooSmall = 11,
    NotSupported = 12,
    Unknown = 255,
}

impl StatusCode {
    /// Raw wire value
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    pub const fn is_success(self) -> bool {
        matches!(self, StatusCode::Success)
    }

    /// Decode a wire value; unassigned values map to `Unknown`
    pub const fn from_u32(value: u32) -> Self {
        match value {
            0 => StatusCode::Success,
            1 => StatusCode::InvalidParameter,
            2 => StatusCode::OutOfMemory,
            3 => StatusCode::EnclaveLost,
            4 => StatusCode::InvalidEnclave,
            5 => StatusCode::NotInitialized,
            6 => StatusCode::CryptoFailed,
            7 => StatusCode::SealFailed,
            8 => StatusCode::UnsealFailed,
            9 => StatusCode::AttestationFailed,
            10 => StatusCode::KeyNotFound,
            11 => StatusCode::BufferTooSmall,
            12 => StatusCode::NotSupported,
            _ => StatusCode::Unknown,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Success => "success",
            StatusCode::InvalidParameter => "invalid-parameter",
            StatusCode::OutOfMemory => "out-of-memory",
            StatusCode::EnclaveLost => "enclave-lost",
            StatusCode::InvalidEnclave => "invalid-enclave",
            StatusCode::NotInitialized => "not-initialized",
            StatusCode::CryptoFailed => "crypto-failed",
            StatusCode::SealFailed => "seal-failed",
            StatusCode::UnsealFailed => "unseal-failed",
            StatusCode::AttestationFailed => "attestation-failed",
            StatusCode::KeyNotFound => "key-not-found",
            StatusCode::BufferTooSmall => "buffer-too-small",
            StatusCode::NotSupported => "not-supported",
            StatusCode::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

impl<T> From<&TeeResult<T>> for StatusCode {
    fn from(result: &TeeResult<T>) -> Self {
        match result {
            Ok(_) => StatusCode::Success,
            Err(e) => e.status(),
        }
    }
}
