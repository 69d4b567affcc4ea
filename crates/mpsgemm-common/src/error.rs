//! Error and status types.

use crate::config::ConfigError;
use crate::types::ComputeMode;
use thiserror::Error;

/// Status codes reported across the binding boundary (subset of the
/// vendor-library status set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Status {
    Success = 0,
    NotInitialized = 1,
    AllocFailed = 3,
    InvalidValue = 7,
    ExecutionFailed = 13,
    InternalError = 14,
    NotSupported = 15,
}

impl Status {
    pub fn from_raw(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::NotInitialized),
            3 => Some(Self::AllocFailed),
            7 => Some(Self::InvalidValue),
            13 => Some(Self::ExecutionFailed),
            14 => Some(Self::InternalError),
            15 => Some(Self::NotSupported),
            _ => None,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// Errors produced by the dispatch layer.
#[derive(Debug, Error)]
pub enum MpsgemmError {
    #[error("device allocation failed: {what} ({size} elements)")]
    Allocation { what: &'static str, size: usize },

    #[error("kernel launch failed: {0}")]
    LaunchFailed(String),

    #[error("handle is {actual}, expected {expected}")]
    InvalidState { expected: &'static str, actual: &'static str },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("compute mode {0} is not supported here")]
    UnsupportedMode(ComputeMode),

    #[error("kernel entry point {entry} does not accept {operands} operands")]
    OperandMismatch { entry: String, operands: &'static str },

    #[error("execution queue is closed")]
    QueueClosed,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl MpsgemmError {
    /// Map the error onto the status-code boundary.
    pub fn status(&self) -> Status {
        match self {
            MpsgemmError::Allocation { .. } => Status::AllocFailed,
            MpsgemmError::LaunchFailed(_) | MpsgemmError::QueueClosed => Status::ExecutionFailed,
            MpsgemmError::InvalidState { .. } => Status::NotInitialized,
            MpsgemmError::InvalidArgument(_) | MpsgemmError::Config(_) => Status::InvalidValue,
            MpsgemmError::UnsupportedMode(_) => Status::NotSupported,
            MpsgemmError::OperandMismatch { .. } => Status::InternalError,
        }
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, MpsgemmError>;

/// Collapse a result into a status code.
pub fn status_of<T>(result: &Result<T>) -> Status {
    match result {
        Ok(_) => Status::Success,
        Err(e) => e.status(),
    }
}
