//! Control-surface error type.

use mpsgemm_common::{CallRecordError, ConfigError, MpsgemmError, Status};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Engine(#[from] MpsgemmError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("malformed replay-log line: {0}")]
    CallRecord(#[from] CallRecordError),

    #[error("invalid {key} value {value:?}")]
    InvalidComputeMode { key: &'static str, value: String },
}

impl ControlError {
    /// Map the error onto the status-code boundary.
    pub fn status(&self) -> Status {
        match self {
            ControlError::Engine(e) => e.status(),
            ControlError::Config(_)
            | ControlError::CallRecord(_)
            | ControlError::InvalidComputeMode { .. } => Status::InvalidValue,
        }
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;
