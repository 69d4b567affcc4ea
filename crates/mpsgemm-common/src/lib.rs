//! Common types, configuration and errors for the mpsgemm dispatch layer.
//!
//! This crate provides the foundational vocabulary shared by the kernel
//! dispatcher and the control surface: compute modes, operand modes,
//! [`EngineConfig`] and the [`MpsgemmError`] / [`Status`] pair.

pub mod call_record;
pub mod config;
pub mod error;
pub mod types;

pub use call_record::{CallRecord, CallRecordError};
pub use config::{ConfigError, EngineConfig};
pub use error::{status_of, MpsgemmError, Result, Status};
pub use types::{
    BatchStatsMode, ComputeMode, ElementKind, Operation, PrecisionFamily, TensorCoreMode,
};
