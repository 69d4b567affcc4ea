//! Control surface of the mpsgemm dispatcher.
//!
//! [`HijackControl`] sits where an application's vendor GEMM calls land.
//! It forwards them to the dispatcher and exposes the knobs of the
//! accuracy-tracking machinery: compute-mode override, statistics
//! thresholds and queries, dynamic launch flags and the replay log.

pub mod control;
pub mod error;

pub use control::{HijackControl, COMPUTE_MODE_ENV};
pub use error::{ControlError, Result};
