//! Accuracy-tracking mixed-precision GEMM dispatch.
//!
//! FP32 (real and complex) GEMM calls are routed either to the vendor
//! pass-through or to a tensor-core kernel variant chosen from a
//! precomputed module table. Tensor-core kernels can record how many
//! products fell below the representable range of the reduced format,
//! and a device-side flag derived from those statistics lets later
//! launches escalate to a more precise mode without a host round-trip.
//!
//! The tensor cores are emulated on the CPU: see [`primitive`] for the
//! rounding model and [`stream`] for the asynchronous execution queue.

pub mod device;
pub mod dispatch;
pub mod dynamic_launch;
pub mod element;
pub mod handle;
pub mod kernels;
pub mod launch;
pub mod memory;
pub mod module_table;
pub mod primitive;
pub mod signature;
pub mod stats;
pub mod stream;

pub use device::DeviceTopology;
pub use dispatch::{
    cgemm, cgemm_strided_batched, exp_stats, gemm, gemm_strided_batched, scale_ab, scale_c, select,
    sgemm, sgemm_strided_batched, DispatchPath, GemmArgs, GemmReport, StridedBatch,
};
pub use dynamic_launch::{derive_flag, DynamicLaunchPolicy, FlagHandle, FlagRing, SCALE_TARGET_EXPONENT};
pub use element::Element;
pub use handle::{EngineHandle, EngineHandleBuilder, HandleState};
pub use kernels::{GemmOperands, GemmProblem, StatsTarget, StridedMatrix};
pub use launch::LaunchConfig;
pub use memory::{DeviceBuffer, DevicePtr};
pub use module_table::{KernelEntry, ModuleTable, ModuleVariant, TableKind, TileShape};
pub use primitive::{
    EmulatedTensorCore, ExponentThresholds, Inspection, MatmulPrimitive, RiskPredicate,
};
pub use signature::{derive_signature, ModuleSignature, SIGNATURE_COUNT};
pub use stats::{ExpStats, StatisticsRing, StatsCounters};
pub use stream::Stream;

pub use mpsgemm_common::{
    BatchStatsMode, ComputeMode, ElementKind, EngineConfig, MpsgemmError, Operation,
    PrecisionFamily, Result, TensorCoreMode,
};
pub use num_complex::Complex32;
