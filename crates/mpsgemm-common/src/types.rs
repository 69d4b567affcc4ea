//! Enumerations shared by every layer of the dispatcher.
//!
//! The textual forms produced by `Display` are part of the replay-log format
//! and must stay stable.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Operand mode: as-is, transposed, or conjugate-transposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Operation {
    N,
    T,
    C,
}

impl Operation {
    pub const ALL: [Operation; 3] = [Operation::N, Operation::T, Operation::C];

    /// Dense index used by table generation.
    pub const fn index(self) -> usize {
        match self {
            Operation::N => 0,
            Operation::T => 1,
            Operation::C => 2,
        }
    }

    pub const fn is_transposed(self) -> bool {
        !matches!(self, Operation::N)
    }

    pub const fn is_conjugated(self) -> bool {
        matches!(self, Operation::C)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::N => write!(f, "N"),
            Operation::T => write!(f, "T"),
            Operation::C => write!(f, "C"),
        }
    }
}

impl FromStr for Operation {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "N" | "n" => Ok(Operation::N),
            "T" | "t" => Ok(Operation::T),
            "C" | "c" => Ok(Operation::C),
            other => Err(format!("unknown operation: {other}")),
        }
    }
}

/// Element kind of a GEMM call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Real,
    Complex,
}

impl ElementKind {
    pub const ALL: [ElementKind; 2] = [ElementKind::Real, ElementKind::Complex];

    pub const fn index(self) -> usize {
        match self {
            ElementKind::Real => 0,
            ElementKind::Complex => 1,
        }
    }

    /// Size of one element in device memory.
    pub const fn element_bytes(self) -> usize {
        match self {
            ElementKind::Real => 4,
            ElementKind::Complex => 8,
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementKind::Real => write!(f, "real"),
            ElementKind::Complex => write!(f, "complex"),
        }
    }
}

/// Reduced-precision tensor-core input format.
///
/// `Tf32` keeps the FP32 exponent range but narrows the mantissa; `Fp16`
/// additionally narrows the exponent range, which is where most of the
/// precision loss tracked by the statistics ring comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrecisionFamily {
    Fp16,
    Tf32,
}

impl PrecisionFamily {
    pub const ALL: [PrecisionFamily; 2] = [PrecisionFamily::Fp16, PrecisionFamily::Tf32];

    pub const fn index(self) -> usize {
        match self {
            PrecisionFamily::Fp16 => 0,
            PrecisionFamily::Tf32 => 1,
        }
    }

    /// Explicit mantissa bits of the reduced format.
    pub const fn mantissa_bits(self) -> u32 {
        match self {
            PrecisionFamily::Fp16 | PrecisionFamily::Tf32 => 10,
        }
    }

    /// Unit round-off of the reduced format (round-to-nearest).
    pub fn unit_roundoff(self) -> f64 {
        2f64.powi(-(self.mantissa_bits() as i32 + 1))
    }

    /// Largest finite magnitude representable in the reduced format.
    pub fn max_finite(self) -> f32 {
        match self {
            PrecisionFamily::Fp16 => 65504.0,
            PrecisionFamily::Tf32 => f32::MAX,
        }
    }

    /// Bytes per element stored in shared memory.
    pub const fn storage_bytes(self) -> usize {
        match self {
            PrecisionFamily::Fp16 => 2,
            PrecisionFamily::Tf32 => 4,
        }
    }
}

impl fmt::Display for PrecisionFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrecisionFamily::Fp16 => write!(f, "fp16"),
            PrecisionFamily::Tf32 => write!(f, "tf32"),
        }
    }
}

/// Public compute-mode selector.
///
/// The numeric values are the stable codes exposed to host-language bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ComputeMode {
    /// Vendor-library full-precision GEMM.
    #[serde(rename = "CUBLAS")]
    Cublas = 0,
    #[serde(rename = "FP16TCEC")]
    Fp16Tcec = 1,
    #[serde(rename = "TF32TCEC")]
    Tf32Tcec = 2,
    #[serde(rename = "FP16TC")]
    Fp16Tc = 3,
    #[serde(rename = "TF32TC")]
    Tf32Tc = 4,
    #[serde(rename = "CUBLAS_SIMT")]
    CublasSimt = 5,
    #[serde(rename = "CUBLAS_FP16TC")]
    CublasFp16Tc = 6,
    #[serde(rename = "CUBLAS_TF32TC")]
    CublasTf32Tc = 7,
}

impl ComputeMode {
    pub const ALL: [ComputeMode; 8] = [
        ComputeMode::Cublas,
        ComputeMode::Fp16Tcec,
        ComputeMode::Tf32Tcec,
        ComputeMode::Fp16Tc,
        ComputeMode::Tf32Tc,
        ComputeMode::CublasSimt,
        ComputeMode::CublasFp16Tc,
        ComputeMode::CublasTf32Tc,
    ];

    pub fn from_raw(code: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| *m as u32 == code)
    }

    /// The tensor-core kernel configuration served by the module table, if any.
    pub fn tensor_core(self) -> Option<TensorCoreMode> {
        TensorCoreMode::try_from(self).ok()
    }

    /// Whether this mode is served by the vendor pass-through path.
    pub fn is_vendor(self) -> bool {
        self.tensor_core().is_none()
    }
}

impl fmt::Display for ComputeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComputeMode::Cublas => "CUBLAS",
            ComputeMode::Fp16Tcec => "FP16TCEC",
            ComputeMode::Tf32Tcec => "TF32TCEC",
            ComputeMode::Fp16Tc => "FP16TC",
            ComputeMode::Tf32Tc => "TF32TC",
            ComputeMode::CublasSimt => "CUBLAS_SIMT",
            ComputeMode::CublasFp16Tc => "CUBLAS_FP16TC",
            ComputeMode::CublasTf32Tc => "CUBLAS_TF32TC",
        };
        f.write_str(name)
    }
}

impl FromStr for ComputeMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        Self::ALL
            .iter()
            .copied()
            .find(|m| m.to_string() == upper)
            .ok_or_else(|| format!("unknown compute mode: {s}"))
    }
}

/// The four compute modes backed by generated tensor-core kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TensorCoreMode {
    Fp16Tcec,
    Tf32Tcec,
    Fp16Tc,
    Tf32Tc,
}

impl TensorCoreMode {
    pub const ALL: [TensorCoreMode; 4] = [
        TensorCoreMode::Fp16Tcec,
        TensorCoreMode::Tf32Tcec,
        TensorCoreMode::Fp16Tc,
        TensorCoreMode::Tf32Tc,
    ];

    pub const fn new(family: PrecisionFamily, error_correction: bool) -> Self {
        match (family, error_correction) {
            (PrecisionFamily::Fp16, true) => TensorCoreMode::Fp16Tcec,
            (PrecisionFamily::Tf32, true) => TensorCoreMode::Tf32Tcec,
            (PrecisionFamily::Fp16, false) => TensorCoreMode::Fp16Tc,
            (PrecisionFamily::Tf32, false) => TensorCoreMode::Tf32Tc,
        }
    }

    pub const fn family(self) -> PrecisionFamily {
        match self {
            TensorCoreMode::Fp16Tcec | TensorCoreMode::Fp16Tc => PrecisionFamily::Fp16,
            TensorCoreMode::Tf32Tcec | TensorCoreMode::Tf32Tc => PrecisionFamily::Tf32,
        }
    }

    pub const fn error_correction(self) -> bool {
        matches!(self, TensorCoreMode::Fp16Tcec | TensorCoreMode::Tf32Tcec)
    }
}

impl From<TensorCoreMode> for ComputeMode {
    fn from(mode: TensorCoreMode) -> Self {
        match mode {
            TensorCoreMode::Fp16Tcec => ComputeMode::Fp16Tcec,
            TensorCoreMode::Tf32Tcec => ComputeMode::Tf32Tcec,
            TensorCoreMode::Fp16Tc => ComputeMode::Fp16Tc,
            TensorCoreMode::Tf32Tc => ComputeMode::Tf32Tc,
        }
    }
}

impl TryFrom<ComputeMode> for TensorCoreMode {
    type Error = ComputeMode;
    fn try_from(mode: ComputeMode) -> Result<Self, Self::Error> {
        match mode {
            ComputeMode::Fp16Tcec => Ok(TensorCoreMode::Fp16Tcec),
            ComputeMode::Tf32Tcec => Ok(TensorCoreMode::Tf32Tcec),
            ComputeMode::Fp16Tc => Ok(TensorCoreMode::Fp16Tc),
            ComputeMode::Tf32Tc => Ok(TensorCoreMode::Tf32Tc),
            other => Err(other),
        }
    }
}

impl fmt::Display for TensorCoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        ComputeMode::from(*self).fmt(f)
    }
}

/// How statistics are attributed across the items of a strided-batched call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatsMode {
    /// One slot accumulates every item of the batch.
    #[default]
    Aggregate,
    /// One slot per batch item.
    PerItem,
}

impl fmt::Display for BatchStatsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchStatsMode::Aggregate => write!(f, "aggregate"),
            BatchStatsMode::PerItem => write!(f, "peritem"),
        }
    }
}

impl FromStr for BatchStatsMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "aggregate" => Ok(Self::Aggregate),
            "peritem" | "per-item" | "per_item" => Ok(Self::PerItem),
            other => Err(format!("unknown batch stats mode: {other}")),
        }
    }
}
