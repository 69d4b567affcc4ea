//! Reduced-precision matrix-multiply-accumulate primitive.
//!
//! Kernels never touch reduced-precision formats directly: they hand FP32
//! data to a [`MatmulPrimitive`], which splits it into fragments and
//! performs the multiply-accumulate. With error correction enabled each
//! value `v` is split into `hi = round(v)` and a scaled residual
//! `lo = round((v - hi) * s)`; the product is then
//! `hi_a*hi_b + (lo_a*hi_b + hi_a*lo_b) / s`, with the correction terms
//! summed in a separate accumulator.

use half::f16;
use mpsgemm_common::{PrecisionFamily, TensorCoreMode};
use std::fmt;

/// Round an FP32 value to the given reduced-precision format.
pub fn round_to_family(family: PrecisionFamily, v: f32) -> f32 {
    match family {
        PrecisionFamily::Fp16 => f16::from_f32(v).to_f32(),
        PrecisionFamily::Tf32 => round_tf32(v),
    }
}

/// Round-to-nearest-even onto the 10-bit TF32 mantissa.
fn round_tf32(v: f32) -> f32 {
    if !v.is_finite() {
        return v;
    }
    let bits = v.to_bits();
    let rounded = bits.wrapping_add(0x0FFF + ((bits >> 13) & 1)) & !0x1FFF;
    f32::from_bits(rounded)
}

/// Scale applied to the residual before it is rounded.
///
/// FP16 would flush most residuals to subnormals without it; TF32 keeps
/// the FP32 exponent range and needs none.
pub const fn correction_scale(family: PrecisionFamily) -> f32 {
    match family {
        PrecisionFamily::Fp16 => 2048.0,
        PrecisionFamily::Tf32 => 1.0,
    }
}

/// A run of values loaded into reduced-precision registers.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    hi: Vec<f32>,
    lo: Option<Vec<f32>>,
}

impl Fragment {
    pub fn len(&self) -> usize {
        self.hi.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hi.is_empty()
    }

    pub fn hi(&self) -> &[f32] {
        &self.hi
    }

    pub fn lo(&self) -> Option<&[f32]> {
        self.lo.as_deref()
    }

    /// Borrow `len` values starting at `start`.
    pub fn view(&self, start: usize, len: usize) -> FragmentView<'_> {
        let end = start + len;
        FragmentView { hi: &self.hi[start..end], lo: self.lo.as_ref().map(|lo| &lo[start..end]) }
    }
}

/// Borrowed slice of a [`Fragment`].
#[derive(Debug, Clone, Copy)]
pub struct FragmentView<'a> {
    pub hi: &'a [f32],
    pub lo: Option<&'a [f32]>,
}

/// The reduced-precision multiply-accumulate contract.
pub trait MatmulPrimitive: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Convert FP32 values into a fragment for `mode`.
    fn load(&self, mode: TensorCoreMode, values: &[f32]) -> Fragment;

    /// Dot product of two equally long fragment views, accumulated in FP32.
    fn mma(&self, mode: TensorCoreMode, a: FragmentView<'_>, b: FragmentView<'_>) -> f32;
}

/// Bit-faithful host emulation of FP16/TF32 tensor-core MMA.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmulatedTensorCore;

impl MatmulPrimitive for EmulatedTensorCore {
    fn name(&self) -> &'static str {
        "emulated"
    }

    fn load(&self, mode: TensorCoreMode, values: &[f32]) -> Fragment {
        let family = mode.family();
        let hi: Vec<f32> = values.iter().map(|&v| round_to_family(family, v)).collect();
        let lo = mode.error_correction().then(|| {
            let scale = correction_scale(family);
            values.iter().zip(&hi).map(|(&v, &h)| round_to_family(family, (v - h) * scale)).collect()
        });
        Fragment { hi, lo }
    }

    fn mma(&self, mode: TensorCoreMode, a: FragmentView<'_>, b: FragmentView<'_>) -> f32 {
        debug_assert_eq!(a.hi.len(), b.hi.len());
        let main: f32 = a.hi.iter().zip(b.hi).map(|(x, y)| x * y).sum();
        match (mode.error_correction(), a.lo, b.lo) {
            (true, Some(a_lo), Some(b_lo)) => {
                let mut correction = 0.0f32;
                for i in 0..a.hi.len() {
                    correction += a_lo[i] * b.hi[i] + a.hi[i] * b_lo[i];
                }
                main + correction / correction_scale(mode.family())
            }
            _ => main,
        }
    }
}

/// Outcome of inspecting one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inspection {
    /// Below the ignore threshold; not counted.
    Ignored,
    /// Counted and representable.
    Kept,
    /// Counted and flagged as a precision-loss risk.
    Lost,
}

/// Decides whether a value is at risk under the reduced-precision format.
pub trait RiskPredicate: Send + Sync + fmt::Debug {
    fn classify(&self, magnitude: f32) -> Inspection;
}

/// Threshold predicate: ignore tiny values, flag small non-zero and non-finite ones.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentThresholds {
    pub ignore_threshold: f32,
    pub lost_threshold: f32,
}

impl ExponentThresholds {
    pub fn new(ignore_threshold: f32, lost_threshold: f32) -> Self {
        Self { ignore_threshold, lost_threshold }
    }
}

impl RiskPredicate for ExponentThresholds {
    fn classify(&self, magnitude: f32) -> Inspection {
        if !magnitude.is_finite() {
            Inspection::Lost
        } else if magnitude < self.ignore_threshold {
            Inspection::Ignored
        } else if magnitude != 0.0 && magnitude < self.lost_threshold {
            Inspection::Lost
        } else {
            Inspection::Kept
        }
    }
}

/// `floor(log2(|v|))`, or `None` for zero and non-finite values.
pub fn exponent_of(v: f32) -> Option<i32> {
    if v == 0.0 || !v.is_finite() {
        return None;
    }
    let bits = v.abs().to_bits();
    let biased = ((bits >> 23) & 0xff) as i32;
    if biased == 0 {
        let mantissa = bits & 0x7f_ffff;
        Some(31 - mantissa.leading_zeros() as i32 - 149)
    } else {
        Some(biased - 127)
    }
}
