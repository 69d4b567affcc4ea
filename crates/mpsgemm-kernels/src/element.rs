//! Element types accepted by the GEMM kernels.

use crate::primitive::{round_to_family, Fragment, MatmulPrimitive};
use mpsgemm_common::{ElementKind, PrecisionFamily, TensorCoreMode};
use num_complex::Complex32;
use std::fmt;
use std::ops::{Add, Mul};

/// A GEMM element: `f32` or [`Complex32`].
///
/// `Panel` is the fragment layout a kernel keeps for one block of operand
/// data; complex panels carry separate real and imaginary fragments.
pub trait Element:
    Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static + Add<Output = Self> + Mul<Output = Self>
{
    const KIND: ElementKind;

    type Panel: Send + Sync;

    fn zero() -> Self;

    fn conj(self) -> Self;

    /// Largest component magnitude.
    fn magnitude(self) -> f32;

    fn scale(self, factor: f32) -> Self;

    /// Round every component to `family`.
    fn round_to(self, family: PrecisionFamily) -> Self;

    fn load_panel(primitive: &dyn MatmulPrimitive, mode: TensorCoreMode, values: &[Self]) -> Self::Panel;

    /// Dot product of `k` panel values starting at `a_start` and `b_start`.
    fn panel_dot(
        primitive: &dyn MatmulPrimitive,
        mode: TensorCoreMode,
        a: &Self::Panel,
        a_start: usize,
        b: &Self::Panel,
        b_start: usize,
        k: usize,
    ) -> Self;
}

impl Element for f32 {
    const KIND: ElementKind = ElementKind::Real;

    type Panel = Fragment;

    fn zero() -> Self {
        0.0
    }

    fn conj(self) -> Self {
        self
    }

    fn magnitude(self) -> f32 {
        self.abs()
    }

    fn scale(self, factor: f32) -> Self {
        self * factor
    }

    fn round_to(self, family: PrecisionFamily) -> Self {
        round_to_family(family, self)
    }

    fn load_panel(primitive: &dyn MatmulPrimitive, mode: TensorCoreMode, values: &[Self]) -> Fragment {
        primitive.load(mode, values)
    }

    fn panel_dot(
        primitive: &dyn MatmulPrimitive,
        mode: TensorCoreMode,
        a: &Fragment,
        a_start: usize,
        b: &Fragment,
        b_start: usize,
        k: usize,
    ) -> Self {
        primitive.mma(mode, a.view(a_start, k), b.view(b_start, k))
    }
}

/// Real and imaginary fragments of a complex panel.
#[derive(Debug, Clone)]
pub struct ComplexPanel {
    re: Fragment,
    im: Fragment,
}

impl Element for Complex32 {
    const KIND: ElementKind = ElementKind::Complex;

    type Panel = ComplexPanel;

    fn zero() -> Self {
        Complex32::new(0.0, 0.0)
    }

    fn conj(self) -> Self {
        Complex32::conj(&self)
    }

    fn magnitude(self) -> f32 {
        self.re.abs().max(self.im.abs())
    }

    fn scale(self, factor: f32) -> Self {
        Complex32::new(self.re * factor, self.im * factor)
    }

    fn round_to(self, family: PrecisionFamily) -> Self {
        Complex32::new(round_to_family(family, self.re), round_to_family(family, self.im))
    }

    fn load_panel(primitive: &dyn MatmulPrimitive, mode: TensorCoreMode, values: &[Self]) -> ComplexPanel {
        let re: Vec<f32> = values.iter().map(|z| z.re).collect();
        let im: Vec<f32> = values.iter().map(|z| z.im).collect();
        ComplexPanel { re: primitive.load(mode, &re), im: primitive.load(mode, &im) }
    }

    fn panel_dot(
        primitive: &dyn MatmulPrimitive,
        mode: TensorCoreMode,
        a: &ComplexPanel,
        a_start: usize,
        b: &ComplexPanel,
        b_start: usize,
        k: usize,
    ) -> Self {
        let rr = primitive.mma(mode, a.re.view(a_start, k), b.re.view(b_start, k));
        let ii = primitive.mma(mode, a.im.view(a_start, k), b.im.view(b_start, k));
        let ri = primitive.mma(mode, a.re.view(a_start, k), b.im.view(b_start, k));
        let ir = primitive.mma(mode, a.im.view(a_start, k), b.re.view(b_start, k));
        Complex32::new(rr - ii, ri + ir)
    }
}
