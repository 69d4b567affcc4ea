//! Vendor-library pass-through GEMM.
//!
//! Stands in for the vendor BLAS on the emulated device: a plain
//! column-by-column product in FP32, optionally with inputs rounded to a
//! reduced format to mimic the vendor's own tensor-core modes. No
//! statistics are collected on this path.

use super::{op_element, GemmOperands, GemmProblem};
use crate::element::Element;
use mpsgemm_common::{ComputeMode, PrecisionFamily, Result};
use rayon::prelude::*;

/// Input precision of the pass-through product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferencePrecision {
    Full,
    Rounded(PrecisionFamily),
}

impl ReferencePrecision {
    /// Precision used for a vendor compute mode; `None` for tensor-core modes.
    pub fn for_mode(mode: ComputeMode) -> Option<Self> {
        match mode {
            ComputeMode::Cublas | ComputeMode::CublasSimt => Some(Self::Full),
            ComputeMode::CublasFp16Tc => Some(Self::Rounded(PrecisionFamily::Fp16)),
            ComputeMode::CublasTf32Tc => Some(Self::Rounded(PrecisionFamily::Tf32)),
            ComputeMode::Fp16Tcec | ComputeMode::Tf32Tcec | ComputeMode::Fp16Tc | ComputeMode::Tf32Tc => {
                None
            }
        }
    }

    fn apply<T: Element>(self, v: T) -> T {
        match self {
            ReferencePrecision::Full => v,
            ReferencePrecision::Rounded(family) => v.round_to(family),
        }
    }
}

/// `C = alpha * op(A) * op(B) + beta * C` for every batch item.
pub fn run_reference_gemm<T: Element>(
    precision: ReferencePrecision,
    problem: &GemmProblem<T>,
    operands: &GemmOperands<T>,
) -> Result<()> {
    let (a_span, b_span, c_span) = problem.checked_spans()?;
    let a = operands.a.read_span(a_span);
    let b = operands.b.read_span(b_span);
    let c_in = operands.c.read_span(c_span);
    let read_c = problem.beta != T::zero();

    let columns: Vec<(usize, Vec<T>)> = (0..problem.batch_count * problem.n)
        .into_par_iter()
        .map(|index| {
            let item = index / problem.n;
            let j = index % problem.n;
            let (a_base, b_base) = (item * problem.stride_a, item * problem.stride_b);
            let c_col = item * problem.stride_c + j * problem.ldc;
            let column = (0..problem.m)
                .map(|i| {
                    let mut acc = T::zero();
                    for l in 0..problem.k {
                        let x = precision.apply(op_element(&a, a_base, problem.lda, problem.op_a, i, l));
                        let y = precision.apply(op_element(&b, b_base, problem.ldb, problem.op_b, l, j));
                        acc = acc + x * y;
                    }
                    let mut out = problem.alpha * acc;
                    if read_c {
                        out = out + problem.beta * c_in[c_col + i];
                    }
                    out
                })
                .collect();
            (c_col, column)
        })
        .collect();

    let mut c = operands.c.buffer().write();
    let base = operands.c.offset();
    for (offset, column) in columns {
        c[base + offset..base + offset + column.len()].copy_from_slice(&column);
    }
    Ok(())
}
