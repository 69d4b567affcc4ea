//! Tensor-core GEMM kernel.
//!
//! One block computes a `tile.m x tile.n` piece of C for one batch item.
//! The main loop walks `k` in `tile.k` steps: each step gathers the
//! `op(A)` rows and `op(B)` columns of the block, hands them to the
//! primitive as fragments and accumulates the partial dot products in
//! FP32. Before the epilogue (`alpha * acc + beta * C`) every accumulated
//! value is passed through the risk predicate.

use super::{op_element, scatter, GemmOperands, GemmProblem, StatsTarget, TileOutput};
use crate::element::Element;
use crate::module_table::TileShape;
use crate::primitive::{MatmulPrimitive, RiskPredicate};
use crate::stats::LocalStats;
use mpsgemm_common::{Result, TensorCoreMode};
use rayon::prelude::*;
use std::sync::Arc;

/// Everything a tensor-core launch needs besides its operands.
#[derive(Debug, Clone)]
pub struct TensorCoreKernel {
    pub primitive: Arc<dyn MatmulPrimitive>,
    pub predicate: Arc<dyn RiskPredicate>,
    pub mode: TensorCoreMode,
    pub tile: TileShape,
}

/// Run the GEMM over the full grid of blocks (all batch items).
pub fn run_tensor_core_gemm<T: Element>(
    kernel: &TensorCoreKernel,
    problem: &GemmProblem<T>,
    operands: &GemmOperands<T>,
    stats: &StatsTarget,
) -> Result<()> {
    let (a_span, b_span, c_span) = problem.checked_spans()?;
    let a = operands.a.read_span(a_span);
    let b = operands.b.read_span(b_span);
    let read_c = problem.beta != T::zero();
    let c_in = if read_c { operands.c.read_span(c_span) } else { Vec::new() };

    let tm = kernel.tile.m as usize;
    let tn = kernel.tile.n as usize;
    let grid_m = problem.m.div_ceil(tm);
    let grid_n = problem.n.div_ceil(tn);
    let per_item = grid_m * grid_n;

    let tiles: Vec<TileOutput<T>> = (0..per_item * problem.batch_count)
        .into_par_iter()
        .map(|block| {
            let item = block / per_item;
            let rem = block % per_item;
            let i0 = (rem % grid_m) * tm;
            let j0 = (rem / grid_m) * tn;
            let rows = tm.min(problem.m - i0);
            let cols = tn.min(problem.n - j0);

            let acc = block_product(kernel, problem, &a, &b, item, (i0, j0), (rows, cols));

            let mut local = LocalStats::default();
            let c_base = item * problem.stride_c;
            let mut values = Vec::with_capacity(rows * cols);
            for j in 0..cols {
                for i in 0..rows {
                    let p = acc[j * rows + i];
                    if stats.is_enabled() {
                        local.record(kernel.predicate.as_ref(), p.magnitude());
                    }
                    let mut out = problem.alpha * p;
                    if read_c {
                        out = out + problem.beta * c_in[c_base + (i0 + i) + (j0 + j) * problem.ldc];
                    }
                    values.push(out);
                }
            }
            if let Some(cell) = stats.cell_for(item) {
                cell.accumulate(&local);
            }
            TileOutput { offset: c_base + i0 + j0 * problem.ldc, rows, cols, values }
        })
        .collect();

    scatter(&operands.c, problem.ldc, tiles);
    Ok(())
}

/// `op(A)[i0.., :] * op(B)[:, j0..]` for one block, column-major.
fn block_product<T: Element>(
    kernel: &TensorCoreKernel,
    problem: &GemmProblem<T>,
    a: &[T],
    b: &[T],
    item: usize,
    (i0, j0): (usize, usize),
    (rows, cols): (usize, usize),
) -> Vec<T> {
    let prim = kernel.primitive.as_ref();
    let tk = (kernel.tile.k as usize).max(1);
    let a_base = item * problem.stride_a;
    let b_base = item * problem.stride_b;

    let mut acc = vec![T::zero(); rows * cols];
    let mut a_vals = Vec::with_capacity(rows * tk);
    let mut b_vals = Vec::with_capacity(cols * tk);
    let mut k0 = 0;
    while k0 < problem.k {
        let kl = tk.min(problem.k - k0);
        a_vals.clear();
        for i in 0..rows {
            for l in k0..k0 + kl {
                a_vals.push(op_element(a, a_base, problem.lda, problem.op_a, i0 + i, l));
            }
        }
        b_vals.clear();
        for j in 0..cols {
            for l in k0..k0 + kl {
                b_vals.push(op_element(b, b_base, problem.ldb, problem.op_b, l, j0 + j));
            }
        }
        let a_panel = T::load_panel(prim, kernel.mode, &a_vals);
        let b_panel = T::load_panel(prim, kernel.mode, &b_vals);
        for j in 0..cols {
            for i in 0..rows {
                let partial = T::panel_dot(prim, kernel.mode, &a_panel, i * kl, &b_panel, j * kl, kl);
                acc[j * rows + i] = acc[j * rows + i] + partial;
            }
        }
        k0 += kl;
    }
    acc
}
