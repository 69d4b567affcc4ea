//! Kernel bodies executed on the stream.
//!
//! Each kernel copies the operand spans it reads out of device memory,
//! computes blocks in parallel on the rayon pool, and writes its output
//! back under the buffer's write lock.

pub mod gemm;
pub mod inspect;
pub mod reference;
pub mod scale;

use crate::element::Element;
use crate::memory::{batch_span, matrix_span, DevicePtr};
use crate::stats::{StatsCell, StatsCounters};
use mpsgemm_common::{MpsgemmError, Operation, Result};

pub use gemm::{run_tensor_core_gemm, TensorCoreKernel};
pub use inspect::run_exp_stats;
pub use reference::{run_reference_gemm, ReferencePrecision};
pub use scale::run_scale;

/// Shape, scalars and layout of a (possibly strided-batched) GEMM.
///
/// All matrices are column-major; item `i` of a batch starts `i * stride_*`
/// elements after the operand pointer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GemmProblem<T> {
    pub op_a: Operation,
    pub op_b: Operation,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub alpha: T,
    pub beta: T,
    pub lda: usize,
    pub ldb: usize,
    pub ldc: usize,
    pub stride_a: usize,
    pub stride_b: usize,
    pub stride_c: usize,
    pub batch_count: usize,
}

impl<T: Element> GemmProblem<T> {
    /// Stored (rows, cols) of A.
    pub fn a_dims(&self) -> (usize, usize) {
        if self.op_a.is_transposed() {
            (self.k, self.m)
        } else {
            (self.m, self.k)
        }
    }

    /// Stored (rows, cols) of B.
    pub fn b_dims(&self) -> (usize, usize) {
        if self.op_b.is_transposed() {
            (self.n, self.k)
        } else {
            (self.k, self.n)
        }
    }

    /// Elements of A, B and C touched by the whole batch.
    pub fn spans(&self) -> Option<(usize, usize, usize)> {
        let (ar, ac) = self.a_dims();
        let (br, bc) = self.b_dims();
        let a = batch_span(matrix_span(ar, ac, self.lda)?, self.stride_a, self.batch_count)?;
        let b = batch_span(matrix_span(br, bc, self.ldb)?, self.stride_b, self.batch_count)?;
        let c = batch_span(matrix_span(self.m, self.n, self.ldc)?, self.stride_c, self.batch_count)?;
        Some((a, b, c))
    }

    /// Item `index` as a stand-alone problem, with matching operand pointers.
    pub fn item(&self, index: usize, operands: &GemmOperands<T>) -> (GemmProblem<T>, GemmOperands<T>) {
        let problem = GemmProblem { batch_count: 1, ..*self };
        let operands = GemmOperands {
            a: operands.a.add(index * self.stride_a),
            b: operands.b.add(index * self.stride_b),
            c: operands.c.add(index * self.stride_c),
        };
        (problem, operands)
    }

    fn checked_spans(&self) -> Result<(usize, usize, usize)> {
        self.spans()
            .ok_or_else(|| MpsgemmError::LaunchFailed("operand span overflows the address space".into()))
    }
}

/// Device pointers of a GEMM.
#[derive(Debug)]
pub struct GemmOperands<T> {
    pub a: DevicePtr<T>,
    pub b: DevicePtr<T>,
    pub c: DevicePtr<T>,
}

impl<T> Clone for GemmOperands<T> {
    fn clone(&self) -> Self {
        Self { a: self.a.clone(), b: self.b.clone(), c: self.c.clone() }
    }
}

/// A column-major matrix (or strided batch of them) in device memory.
#[derive(Debug)]
pub struct StridedMatrix<T> {
    pub ptr: DevicePtr<T>,
    pub rows: usize,
    pub cols: usize,
    pub ld: usize,
    pub batch_count: usize,
    pub stride: usize,
}

impl<T> Clone for StridedMatrix<T> {
    fn clone(&self) -> Self {
        Self { ptr: self.ptr.clone(), ..*self }
    }
}

impl<T: Element> StridedMatrix<T> {
    /// Reject shapes that do not fit the buffer behind `ptr`.
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.rows == 0 || self.cols == 0 || self.batch_count == 0 {
            return Err(MpsgemmError::InvalidArgument(format!(
                "{name} must be non-empty, got {}x{} (batch {})",
                self.rows, self.cols, self.batch_count
            )));
        }
        if self.ld < self.rows {
            return Err(MpsgemmError::InvalidArgument(format!(
                "{name} leading dimension {} is smaller than {} rows",
                self.ld, self.rows
            )));
        }
        let span = self.span().ok_or_else(|| {
            MpsgemmError::InvalidArgument(format!("{name} span overflows the address space"))
        })?;
        self.ptr.check_span(name, span)
    }

    pub fn span(&self) -> Option<usize> {
        batch_span(matrix_span(self.rows, self.cols, self.ld)?, self.stride, self.batch_count)
    }
}

/// Where a kernel accumulates its statistics.
#[derive(Debug, Clone, Default)]
pub enum StatsTarget {
    #[default]
    Disabled,
    /// Every batch item into one slot.
    Aggregate(StatsCounters),
    /// Batch item `i` into slot `i` of the list.
    PerItem(Vec<StatsCounters>),
}

impl StatsTarget {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, StatsTarget::Disabled)
    }

    pub(crate) fn cell_for(&self, item: usize) -> Option<&StatsCell> {
        match self {
            StatsTarget::Disabled => None,
            StatsTarget::Aggregate(counters) => Some(counters.cell()),
            StatsTarget::PerItem(counters) => counters.get(item).map(StatsCounters::cell),
        }
    }

    /// Slots written by this target.
    pub fn slots(&self) -> Vec<usize> {
        match self {
            StatsTarget::Disabled => Vec::new(),
            StatsTarget::Aggregate(counters) => vec![counters.slot()],
            StatsTarget::PerItem(counters) => counters.iter().map(StatsCounters::slot).collect(),
        }
    }
}

/// Element `(row, col)` of `op(X)` where `X` is stored at `data[base..]`.
#[inline]
pub(crate) fn op_element<T: Element>(
    data: &[T],
    base: usize,
    ld: usize,
    op: Operation,
    row: usize,
    col: usize,
) -> T {
    match op {
        Operation::N => data[base + row + col * ld],
        Operation::T => data[base + col + row * ld],
        Operation::C => data[base + col + row * ld].conj(),
    }
}

/// Computed block of C, scattered once every block has finished.
pub(crate) struct TileOutput<T> {
    /// Offset of the block's first element from the C pointer.
    pub offset: usize,
    pub rows: usize,
    pub cols: usize,
    /// Column-major, `rows` per column.
    pub values: Vec<T>,
}

pub(crate) fn scatter<T: Element>(c: &DevicePtr<T>, ldc: usize, tiles: Vec<TileOutput<T>>) {
    let mut data = c.buffer().write();
    let base = c.offset();
    for tile in tiles {
        for (j, column) in tile.values.chunks(tile.rows).enumerate().take(tile.cols) {
            let start = base + tile.offset + j * ldc;
            data[start..start + tile.rows].copy_from_slice(column);
        }
    }
}
