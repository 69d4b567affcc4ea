//! Dynamic launch flags.
//!
//! A flag is derived on the device from two statistics slots (one per
//! operand) and read by a later GEMM at execution time to choose between a
//! cheap and an escalated kernel, without a host round trip. Each flag slot
//! also keeps the larger of the two operands' max exponents so the
//! operands can be rescaled before a reduced-range multiply.

use crate::stats::{ExpStats, StatisticsRing};
use crate::stream::Stream;
use mpsgemm_common::{MpsgemmError, Result, TensorCoreMode};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Exponent operands are scaled towards before an FP16 multiply.
pub const SCALE_TARGET_EXPONENT: i32 = 14;

/// Whether either operand's loss ratio exceeds `threshold`.
pub fn derive_flag(a: ExpStats, b: ExpStats, threshold: f64) -> bool {
    a.ratio().max(b.ratio()) > threshold
}

/// Kernels a dynamic launch chooses between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicLaunchPolicy {
    /// Used while the flag is clear.
    pub cheap: TensorCoreMode,
    /// Used once the flag is set.
    pub escalate: TensorCoreMode,
}

impl Default for DynamicLaunchPolicy {
    fn default() -> Self {
        Self { cheap: TensorCoreMode::Fp16Tcec, escalate: TensorCoreMode::Tf32Tcec }
    }
}

impl DynamicLaunchPolicy {
    pub fn select(&self, flag: bool) -> TensorCoreMode {
        if flag {
            self.escalate
        } else {
            self.cheap
        }
    }
}

/// Device-side flag slot.
#[derive(Debug, Default)]
pub struct FlagCell {
    flag: AtomicBool,
    max_exponent: AtomicI32,
}

impl FlagCell {
    pub fn flag(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn max_exponent(&self) -> i32 {
        self.max_exponent.load(Ordering::SeqCst)
    }
}

/// Device handle to one flag slot, captured by kernels.
#[derive(Debug, Clone)]
pub struct FlagHandle {
    cells: Arc<[FlagCell]>,
    id: usize,
}

impl FlagHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn cell(&self) -> &FlagCell {
        &self.cells[self.id]
    }
}

fn allocate_flags(size: usize) -> Result<Arc<[FlagCell]>> {
    let mut cells = Vec::new();
    cells
        .try_reserve_exact(size)
        .map_err(|_| MpsgemmError::Allocation { what: "flag ring", size })?;
    cells.extend((0..size).map(|_| FlagCell::default()));
    Ok(Arc::from(cells))
}

/// Cyclic buffer of flag slots, with at most one slot bound for dispatch.
#[derive(Debug)]
pub struct FlagRing {
    cells: Arc<[FlagCell]>,
    cursor: usize,
    bound: Option<usize>,
}

impl FlagRing {
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(MpsgemmError::InvalidArgument("flag ring size must be > 0".into()));
        }
        Ok(Self { cells: allocate_flags(size)?, cursor: size - 1, bound: None })
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    fn check_id(&self, id: usize) -> Result<()> {
        if id >= self.len() {
            return Err(MpsgemmError::InvalidArgument(format!(
                "flag slot {id} out of range (ring has {})",
                self.len()
            )));
        }
        Ok(())
    }

    /// Next flag slot, wrapping at the end.
    pub fn advance(&mut self) -> usize {
        self.cursor = (self.cursor + 1) % self.len();
        self.cursor
    }

    /// Make subsequent tensor-core GEMMs read flag `id`.
    pub fn bind(&mut self, id: usize) -> Result<()> {
        self.check_id(id)?;
        debug!(flag = id, "bound dynamic launch flag");
        self.bound = Some(id);
        Ok(())
    }

    /// Return to static dispatch; yields the previously bound slot.
    pub fn unbind(&mut self) -> Option<usize> {
        self.bound.take()
    }

    pub fn bound(&self) -> Option<usize> {
        self.bound
    }

    pub fn handle(&self, id: usize) -> Result<FlagHandle> {
        self.check_id(id)?;
        Ok(FlagHandle { cells: Arc::clone(&self.cells), id })
    }

    /// Enqueue derivation of flag `id` from statistics slots `a_slot` and `b_slot`.
    pub fn derive(
        &self,
        stream: &Stream,
        id: usize,
        stats: &StatisticsRing,
        a_slot: usize,
        b_slot: usize,
        threshold: f64,
    ) -> Result<()> {
        let flag = self.handle(id)?;
        let a = stats.counters_of(a_slot)?;
        let b = stats.counters_of(b_slot)?;
        stream.enqueue("flag_derive", move || {
            let (sa, sb) = (a.cell().snapshot(), b.cell().snapshot());
            let cell = flag.cell();
            cell.flag.store(derive_flag(sa, sb, threshold), Ordering::SeqCst);
            let max = sa.max_exponent.max(sb.max_exponent).unwrap_or(0);
            cell.max_exponent.store(max, Ordering::SeqCst);
            Ok(())
        })
    }

    /// Host read of flag `id`; meaningful after the stream has been synchronized.
    pub fn read(&self, id: usize) -> Result<bool> {
        self.check_id(id)?;
        Ok(self.cells[id].flag())
    }

    /// Host read of the max exponent stored with flag `id`.
    pub fn read_max_exponent(&self, id: usize) -> Result<i32> {
        self.check_id(id)?;
        Ok(self.cells[id].max_exponent())
    }

    pub(crate) fn release(&mut self) {
        self.cells = Arc::from(Vec::new());
        self.bound = None;
        self.cursor = 0;
    }
}
