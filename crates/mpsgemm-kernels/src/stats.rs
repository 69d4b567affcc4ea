//! Exponent statistics ring.
//!
//! A fixed number of device-resident counter slots, each recording how
//! many inspected values a GEMM produced and how many of them were at risk
//! under the reduced-precision format. A cursor walks the slots cyclically;
//! a slot is only overwritten once the cursor wraps back onto it. Results
//! reach the host through an asynchronous download into a host mirror, so
//! reads are only meaningful after the stream has been synchronized.

use crate::primitive::{exponent_of, Inspection, RiskPredicate};
use crate::stream::Stream;
use mpsgemm_common::{MpsgemmError, Result};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

const NO_EXPONENT: i32 = i32::MIN;

/// Counter snapshot of one slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpStats {
    pub lost: u64,
    pub total: u64,
    /// Largest `floor(log2(|v|))` among inspected values.
    pub max_exponent: Option<i32>,
}

impl ExpStats {
    /// Fraction of inspected values that were at risk; zero when nothing was inspected.
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.lost as f64 / self.total as f64
        }
    }

    /// `(lost, total)`.
    pub fn as_pair(&self) -> (u64, u64) {
        (self.lost, self.total)
    }

    #[must_use]
    pub fn merge(self, other: ExpStats) -> ExpStats {
        ExpStats {
            lost: self.lost + other.lost,
            total: self.total + other.total,
            max_exponent: self.max_exponent.max(other.max_exponent),
        }
    }
}

/// Device-side counters of one slot.
#[derive(Debug)]
pub struct StatsCell {
    lost: AtomicU64,
    total: AtomicU64,
    max_exponent: AtomicI32,
}

impl Default for StatsCell {
    fn default() -> Self {
        Self {
            lost: AtomicU64::new(0),
            total: AtomicU64::new(0),
            max_exponent: AtomicI32::new(NO_EXPONENT),
        }
    }
}

impl StatsCell {
    fn reset(&self) {
        self.lost.store(0, Ordering::SeqCst);
        self.total.store(0, Ordering::SeqCst);
        self.max_exponent.store(NO_EXPONENT, Ordering::SeqCst);
    }

    pub(crate) fn accumulate(&self, local: &LocalStats) {
        if local.total > 0 {
            self.total.fetch_add(local.total, Ordering::Relaxed);
            self.lost.fetch_add(local.lost, Ordering::Relaxed);
        }
        if local.max_exponent != NO_EXPONENT {
            self.max_exponent.fetch_max(local.max_exponent, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> ExpStats {
        let max = self.max_exponent.load(Ordering::SeqCst);
        ExpStats {
            lost: self.lost.load(Ordering::SeqCst),
            total: self.total.load(Ordering::SeqCst),
            max_exponent: (max != NO_EXPONENT).then_some(max),
        }
    }
}

/// Per-block counters, merged into a [`StatsCell`] once per block.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LocalStats {
    lost: u64,
    total: u64,
    max_exponent: i32,
}

impl Default for LocalStats {
    fn default() -> Self {
        Self { lost: 0, total: 0, max_exponent: NO_EXPONENT }
    }
}

impl LocalStats {
    pub(crate) fn record(&mut self, predicate: &dyn RiskPredicate, magnitude: f32) {
        match predicate.classify(magnitude) {
            Inspection::Ignored => return,
            Inspection::Kept => self.total += 1,
            Inspection::Lost => {
                self.total += 1;
                self.lost += 1;
            }
        }
        if let Some(e) = exponent_of(magnitude) {
            self.max_exponent = self.max_exponent.max(e);
        }
    }
}

/// Device handle to one slot, captured by kernels.
#[derive(Debug, Clone)]
pub struct StatsCounters {
    cells: Arc<[StatsCell]>,
    slot: usize,
}

impl StatsCounters {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub(crate) fn cell(&self) -> &StatsCell {
        &self.cells[self.slot]
    }
}

fn allocate_cells(size: usize) -> Result<Arc<[StatsCell]>> {
    let mut cells = Vec::new();
    cells
        .try_reserve_exact(size)
        .map_err(|_| MpsgemmError::Allocation { what: "statistics ring", size })?;
    cells.extend((0..size).map(|_| StatsCell::default()));
    Ok(Arc::from(cells))
}

/// Cyclic buffer of statistics slots.
#[derive(Debug)]
pub struct StatisticsRing {
    device: Arc<[StatsCell]>,
    host: Arc<Mutex<Vec<ExpStats>>>,
    cursor: usize,
    unread: Vec<bool>,
}

impl StatisticsRing {
    /// Allocate `size` slots. The first [`advance`](Self::advance) yields slot 0.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(MpsgemmError::InvalidArgument("statistics ring size must be > 0".into()));
        }
        let device = allocate_cells(size)?;
        let mut host = Vec::new();
        host.try_reserve_exact(size)
            .map_err(|_| MpsgemmError::Allocation { what: "statistics mirror", size })?;
        host.resize(size, ExpStats::default());
        Ok(Self { device, host: Arc::new(Mutex::new(host)), cursor: size - 1, unread: vec![false; size] })
    }

    pub fn len(&self) -> usize {
        self.device.len()
    }

    pub fn is_empty(&self) -> bool {
        self.device.is_empty()
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        if slot >= self.len() {
            return Err(MpsgemmError::InvalidArgument(format!(
                "statistics slot {slot} out of range (ring has {})",
                self.len()
            )));
        }
        Ok(())
    }

    /// Move to the next slot, wrapping at the end, and return it.
    pub fn advance(&mut self) -> usize {
        self.cursor = (self.cursor + 1) % self.len();
        if self.unread[self.cursor] {
            debug!(slot = self.cursor, "statistics slot reused before it was read");
            self.unread[self.cursor] = false;
        }
        self.cursor
    }

    /// Most recently advanced slot.
    pub fn current(&self) -> usize {
        self.cursor
    }

    /// Rewind so that the next advance yields slot 0.
    pub fn reset(&mut self) {
        self.cursor = self.len() - 1;
    }

    /// Enqueue zeroing of `slot`.
    pub fn zero(&self, stream: &Stream, slot: usize) -> Result<()> {
        self.check_slot(slot)?;
        let cells = Arc::clone(&self.device);
        stream.enqueue("stats_zero", move || {
            cells[slot].reset();
            Ok(())
        })
    }

    /// Device pointer for kernels writing into `slot`.
    pub fn counters_of(&self, slot: usize) -> Result<StatsCounters> {
        self.check_slot(slot)?;
        Ok(StatsCounters { cells: Arc::clone(&self.device), slot })
    }

    /// Enqueue the device-to-host copy of `slot`.
    pub fn download(&mut self, stream: &Stream, slot: usize) -> Result<()> {
        self.check_slot(slot)?;
        let cells = Arc::clone(&self.device);
        let host = Arc::clone(&self.host);
        stream.enqueue("stats_download", move || {
            let snapshot = cells[slot].snapshot();
            host.lock().unwrap_or_else(PoisonError::into_inner)[slot] = snapshot;
            Ok(())
        })?;
        self.unread[slot] = true;
        Ok(())
    }

    /// Host copy of `slot` as of the last completed download.
    pub fn read(&mut self, slot: usize) -> Result<ExpStats> {
        self.check_slot(slot)?;
        self.unread[slot] = false;
        Ok(self.host.lock().unwrap_or_else(PoisonError::into_inner)[slot])
    }

    /// Drop the ring storage; queued work keeps its own references.
    pub(crate) fn release(&mut self) {
        self.device = Arc::from(Vec::new());
        self.host = Arc::new(Mutex::new(Vec::new()));
        self.unread.clear();
        self.cursor = 0;
    }
}
