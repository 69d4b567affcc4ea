//! Engine handle: per-context state of the dispatcher.
//!
//! A handle owns the statistics and flag rings, the execution stream and
//! the numeric thresholds, and shares the process-wide module table.
//! [`EngineHandleBuilder`] is the uninitialized state; `create()` yields
//! an active handle and `destroy()` moves it to its terminal state.

use crate::device::DeviceTopology;
use crate::dynamic_launch::{DynamicLaunchPolicy, FlagRing};
use crate::module_table::ModuleTable;
use crate::primitive::{EmulatedTensorCore, ExponentThresholds, MatmulPrimitive, RiskPredicate};
use crate::stats::{ExpStats, StatisticsRing};
use crate::stream::Stream;
use mpsgemm_common::{
    BatchStatsMode, CallRecord, ComputeMode, EngineConfig, MpsgemmError, Result,
};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lifecycle state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Active,
    Destroyed,
}

impl HandleState {
    pub fn as_str(self) -> &'static str {
        match self {
            HandleState::Active => "active",
            HandleState::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configures a handle before creation.
#[derive(Debug)]
pub struct EngineHandleBuilder {
    config: EngineConfig,
    topology: Option<DeviceTopology>,
    primitive: Arc<dyn MatmulPrimitive>,
    predicate: Option<Arc<dyn RiskPredicate>>,
}

impl EngineHandleBuilder {
    /// Use a fixed topology instead of querying the device.
    #[must_use]
    pub fn with_topology(mut self, topology: DeviceTopology) -> Self {
        self.topology = Some(topology);
        self
    }

    #[must_use]
    pub fn with_primitive(mut self, primitive: Arc<dyn MatmulPrimitive>) -> Self {
        self.primitive = primitive;
        self
    }

    /// Replace the threshold predicate built from the configuration.
    #[must_use]
    pub fn with_predicate(mut self, predicate: Arc<dyn RiskPredicate>) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Allocate the rings and the stream; no handle exists if this fails.
    pub fn create(self) -> Result<EngineHandle> {
        self.config.validate()?;
        let mut topology = self.topology.unwrap_or_else(DeviceTopology::emulated);
        if let Some(count) = self.config.multiprocessor_count {
            topology = topology.with_multiprocessor_count(count);
        }
        let stats = StatisticsRing::new(self.config.stats_ring_size)?;
        let flags = FlagRing::new(self.config.flag_ring_size)?;
        let stream = Stream::new("engine")?;
        let predicate = self.predicate.unwrap_or_else(|| {
            Arc::new(ExponentThresholds::new(self.config.ignore_threshold, self.config.lost_threshold))
        });

        info!(
            device = %topology.name,
            multiprocessors = topology.multiprocessor_count,
            primitive = self.primitive.name(),
            stats_slots = stats.len(),
            flag_slots = flags.len(),
            "created engine handle"
        );

        Ok(EngineHandle {
            state: HandleState::Active,
            exp_stats_enabled: self.config.exp_stats_enabled,
            config: self.config,
            topology,
            table: ModuleTable::shared(),
            primitive: self.primitive,
            predicate,
            stats,
            flags,
            stream,
            compute_mode_override: None,
            dynamic_policy: DynamicLaunchPolicy::default(),
            suppress_reinit: false,
            last_slots: Vec::new(),
            last_call: None,
        })
    }
}

/// Active dispatcher context.
#[derive(Debug)]
pub struct EngineHandle {
    state: HandleState,
    config: EngineConfig,
    topology: DeviceTopology,
    table: Arc<ModuleTable>,
    primitive: Arc<dyn MatmulPrimitive>,
    predicate: Arc<dyn RiskPredicate>,
    stats: StatisticsRing,
    flags: FlagRing,
    stream: Stream,
    exp_stats_enabled: bool,
    compute_mode_override: Option<ComputeMode>,
    dynamic_policy: DynamicLaunchPolicy,
    suppress_reinit: bool,
    last_slots: Vec<usize>,
    last_call: Option<CallRecord>,
}

impl EngineHandle {
    pub fn builder(config: EngineConfig) -> EngineHandleBuilder {
        EngineHandleBuilder {
            config,
            topology: None,
            primitive: Arc::new(EmulatedTensorCore),
            predicate: None,
        }
    }

    /// Create a handle on the emulated device.
    pub fn create(config: EngineConfig) -> Result<Self> {
        Self::builder(config).create()
    }

    /// Release the rings. Outstanding work is not waited for.
    pub fn destroy(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.stats.release();
        self.flags.release();
        self.last_slots.clear();
        self.state = HandleState::Destroyed;
        debug!("destroyed engine handle");
        Ok(())
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        match self.state {
            HandleState::Active => Ok(()),
            other => Err(MpsgemmError::InvalidState { expected: "active", actual: other.as_str() }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn topology(&self) -> &DeviceTopology {
        &self.topology
    }

    pub fn table(&self) -> &ModuleTable {
        &self.table
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub(crate) fn primitive(&self) -> &Arc<dyn MatmulPrimitive> {
        &self.primitive
    }

    pub(crate) fn predicate(&self) -> &Arc<dyn RiskPredicate> {
        &self.predicate
    }

    pub(crate) fn rings_mut(&mut self) -> (&mut StatisticsRing, &Stream) {
        (&mut self.stats, &self.stream)
    }

    pub(crate) fn flags(&self) -> &FlagRing {
        &self.flags
    }

    /// Wait for all queued work and surface any deferred kernel failure.
    pub fn synchronize(&self) -> Result<()> {
        self.ensure_active()?;
        self.stream.synchronize()
    }

    // -- statistics -------------------------------------------------------

    pub fn set_exp_stats_enabled(&mut self, enabled: bool) -> Result<()> {
        self.ensure_active()?;
        self.exp_stats_enabled = enabled;
        Ok(())
    }

    pub fn exp_stats_enabled(&self) -> bool {
        self.exp_stats_enabled
    }

    /// Replace the threshold predicate with new ignore/lost thresholds.
    pub fn set_exp_stats_params(&mut self, ignore_threshold: f32, lost_threshold: f32) -> Result<()> {
        self.ensure_active()?;
        let mut config = self.config.clone();
        config.ignore_threshold = ignore_threshold;
        config.lost_threshold = lost_threshold;
        config.validate()?;
        self.config = config;
        self.predicate = Arc::new(ExponentThresholds::new(ignore_threshold, lost_threshold));
        if lost_threshold <= ignore_threshold {
            warn!(
                ignore_threshold,
                lost_threshold,
                "lost threshold does not exceed ignore threshold; no value can be flagged"
            );
        } else {
            debug!(ignore_threshold, lost_threshold, "updated statistics thresholds");
        }
        Ok(())
    }

    pub fn set_loss_ratio_threshold(&mut self, threshold: f64) -> Result<()> {
        self.update_config(|c| c.loss_ratio_threshold = threshold)
    }

    pub fn set_legacy_size_threshold(&mut self, threshold: u64) -> Result<()> {
        self.update_config(|c| c.legacy_size_threshold = threshold)
    }

    pub fn set_batch_decompose_threshold(&mut self, threshold: u64) -> Result<()> {
        self.update_config(|c| c.batch_decompose_threshold = threshold)
    }

    pub fn set_batch_stats_mode(&mut self, mode: BatchStatsMode) -> Result<()> {
        self.update_config(|c| c.batch_stats_mode = mode)
    }

    fn update_config(&mut self, apply: impl FnOnce(&mut EngineConfig)) -> Result<()> {
        self.ensure_active()?;
        let mut config = self.config.clone();
        apply(&mut config);
        config.validate()?;
        self.config = config;
        Ok(())
    }

    /// Advance the statistics cursor; used by the stand-alone inspection path.
    pub fn advance_stats_slot(&mut self) -> Result<usize> {
        self.ensure_active()?;
        Ok(self.stats.advance())
    }

    pub fn current_stats_slot(&self) -> usize {
        self.stats.current()
    }

    pub fn stats_ring_len(&self) -> usize {
        self.stats.len()
    }

    /// Rewind the statistics cursor to slot 0.
    pub fn reset_stats_cursor(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.stats.reset();
        Ok(())
    }

    /// Host copy of a slot; call [`synchronize`](Self::synchronize) first.
    pub fn exp_stats(&mut self, slot: usize) -> Result<ExpStats> {
        self.ensure_active()?;
        self.stats.read(slot)
    }

    /// Slots written by the most recent tensor-core call.
    pub fn last_slots(&self) -> &[usize] {
        &self.last_slots
    }

    pub(crate) fn set_last_slots(&mut self, slots: Vec<usize>) {
        self.last_slots = slots;
    }

    pub(crate) fn is_reinit_suppressed(&self) -> bool {
        self.suppress_reinit
    }

    pub(crate) fn set_reinit_suppressed(&mut self, suppressed: bool) {
        self.suppress_reinit = suppressed;
    }

    // -- compute mode -----------------------------------------------------

    /// Force every GEMM to `mode`, whatever the caller requests.
    pub fn set_compute_mode_override(&mut self, mode: Option<ComputeMode>) -> Result<()> {
        self.ensure_active()?;
        if let Some(mode) = mode {
            debug!(%mode, "compute mode override set");
        }
        self.compute_mode_override = mode;
        Ok(())
    }

    pub fn compute_mode_override(&self) -> Option<ComputeMode> {
        self.compute_mode_override
    }

    // -- dynamic launch ---------------------------------------------------

    pub fn dynamic_policy(&self) -> DynamicLaunchPolicy {
        self.dynamic_policy
    }

    pub fn set_dynamic_policy(&mut self, policy: DynamicLaunchPolicy) -> Result<()> {
        self.ensure_active()?;
        self.dynamic_policy = policy;
        Ok(())
    }

    pub fn advance_flag(&mut self) -> Result<usize> {
        self.ensure_active()?;
        Ok(self.flags.advance())
    }

    pub fn bind_flag(&mut self, id: usize) -> Result<()> {
        self.ensure_active()?;
        self.flags.bind(id)
    }

    pub fn unbind_flag(&mut self) -> Result<Option<usize>> {
        self.ensure_active()?;
        Ok(self.flags.unbind())
    }

    pub fn bound_flag(&self) -> Option<usize> {
        self.flags.bound()
    }

    /// Enqueue derivation of flag `id`: raised when the loss ratio of slot
    /// `a_slot` or `b_slot` exceeds `threshold`.
    pub fn derive_flag(&mut self, id: usize, a_slot: usize, b_slot: usize, threshold: f64) -> Result<()> {
        self.ensure_active()?;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(MpsgemmError::InvalidArgument(format!(
                "ratio threshold must be within [0, 1], got {threshold}"
            )));
        }
        self.flags.derive(&self.stream, id, &self.stats, a_slot, b_slot, threshold)
    }

    pub fn read_flag(&self, id: usize) -> Result<bool> {
        self.ensure_active()?;
        self.flags.read(id)
    }

    pub fn read_max_exponent(&self, id: usize) -> Result<i32> {
        self.ensure_active()?;
        self.flags.read_max_exponent(id)
    }

    // -- replay log -------------------------------------------------------

    pub fn last_call(&self) -> Option<&CallRecord> {
        self.last_call.as_ref()
    }

    pub fn set_last_call(&mut self, record: Option<CallRecord>) {
        self.last_call = record;
    }
}
