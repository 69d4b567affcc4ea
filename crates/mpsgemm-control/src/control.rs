//! Hijack control: the application-facing side of an engine handle.
//!
//! GEMM calls coming through [`HijackControl`] request the vendor mode,
//! exactly as the intercepted vendor API would. Whether they stay on the
//! vendor path or go to a tensor-core variant is then decided by the
//! compute-mode override set here (or taken from `MPSGEMM_COMPUTE_MODE`).
//!
//! Statistics getters synchronize the handle's stream before reading, so
//! the values they return always include every call issued so far.

use crate::error::{ControlError, Result};
use mpsgemm_common::{CallRecord, ComputeMode, EngineConfig};
use mpsgemm_kernels::{
    cgemm, cgemm_strided_batched, exp_stats, scale_ab, scale_c, sgemm, sgemm_strided_batched,
    Complex32, DevicePtr, Element, EngineHandle, ExpStats, GemmArgs, GemmReport, StridedBatch,
    StridedMatrix,
};
use tracing::{debug, info};

/// Environment variable selecting the initial compute-mode override.
pub const COMPUTE_MODE_ENV: &str = "MPSGEMM_COMPUTE_MODE";

/// Control surface wrapping one engine handle.
#[derive(Debug)]
pub struct HijackControl {
    handle: EngineHandle,
}

impl HijackControl {
    pub fn new(handle: EngineHandle) -> Self {
        Self { handle }
    }

    /// Create a handle from `config`.
    pub fn create(config: EngineConfig) -> Result<Self> {
        Ok(Self::new(EngineHandle::create(config)?))
    }

    /// Create a handle from `MPSGEMM_*` variables, including the initial
    /// compute-mode override.
    pub fn from_env() -> Result<Self> {
        let mut control = Self::create(EngineConfig::from_env()?)?;
        if let Ok(value) = std::env::var(COMPUTE_MODE_ENV) {
            let mode = match value.parse::<ComputeMode>() {
                Ok(mode) => mode,
                Err(_) => return Err(ControlError::InvalidComputeMode { key: COMPUTE_MODE_ENV, value }),
            };
            control.set_compute_mode(mode)?;
            info!(%mode, "compute mode taken from environment");
        }
        Ok(control)
    }

    pub fn handle(&self) -> &EngineHandle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut EngineHandle {
        &mut self.handle
    }

    pub fn into_handle(self) -> EngineHandle {
        self.handle
    }

    pub fn destroy(&mut self) -> Result<()> {
        Ok(self.handle.destroy()?)
    }

    // -- hijacked GEMM ----------------------------------------------------

    pub fn sgemm(&mut self, args: &GemmArgs<f32>) -> Result<GemmReport> {
        Ok(sgemm(&mut self.handle, args, ComputeMode::Cublas)?)
    }

    pub fn cgemm(&mut self, args: &GemmArgs<Complex32>) -> Result<GemmReport> {
        Ok(cgemm(&mut self.handle, args, ComputeMode::Cublas)?)
    }

    pub fn sgemm_strided_batched(
        &mut self,
        args: &GemmArgs<f32>,
        batch: &StridedBatch,
    ) -> Result<GemmReport> {
        Ok(sgemm_strided_batched(&mut self.handle, args, batch, ComputeMode::Cublas)?)
    }

    pub fn cgemm_strided_batched(
        &mut self,
        args: &GemmArgs<Complex32>,
        batch: &StridedBatch,
    ) -> Result<GemmReport> {
        Ok(cgemm_strided_batched(&mut self.handle, args, batch, ComputeMode::Cublas)?)
    }

    // -- compute mode -----------------------------------------------------

    /// Route every subsequent GEMM to `mode`.
    pub fn set_compute_mode(&mut self, mode: ComputeMode) -> Result<()> {
        Ok(self.handle.set_compute_mode_override(Some(mode))?)
    }

    /// Return to the mode each call requests.
    pub fn unset_compute_mode(&mut self) -> Result<()> {
        Ok(self.handle.set_compute_mode_override(None)?)
    }

    pub fn compute_mode(&self) -> Option<ComputeMode> {
        self.handle.compute_mode_override()
    }

    // -- statistics -------------------------------------------------------

    pub fn enable_exp_stats(&mut self) -> Result<()> {
        Ok(self.handle.set_exp_stats_enabled(true)?)
    }

    pub fn disable_exp_stats(&mut self) -> Result<()> {
        Ok(self.handle.set_exp_stats_enabled(false)?)
    }

    pub fn is_exp_stats_enabled(&self) -> bool {
        self.handle.exp_stats_enabled()
    }

    pub fn set_exp_stats_params(&mut self, ignore_threshold: f32, lost_threshold: f32) -> Result<()> {
        Ok(self.handle.set_exp_stats_params(ignore_threshold, lost_threshold)?)
    }

    /// `(lost, total)` of statistics slot `slot`.
    pub fn get_exp_stats(&mut self, slot: usize) -> Result<(u64, u64)> {
        self.handle.synchronize()?;
        Ok(self.handle.exp_stats(slot)?.as_pair())
    }

    /// Slot written most recently.
    pub fn get_current_buffer_id(&self) -> usize {
        self.handle.current_stats_slot()
    }

    /// Rewind the statistics cursor so the next call writes slot 0.
    pub fn reset_buffer_id(&mut self) -> Result<()> {
        Ok(self.handle.reset_stats_cursor()?)
    }

    /// Inspect a column-major `m x n` matrix (or strided batch of them) and
    /// record its statistics into a fresh slot, returned.
    pub fn exp_stats<T: Element>(
        &mut self,
        m: usize,
        n: usize,
        ptr: &DevicePtr<T>,
        ld: usize,
        batch_count: usize,
        stride: usize,
    ) -> Result<usize> {
        let matrix = StridedMatrix { ptr: ptr.clone(), rows: m, cols: n, ld, batch_count, stride };
        Ok(exp_stats(&mut self.handle, &matrix)?)
    }

    fn last_stats(&mut self) -> Result<Vec<ExpStats>> {
        self.handle.synchronize()?;
        let slots = self.handle.last_slots().to_vec();
        let mut stats = Vec::with_capacity(slots.len());
        for slot in slots {
            stats.push(self.handle.exp_stats(slot)?);
        }
        Ok(stats)
    }

    /// `(lost, total)` of every slot the last call wrote, in batch order.
    pub fn get_last_exp_stats(&mut self) -> Result<Vec<(u64, u64)>> {
        Ok(self.last_stats()?.iter().map(ExpStats::as_pair).collect())
    }

    /// Lost/total over all slots of the last call; 0 when nothing was counted.
    pub fn get_lost_rate(&mut self) -> Result<f64> {
        let merged = self.last_stats()?.into_iter().fold(ExpStats::default(), ExpStats::merge);
        Ok(merged.ratio())
    }

    /// Lost/total of one slot.
    pub fn get_lost_ratio(&mut self, slot: usize) -> Result<f64> {
        self.handle.synchronize()?;
        Ok(self.handle.exp_stats(slot)?.ratio())
    }

    pub fn get_global_lost_ratio_threshold(&self) -> f64 {
        self.handle.config().loss_ratio_threshold
    }

    pub fn set_global_lost_ratio_threshold(&mut self, threshold: f64) -> Result<()> {
        Ok(self.handle.set_loss_ratio_threshold(threshold)?)
    }

    /// Whether the last call's lost rate exceeds the global threshold.
    pub fn is_lost_rate_above_threshold(&mut self) -> Result<bool> {
        let rate = self.get_lost_rate()?;
        let threshold = self.get_global_lost_ratio_threshold();
        debug!(rate, threshold, "checked lost rate");
        Ok(rate > threshold)
    }

    pub fn legacy_size_threshold(&self) -> u64 {
        self.handle.config().legacy_size_threshold
    }

    pub fn set_legacy_size_threshold(&mut self, threshold: u64) -> Result<()> {
        Ok(self.handle.set_legacy_size_threshold(threshold)?)
    }

    // -- dynamic launch ---------------------------------------------------

    pub fn get_next_dynamic_launch_flag_buffer_id(&mut self) -> Result<usize> {
        Ok(self.handle.advance_flag()?)
    }

    /// Make subsequent tensor-core GEMMs choose their mode from flag `id`.
    pub fn set_dynamic_launch_flag_buffer_id(&mut self, id: usize) -> Result<()> {
        Ok(self.handle.bind_flag(id)?)
    }

    pub fn unset_dynamic_launch_flag_buffer_id(&mut self) -> Result<Option<usize>> {
        Ok(self.handle.unbind_flag()?)
    }

    /// Set flag `id` from the loss ratios of slots `a_slot` and `b_slot`.
    pub fn dynamic_launch_flag_by_ratio(
        &mut self,
        id: usize,
        a_slot: usize,
        b_slot: usize,
        ratio_threshold: f64,
    ) -> Result<()> {
        Ok(self.handle.derive_flag(id, a_slot, b_slot, ratio_threshold)?)
    }

    pub fn get_dynamic_launch_flag(&mut self, id: usize) -> Result<bool> {
        self.handle.synchronize()?;
        Ok(self.handle.read_flag(id)?)
    }

    /// Scale an operand by the exponent stored with flag `id`.
    pub fn scale_ab<T: Element>(&self, id: usize, matrix: &StridedMatrix<T>) -> Result<()> {
        Ok(scale_ab(&self.handle, id, matrix)?)
    }

    /// Undo the operand scaling on a product.
    pub fn scale_c<T: Element>(&self, id: usize, matrix: &StridedMatrix<T>) -> Result<()> {
        Ok(scale_c(&self.handle, id, matrix)?)
    }

    // -- replay log -------------------------------------------------------

    /// Replay-log line of the most recent GEMM.
    pub fn get_last_called_function(&self) -> Option<String> {
        self.handle.last_call().map(CallRecord::to_string)
    }

    /// Replace the last-call record with a parsed replay-log line.
    pub fn set_last_called_function(&mut self, line: &str) -> Result<()> {
        let record: CallRecord = line.parse()?;
        self.handle.set_last_call(Some(record));
        Ok(())
    }

    pub fn clear_last_called_function(&mut self) {
        self.handle.set_last_call(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpsgemm_common::Status;

    fn control() -> HijackControl {
        HijackControl::create(EngineConfig::default()).unwrap()
    }

    #[test]
    fn compute_mode_override_roundtrip() {
        let mut c = control();
        assert_eq!(c.compute_mode(), None);
        c.set_compute_mode(ComputeMode::Tf32Tc).unwrap();
        assert_eq!(c.compute_mode(), Some(ComputeMode::Tf32Tc));
        c.unset_compute_mode().unwrap();
        assert_eq!(c.compute_mode(), None);
    }

    #[test]
    fn thresholds_are_validated() {
        let mut c = control();
        assert_eq!(c.get_global_lost_ratio_threshold(), 0.1);
        c.set_global_lost_ratio_threshold(0.25).unwrap();
        assert_eq!(c.get_global_lost_ratio_threshold(), 0.25);
        let err = c.set_global_lost_ratio_threshold(2.0).unwrap_err();
        assert_eq!(err.status(), Status::InvalidValue);
        assert_eq!(c.get_global_lost_ratio_threshold(), 0.25);
    }

    #[test]
    fn last_called_function_parse_and_clear() {
        let mut c = control();
        assert_eq!(c.get_last_called_function(), None);
        let line = "[mpsgemm LOG] cgemm op=(C, N), shape=(3, 4, 5), mode=TF32TCEC";
        c.set_last_called_function(line).unwrap();
        assert_eq!(c.get_last_called_function().as_deref(), Some(line));
        assert!(c.set_last_called_function("cgemm").is_err());
        c.clear_last_called_function();
        assert_eq!(c.get_last_called_function(), None);
    }

    #[test]
    fn empty_last_call_has_zero_rate() {
        let mut c = control();
        assert!(c.get_last_exp_stats().unwrap().is_empty());
        assert_eq!(c.get_lost_rate().unwrap(), 0.0);
        assert!(!c.is_lost_rate_above_threshold().unwrap());
    }

    #[test]
    fn destroyed_control_reports_not_initialized() {
        let mut c = control();
        c.destroy().unwrap();
        let err = c.enable_exp_stats().unwrap_err();
        assert_eq!(err.status(), Status::NotInitialized);
    }
}
