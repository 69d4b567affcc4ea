//! GEMM dispatch.
//!
//! The public entry points validate a call, resolve the compute mode that
//! will actually run (override, legacy threshold), log it in replay format
//! and route it: vendor modes go to the reference pass-through, tensor-core
//! modes go through the module table. For the latter the dispatcher picks a
//! tile variant with the occupancy heuristic, reserves statistics slots and
//! launches one kernel (or one per item for decomposed large batches).

use crate::device::DeviceTopology;
use crate::dynamic_launch::{FlagHandle, SCALE_TARGET_EXPONENT};
use crate::element::Element;
use crate::handle::EngineHandle;
use crate::kernels::{
    run_exp_stats, run_reference_gemm, run_scale, run_tensor_core_gemm, GemmOperands, GemmProblem,
    ReferencePrecision, StatsTarget, StridedMatrix, TensorCoreKernel,
};
use crate::launch::LaunchConfig;
use crate::memory::DevicePtr;
use crate::module_table::{KernelEntry, ModuleVariant, TableKind, TileShape};
use crate::signature::derive_signature;
use crate::stats::StatsCounters;
use mpsgemm_common::{
    BatchStatsMode, CallRecord, ComputeMode, ElementKind, MpsgemmError, Operation, Result,
    TensorCoreMode,
};
use num_complex::Complex32;
use std::sync::Arc;
use tracing::debug;

// ---------------------------------------------------------------------------
// Call arguments and report
// ---------------------------------------------------------------------------

/// Arguments of `C = alpha * op(A) * op(B) + beta * C` (column-major).
#[derive(Debug, Clone)]
pub struct GemmArgs<T> {
    pub op_a: Operation,
    pub op_b: Operation,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub alpha: T,
    pub a: DevicePtr<T>,
    pub lda: usize,
    pub b: DevicePtr<T>,
    pub ldb: usize,
    pub beta: T,
    pub c: DevicePtr<T>,
    pub ldc: usize,
}

/// Strides (in elements) and item count of a strided-batched call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StridedBatch {
    pub stride_a: usize,
    pub stride_b: usize,
    pub stride_c: usize,
    pub batch_count: usize,
}

/// Which kind of kernel served a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPath {
    /// A module-table variant chosen on the host.
    TensorCore,
    /// A conditional launch choosing its variant from a device flag.
    Dynamic,
    /// The vendor pass-through.
    Vendor,
}

/// What a dispatched call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GemmReport {
    /// Mode asked for by the caller.
    pub requested: ComputeMode,
    /// Mode that was dispatched after override and legacy routing. Dynamic
    /// launches run one of [`GemmReport::dynamic_modes`] instead.
    pub mode: ComputeMode,
    pub path: DispatchPath,
    /// Selected stage; for dynamic launches, the stage of the cheap variant.
    pub stage: Option<usize>,
    pub tile: Option<TileShape>,
    /// Statistics slots written, in batch order.
    pub stats_slots: Vec<usize>,
    pub launches: usize,
    pub decomposed: bool,
    pub dynamic_flag: Option<usize>,
    /// `(cheap, escalate)` modes of a dynamic launch; the flag picks one on the device.
    pub dynamic_modes: Option<(TensorCoreMode, TensorCoreMode)>,
}

impl GemmReport {
    fn new(mode: ComputeMode, path: DispatchPath) -> Self {
        Self {
            requested: mode,
            mode,
            path,
            stage: None,
            tile: None,
            stats_slots: Vec::new(),
            launches: 0,
            decomposed: false,
            dynamic_flag: None,
            dynamic_modes: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Public entry points
// ---------------------------------------------------------------------------

/// Real single-precision GEMM.
pub fn sgemm(handle: &mut EngineHandle, args: &GemmArgs<f32>, mode: ComputeMode) -> Result<GemmReport> {
    dispatch(handle, "sgemm", args, None, mode)
}

/// Complex single-precision GEMM.
pub fn cgemm(
    handle: &mut EngineHandle,
    args: &GemmArgs<Complex32>,
    mode: ComputeMode,
) -> Result<GemmReport> {
    dispatch(handle, "cgemm", args, None, mode)
}

/// Real strided-batched GEMM.
pub fn sgemm_strided_batched(
    handle: &mut EngineHandle,
    args: &GemmArgs<f32>,
    batch: &StridedBatch,
    mode: ComputeMode,
) -> Result<GemmReport> {
    dispatch(handle, "sgemm_strided_batched", args, Some(batch), mode)
}

/// Complex strided-batched GEMM.
pub fn cgemm_strided_batched(
    handle: &mut EngineHandle,
    args: &GemmArgs<Complex32>,
    batch: &StridedBatch,
    mode: ComputeMode,
) -> Result<GemmReport> {
    dispatch(handle, "cgemm_strided_batched", args, Some(batch), mode)
}

fn dispatch<T: Element>(
    handle: &mut EngineHandle,
    function: &'static str,
    args: &GemmArgs<T>,
    batch: Option<&StridedBatch>,
    requested: ComputeMode,
) -> Result<GemmReport> {
    handle.ensure_active()?;
    let problem = validate(args, batch)?;
    let operands = GemmOperands { a: args.a.clone(), b: args.b.clone(), c: args.c.clone() };
    let mode = effective_mode(handle, requested, &problem);

    let record = CallRecord::new(
        function,
        problem.op_a,
        problem.op_b,
        (problem.m as u64, problem.n as u64, problem.k as u64),
        batch.map(|b| b.batch_count as u64),
        mode,
    );
    debug!("{record}");
    handle.set_last_call(Some(record));

    let mut report = match (mode.tensor_core(), batch) {
        (None, _) => reference(handle, mode, &problem, &operands)?,
        (Some(tc), None) => gemm(handle, tc, &problem, &operands)?,
        (Some(tc), Some(_)) => gemm_strided_batched(handle, tc, &problem, &operands)?,
    };
    report.requested = requested;
    Ok(report)
}

fn effective_mode<T>(handle: &EngineHandle, requested: ComputeMode, problem: &GemmProblem<T>) -> ComputeMode {
    let mode = handle.compute_mode_override().unwrap_or(requested);
    let threshold = handle.config().legacy_size_threshold;
    let volume = (problem.m as u64).saturating_mul(problem.n as u64).saturating_mul(problem.k as u64);
    if threshold > 0 && volume < threshold && mode != ComputeMode::Cublas {
        debug!(volume, threshold, from = %mode, "routing small problem to legacy path");
        return ComputeMode::Cublas;
    }
    mode
}

fn validate<T: Element>(args: &GemmArgs<T>, batch: Option<&StridedBatch>) -> Result<GemmProblem<T>> {
    if args.m == 0 || args.n == 0 || args.k == 0 {
        return Err(MpsgemmError::InvalidArgument(format!(
            "dimensions must be non-zero, got m={} n={} k={}",
            args.m, args.n, args.k
        )));
    }
    let batch = batch.copied().unwrap_or(StridedBatch { stride_a: 0, stride_b: 0, stride_c: 0, batch_count: 1 });
    if batch.batch_count == 0 {
        return Err(MpsgemmError::InvalidArgument("batch_count must be non-zero".into()));
    }
    let problem = GemmProblem {
        op_a: args.op_a,
        op_b: args.op_b,
        m: args.m,
        n: args.n,
        k: args.k,
        alpha: args.alpha,
        beta: args.beta,
        lda: args.lda,
        ldb: args.ldb,
        ldc: args.ldc,
        stride_a: batch.stride_a,
        stride_b: batch.stride_b,
        stride_c: batch.stride_c,
        batch_count: batch.batch_count,
    };
    for (name, ld, rows) in [
        ("lda", args.lda, problem.a_dims().0),
        ("ldb", args.ldb, problem.b_dims().0),
        ("ldc", args.ldc, args.m),
    ] {
        if ld < rows {
            return Err(MpsgemmError::InvalidArgument(format!("{name}={ld} is smaller than {rows} rows")));
        }
    }
    let (a_span, b_span, c_span) = problem
        .spans()
        .ok_or_else(|| MpsgemmError::InvalidArgument("operand spans overflow the address space".into()))?;
    args.a.check_span("A", a_span)?;
    args.b.check_span("B", b_span)?;
    args.c.check_span("C", c_span)?;
    Ok(problem)
}

// ---------------------------------------------------------------------------
// Variant selection
// ---------------------------------------------------------------------------

/// Pick a stage for an `m x n` output (`batch_count` of them).
///
/// The largest tile is the default. Walking the stages smallest first, the
/// first stage whose next-larger neighbour would not produce more blocks than
/// `multiprocessors * blocks_per_sm` is taken instead, since the larger tile
/// would leave the device under-occupied. Growing `m` or `n` therefore only
/// ever moves the choice towards larger tiles.
pub fn select<'v>(
    variants: &'v [ModuleVariant],
    m: u64,
    n: u64,
    batch_count: u64,
    topology: &DeviceTopology,
    blocks_per_sm: u32,
) -> Option<(usize, &'v ModuleVariant)> {
    let last = variants.len().checked_sub(1)?;
    let target = topology.target_blocks(blocks_per_sm);
    let stage = (0..last)
        .find(|&stage| variants[stage + 1].blocks_for(m, n).saturating_mul(batch_count) <= target)
        .unwrap_or(last);
    Some((stage, &variants[stage]))
}

const fn operand_name(kind: ElementKind, batched: bool) -> &'static str {
    match (kind, batched) {
        (ElementKind::Real, false) => "real",
        (ElementKind::Real, true) => "real strided-batched",
        (ElementKind::Complex, false) => "complex",
        (ElementKind::Complex, true) => "complex strided-batched",
    }
}

/// A variant resolved for one launch.
#[derive(Debug, Clone)]
struct Planned {
    stage: usize,
    variant: ModuleVariant,
    kernel: TensorCoreKernel,
}

#[derive(Debug, Clone)]
enum KernelPlan {
    Static(Planned),
    Dynamic { flag: FlagHandle, cheap: Planned, escalate: Planned },
}

fn plan_static<T: Element>(
    handle: &EngineHandle,
    mode: TensorCoreMode,
    problem: &GemmProblem<T>,
    table: TableKind,
) -> Result<Planned> {
    let signature = derive_signature(mode, problem.op_a, problem.op_b, T::KIND);
    let batched = table == TableKind::StridedBatched;
    let batch = if batched { problem.batch_count as u64 } else { 1 };
    let (stage, variant) = select(
        handle.table().lookup(table, signature),
        problem.m as u64,
        problem.n as u64,
        batch,
        handle.topology(),
        handle.config().occupancy_blocks_per_sm,
    )
    .ok_or_else(|| MpsgemmError::LaunchFailed(format!("no kernel variant registered for {signature}")))?;

    if variant.entry != KernelEntry::new(T::KIND, batched) {
        return Err(MpsgemmError::OperandMismatch {
            entry: variant.entry.name().to_string(),
            operands: operand_name(T::KIND, batched),
        });
    }
    debug!(%signature, stage, tile = %variant.tile, batch, "selected kernel variant");
    Ok(Planned {
        stage,
        variant: *variant,
        kernel: TensorCoreKernel {
            primitive: Arc::clone(handle.primitive()),
            predicate: Arc::clone(handle.predicate()),
            mode,
            tile: variant.tile,
        },
    })
}

fn plan<T: Element>(
    handle: &EngineHandle,
    mode: TensorCoreMode,
    problem: &GemmProblem<T>,
    table: TableKind,
) -> Result<KernelPlan> {
    match handle.bound_flag() {
        Some(id) => {
            let policy = handle.dynamic_policy();
            Ok(KernelPlan::Dynamic {
                flag: handle.flags().handle(id)?,
                cheap: plan_static(handle, policy.cheap, problem, table)?,
                escalate: plan_static(handle, policy.escalate, problem, table)?,
            })
        }
        None => Ok(KernelPlan::Static(plan_static(handle, mode, problem, table)?)),
    }
}

// ---------------------------------------------------------------------------
// Launch orchestration
// ---------------------------------------------------------------------------

/// Reserve a statistics slot, or reuse the current one while
/// reinitialization is suppressed.
fn acquire_slot(handle: &mut EngineHandle) -> Result<StatsCounters> {
    let suppressed = handle.is_reinit_suppressed();
    let (ring, stream) = handle.rings_mut();
    let slot = if suppressed {
        ring.current()
    } else {
        let slot = ring.advance();
        ring.zero(stream, slot)?;
        slot
    };
    ring.counters_of(slot)
}

/// Per-item statistics give every batch item its own slot, so the batch
/// must fit in the ring.
fn check_per_item_capacity(handle: &EngineHandle, count: usize) -> Result<()> {
    if count > handle.stats_ring_len() {
        return Err(MpsgemmError::InvalidArgument(format!(
            "per-item statistics need {count} slots, ring has {}",
            handle.stats_ring_len()
        )));
    }
    Ok(())
}

fn acquire_per_item(handle: &mut EngineHandle, count: usize) -> Result<Vec<StatsCounters>> {
    check_per_item_capacity(handle, count)?;
    let (ring, stream) = handle.rings_mut();
    (0..count)
        .map(|_| {
            let slot = ring.advance();
            ring.zero(stream, slot)?;
            ring.counters_of(slot)
        })
        .collect()
}

fn launch<T: Element>(
    handle: &mut EngineHandle,
    mode: TensorCoreMode,
    plan: KernelPlan,
    problem: &GemmProblem<T>,
    operands: &GemmOperands<T>,
    stats: StatsTarget,
) -> Result<GemmReport> {
    let (m, n, batch) = (problem.m as u64, problem.n as u64, problem.batch_count as u64);
    let slots = stats.slots();
    let job_problem = *problem;
    let job_operands = operands.clone();

    let mut report = GemmReport::new(mode.into(), DispatchPath::TensorCore);
    match plan {
        KernelPlan::Static(planned) => {
            let config = planned.variant.launch_config(m, n, batch)?;
            config.validate(handle.topology())?;
            report.stage = Some(planned.stage);
            report.tile = Some(planned.variant.tile);
            let kernel = planned.kernel;
            handle.stream().launch(&config, planned.variant.name(), move || {
                run_tensor_core_gemm(&kernel, &job_problem, &job_operands, &stats)
            })?;
        }
        KernelPlan::Dynamic { flag, cheap, escalate } => {
            let config = cheap.variant.launch_config(m, n, batch)?;
            config.validate(handle.topology())?;
            escalate.variant.launch_config(m, n, batch)?.validate(handle.topology())?;
            report.path = DispatchPath::Dynamic;
            report.stage = Some(cheap.stage);
            report.tile = Some(cheap.variant.tile);
            report.dynamic_flag = Some(flag.id());
            report.dynamic_modes = Some((cheap.kernel.mode, escalate.kernel.mode));
            let label = format!("dynamic_{}_or_{}", cheap.variant.name(), escalate.variant.tile);
            handle.stream().launch(&config, label, move || {
                let chosen = if flag.cell().flag() { &escalate } else { &cheap };
                run_tensor_core_gemm(&chosen.kernel, &job_problem, &job_operands, &stats)
            })?;
        }
    }

    let (ring, stream) = handle.rings_mut();
    for &slot in &slots {
        ring.download(stream, slot)?;
    }
    handle.set_last_slots(slots.clone());
    report.stats_slots = slots;
    report.launches = 1;
    Ok(report)
}

/// One tensor-core GEMM (`batch_count` must be 1).
pub fn gemm<T: Element>(
    handle: &mut EngineHandle,
    mode: TensorCoreMode,
    problem: &GemmProblem<T>,
    operands: &GemmOperands<T>,
) -> Result<GemmReport> {
    handle.ensure_active()?;
    let plan = plan(handle, mode, problem, TableKind::Gemm)?;
    let stats = if handle.exp_stats_enabled() {
        StatsTarget::Aggregate(acquire_slot(handle)?)
    } else {
        StatsTarget::Disabled
    };
    launch(handle, mode, plan, &GemmProblem { batch_count: 1, ..*problem }, operands, stats)
}

/// Strided-batched tensor-core GEMM: one launch, or one per item when the
/// items are at least `batch_decompose_threshold` elements.
pub fn gemm_strided_batched<T: Element>(
    handle: &mut EngineHandle,
    mode: TensorCoreMode,
    problem: &GemmProblem<T>,
    operands: &GemmOperands<T>,
) -> Result<GemmReport> {
    handle.ensure_active()?;
    let area = (problem.m as u64).saturating_mul(problem.n as u64);
    if area >= handle.config().batch_decompose_threshold {
        if handle.exp_stats_enabled() && handle.config().batch_stats_mode == BatchStatsMode::PerItem {
            check_per_item_capacity(handle, problem.batch_count)?;
        }
        let result = decompose(handle, mode, problem, operands);
        handle.set_reinit_suppressed(false);
        return result;
    }

    let plan = plan(handle, mode, problem, TableKind::StridedBatched)?;
    let stats = match (handle.exp_stats_enabled(), handle.config().batch_stats_mode) {
        (false, _) => StatsTarget::Disabled,
        (true, BatchStatsMode::Aggregate) => StatsTarget::Aggregate(acquire_slot(handle)?),
        (true, BatchStatsMode::PerItem) => {
            StatsTarget::PerItem(acquire_per_item(handle, problem.batch_count)?)
        }
    };
    launch(handle, mode, plan, problem, operands, stats)
}

fn decompose<T: Element>(
    handle: &mut EngineHandle,
    mode: TensorCoreMode,
    problem: &GemmProblem<T>,
    operands: &GemmOperands<T>,
) -> Result<GemmReport> {
    let aggregate = handle.config().batch_stats_mode == BatchStatsMode::Aggregate;
    debug!(batch = problem.batch_count, m = problem.m, n = problem.n, "decomposing strided batch");

    let mut report = GemmReport::new(mode.into(), DispatchPath::TensorCore);
    let mut slots: Vec<usize> = Vec::new();
    for index in 0..problem.batch_count {
        let (item, item_operands) = problem.item(index, operands);
        let sub = gemm(handle, mode, &item, &item_operands)?;
        if index == 0 {
            report = GemmReport { launches: 0, stats_slots: Vec::new(), ..sub };
            if aggregate && handle.exp_stats_enabled() {
                handle.set_reinit_suppressed(true);
            }
        }
        for slot in sub.stats_slots {
            if !slots.contains(&slot) {
                slots.push(slot);
            }
        }
        report.launches += sub.launches;
    }
    report.decomposed = true;
    report.stats_slots = slots.clone();
    handle.set_last_slots(slots);
    Ok(report)
}

fn reference<T: Element>(
    handle: &mut EngineHandle,
    mode: ComputeMode,
    problem: &GemmProblem<T>,
    operands: &GemmOperands<T>,
) -> Result<GemmReport> {
    let precision = ReferencePrecision::for_mode(mode).ok_or(MpsgemmError::UnsupportedMode(mode))?;
    let config = column_launch(problem.n.saturating_mul(problem.batch_count))?;
    config.validate(handle.topology())?;
    let job_problem = *problem;
    let job_operands = operands.clone();
    handle.stream().launch(&config, format!("reference_gemm_{mode}"), move || {
        run_reference_gemm(precision, &job_problem, &job_operands)
    })?;
    handle.set_last_slots(Vec::new());
    let mut report = GemmReport::new(mode, DispatchPath::Vendor);
    report.launches = 1;
    Ok(report)
}

fn column_launch(columns: usize) -> Result<LaunchConfig> {
    let columns = u32::try_from(columns)
        .map_err(|_| MpsgemmError::LaunchFailed(format!("{columns} columns exceed the grid limit")))?;
    Ok(LaunchConfig::linear(columns, 128))
}

// ---------------------------------------------------------------------------
// Auxiliary kernels
// ---------------------------------------------------------------------------

/// Record exponent statistics of an existing matrix into a fresh slot.
pub fn exp_stats<T: Element>(handle: &mut EngineHandle, matrix: &StridedMatrix<T>) -> Result<usize> {
    handle.ensure_active()?;
    matrix.validate("matrix")?;
    let config = column_launch(matrix.cols.saturating_mul(matrix.batch_count))?;
    config.validate(handle.topology())?;

    let (ring, stream) = handle.rings_mut();
    let slot = ring.advance();
    ring.zero(stream, slot)?;
    let target = StatsTarget::Aggregate(ring.counters_of(slot)?);
    let predicate = Arc::clone(handle.predicate());
    let job_matrix = matrix.clone();
    handle.stream().launch(&config, "exp_stats", move || {
        run_exp_stats(predicate.as_ref(), &job_matrix, &target)
    })?;

    let (ring, stream) = handle.rings_mut();
    ring.download(stream, slot)?;
    handle.set_last_slots(vec![slot]);
    Ok(slot)
}

fn scale_by_flag<T: Element>(
    handle: &EngineHandle,
    flag_id: usize,
    matrix: &StridedMatrix<T>,
    label: &'static str,
    exponent_of: fn(i32) -> i32,
) -> Result<()> {
    handle.ensure_active()?;
    matrix.validate("matrix")?;
    let config = column_launch(matrix.cols.saturating_mul(matrix.batch_count))?;
    config.validate(handle.topology())?;
    let flag = handle.flags().handle(flag_id)?;
    let job_matrix = matrix.clone();
    handle.stream().launch(&config, label, move || {
        run_scale(&job_matrix, exponent_of(flag.cell().max_exponent()))
    })
}

/// Scale an operand by `2^(target - e)`, where `e` is the max exponent
/// stored with flag `flag_id`, bringing its largest value near the top of
/// the FP16 range.
pub fn scale_ab<T: Element>(handle: &EngineHandle, flag_id: usize, matrix: &StridedMatrix<T>) -> Result<()> {
    scale_by_flag(handle, flag_id, matrix, "scale_ab", |e| SCALE_TARGET_EXPONENT - e)
}

/// Undo [`scale_ab`] on a product of two scaled operands (requires `beta = 0`).
pub fn scale_c<T: Element>(handle: &EngineHandle, flag_id: usize, matrix: &StridedMatrix<T>) -> Result<()> {
    scale_by_flag(handle, flag_id, matrix, "scale_c", |e| 2 * (e - SCALE_TARGET_EXPONENT))
}
