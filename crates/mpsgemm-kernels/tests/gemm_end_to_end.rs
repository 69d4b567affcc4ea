//! End-to-end dispatch tests on the emulated device.
//!
//! Covers accuracy of the error-corrected modes against an FP64 reference,
//! single-launch versus decomposed batches, statistics attribution, vendor
//! routing (override and legacy threshold), dynamic launch and operand
//! rescaling.

use approx::assert_relative_eq;
use mpsgemm_kernels::{
    cgemm, cgemm_strided_batched, exp_stats, scale_ab, scale_c, sgemm, sgemm_strided_batched,
    derive_signature, select, BatchStatsMode, Complex32, ComputeMode, DeviceBuffer, DeviceTopology,
    DispatchPath, DynamicLaunchPolicy, ElementKind, EngineConfig, EngineHandle, GemmArgs,
    GemmReport, HandleState, ModuleTable, MpsgemmError, Operation, StridedBatch, StridedMatrix,
    TableKind, TensorCoreMode,
};

// ── helpers ─────────────────────────────────────────────────────────────────

fn handle() -> EngineHandle {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    EngineHandle::builder(EngineConfig::default())
        .with_topology(DeviceTopology::a100())
        .create()
        .unwrap()
}

/// Deterministic values in [-1, 1).
fn uniform(seed: u64, len: usize) -> Vec<f32> {
    let mut state = seed;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
            ((state >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
        })
        .collect()
}

fn args(
    (m, n, k): (usize, usize, usize),
    a: &DeviceBuffer<f32>,
    b: &DeviceBuffer<f32>,
    c: &DeviceBuffer<f32>,
) -> GemmArgs<f32> {
    GemmArgs {
        op_a: Operation::N,
        op_b: Operation::N,
        m,
        n,
        k,
        alpha: 1.0,
        a: a.ptr(),
        lda: m,
        b: b.ptr(),
        ldb: k,
        beta: 0.0,
        c: c.ptr(),
        ldc: m,
    }
}

/// Column-major `A * B` in FP64.
fn reference(m: usize, n: usize, k: usize, a: &[f32], b: &[f32]) -> Vec<f64> {
    let mut c = vec![0.0f64; m * n];
    for j in 0..n {
        for l in 0..k {
            let y = f64::from(b[l + j * k]);
            for i in 0..m {
                c[i + j * m] += f64::from(a[i + l * m]) * y;
            }
        }
    }
    c
}

/// Column-major `|A| * |B|` in FP64, the scale of the accumulated rounding error.
fn abs_reference(m: usize, n: usize, k: usize, a: &[f32], b: &[f32]) -> Vec<f64> {
    let abs = |v: &[f32]| v.iter().map(|x| x.abs()).collect::<Vec<_>>();
    reference(m, n, k, &abs(a), &abs(b))
}

/// `||got - want||_F / ||scale||_F`.
fn scaled_residual(got: &[f32], want: &[f64], scale: &[f64]) -> f64 {
    let num: f64 = got.iter().zip(want).map(|(&g, &w)| (f64::from(g) - w).powi(2)).sum();
    let den: f64 = scale.iter().map(|s| s * s).sum();
    (num / den).sqrt()
}

/// `c * sqrt(k) * u`, where `u` is the unit round-off the mode delivers:
/// the family's for plain modes, its square (floored at FP32) with error
/// correction.
fn accuracy_bound(mode: TensorCoreMode, k: usize) -> f64 {
    const C: f64 = 4.0;
    let u = mode.family().unit_roundoff();
    let effective = if mode.error_correction() { (u * u).max(2f64.powi(-24)) } else { u };
    C * (k as f64).sqrt() * effective
}

fn relative_residual(got: &[f32], want: &[f64]) -> f64 {
    let num: f64 = got.iter().zip(want).map(|(&g, &w)| (f64::from(g) - w).powi(2)).sum();
    let den: f64 = want.iter().map(|w| w * w).sum();
    (num / den).sqrt()
}

fn run_real(mode: ComputeMode, dims: (usize, usize, usize), a: &[f32], b: &[f32]) -> (Vec<f32>, GemmReport) {
    let (m, n, _) = dims;
    let mut h = handle();
    let a = DeviceBuffer::from_slice(a).unwrap();
    let b = DeviceBuffer::from_slice(b).unwrap();
    let c = DeviceBuffer::<f32>::zeros(m * n).unwrap();
    let report = sgemm(&mut h, &args(dims, &a, &b, &c), mode).unwrap();
    h.synchronize().unwrap();
    (c.to_host(), report)
}

// ── accuracy ────────────────────────────────────────────────────────────────

#[test]
fn fp16tcec_matches_fp64_reference() {
    let (m, n, k) = (256, 256, 256);
    let a = uniform(1, m * k);
    let b = uniform(2, k * n);
    let want = reference(m, n, k, &a, &b);

    let (corrected, report) = run_real(ComputeMode::Fp16Tcec, (m, n, k), &a, &b);
    let (plain, _) = run_real(ComputeMode::Fp16Tc, (m, n, k), &a, &b);

    let sig = derive_signature(TensorCoreMode::Fp16Tcec, Operation::N, Operation::N, ElementKind::Real);
    let variants = ModuleTable::shared().lookup(TableKind::Gemm, sig).to_vec();
    let (stage, variant) = select(&variants, 256, 256, 1, &DeviceTopology::a100(), 32).unwrap();
    assert_eq!(report.stage, Some(stage));
    assert_eq!(report.tile, Some(variant.tile));

    let scale = abs_reference(m, n, k, &a, &b);
    let corrected_residual = scaled_residual(&corrected, &want, &scale);
    let plain_residual = scaled_residual(&plain, &want, &scale);
    let bound = accuracy_bound(TensorCoreMode::Fp16Tcec, k);
    assert!(corrected_residual < bound, "FP16TCEC residual {corrected_residual} above {bound}");
    assert!(plain_residual < accuracy_bound(TensorCoreMode::Fp16Tc, k), "FP16TC residual {plain_residual}");
    assert!(
        plain_residual > 10.0 * corrected_residual,
        "correction should win: {plain_residual} vs {corrected_residual}"
    );
}

#[test]
fn tf32tcec_matches_fp64_reference_on_odd_shape() {
    let (m, n, k) = (37, 53, 71);
    let a = uniform(3, m * k);
    let b = uniform(4, k * n);
    let (got, _) = run_real(ComputeMode::Tf32Tcec, (m, n, k), &a, &b);
    let residual = scaled_residual(&got, &reference(m, n, k, &a, &b), &abs_reference(m, n, k, &a, &b));
    assert!(residual < accuracy_bound(TensorCoreMode::Tf32Tcec, k), "TF32TCEC residual {residual}");
}

#[test]
fn vendor_mode_matches_reference() {
    let (m, n, k) = (48, 40, 32);
    let a = uniform(5, m * k);
    let b = uniform(6, k * n);
    let (got, _) = run_real(ComputeMode::Cublas, (m, n, k), &a, &b);
    assert!(relative_residual(&got, &reference(m, n, k, &a, &b)) < 1e-6);
}

#[test]
fn beta_zero_ignores_existing_c() {
    let mut h = handle();
    let a = DeviceBuffer::from_slice(&[1.0f32; 4]).unwrap();
    let b = DeviceBuffer::from_slice(&[2.0f32; 4]).unwrap();
    let c = DeviceBuffer::from_slice(&[f32::NAN; 4]).unwrap();
    sgemm(&mut h, &args((2, 2, 2), &a, &b, &c), ComputeMode::Fp16Tcec).unwrap();
    h.synchronize().unwrap();
    assert_eq!(c.to_host(), vec![4.0; 4]);
}

#[test]
fn alpha_and_beta_are_applied() {
    let mut h = handle();
    let a = DeviceBuffer::from_slice(&[1.0f32; 4]).unwrap();
    let b = DeviceBuffer::from_slice(&[2.0f32; 4]).unwrap();
    let c = DeviceBuffer::from_slice(&[1.0f32; 4]).unwrap();
    let call = GemmArgs { alpha: 0.5, beta: 3.0, ..args((2, 2, 2), &a, &b, &c) };
    sgemm(&mut h, &call, ComputeMode::Tf32Tcec).unwrap();
    h.synchronize().unwrap();
    assert_eq!(c.to_host(), vec![5.0; 4]);
}

#[test]
fn complex_transposed_operands_agree_with_vendor_path() {
    let (m, n, k) = (12, 10, 20);
    let values = |seed, len| -> Vec<Complex32> {
        let re = uniform(seed, len);
        let im = uniform(seed + 100, len);
        re.into_iter().zip(im).map(|(r, i)| Complex32::new(r, i)).collect()
    };
    // op(A) = A^H with A stored k x m, op(B) = B^T with B stored n x k.
    let a = DeviceBuffer::from_slice(&values(7, k * m)).unwrap();
    let b = DeviceBuffer::from_slice(&values(8, n * k)).unwrap();

    let run = |mode| {
        let mut h = handle();
        let c = DeviceBuffer::<Complex32>::zeros(m * n).unwrap();
        let call = GemmArgs {
            op_a: Operation::C,
            op_b: Operation::T,
            m,
            n,
            k,
            alpha: Complex32::new(1.0, 0.0),
            a: a.ptr(),
            lda: k,
            b: b.ptr(),
            ldb: n,
            beta: Complex32::new(0.0, 0.0),
            c: c.ptr(),
            ldc: m,
        };
        cgemm(&mut h, &call, mode).unwrap();
        h.synchronize().unwrap();
        c.to_host()
    };
    let vendor = run(ComputeMode::Cublas);
    let tensor = run(ComputeMode::Fp16Tcec);
    for (t, v) in tensor.iter().zip(&vendor) {
        assert!((t - v).norm() < 1e-4, "{t} vs {v}");
    }
}

// ── routing ─────────────────────────────────────────────────────────────────

#[test]
fn legacy_threshold_routes_small_problems_to_vendor() {
    let mut h = handle();
    h.set_legacy_size_threshold(1000).unwrap();
    let a = DeviceBuffer::from_slice(&[1.0f32; 64]).unwrap();
    let b = DeviceBuffer::from_slice(&[1.0f32; 64]).unwrap();
    let c = DeviceBuffer::<f32>::zeros(64).unwrap();
    let report = sgemm(&mut h, &args((8, 8, 8), &a, &b, &c), ComputeMode::Fp16Tcec).unwrap();
    assert_eq!(report.requested, ComputeMode::Fp16Tcec);
    assert_eq!(report.mode, ComputeMode::Cublas);
    assert_eq!(report.path, DispatchPath::Vendor);
    assert_eq!(h.last_call().unwrap().mode, ComputeMode::Cublas);
    h.synchronize().unwrap();
    assert_eq!(c.to_host(), vec![8.0; 64]);
}

#[test]
fn override_replaces_requested_mode() {
    let mut h = handle();
    h.set_compute_mode_override(Some(ComputeMode::Tf32Tcec)).unwrap();
    let a = DeviceBuffer::from_slice(&[1.0f32; 16]).unwrap();
    let b = DeviceBuffer::from_slice(&[1.0f32; 16]).unwrap();
    let c = DeviceBuffer::<f32>::zeros(16).unwrap();
    let report = sgemm(&mut h, &args((4, 4, 4), &a, &b, &c), ComputeMode::CublasSimt).unwrap();
    assert_eq!(report.mode, ComputeMode::Tf32Tcec);
    assert_eq!(report.path, DispatchPath::TensorCore);
    assert!(report.stage.is_some());

    h.set_compute_mode_override(None).unwrap();
    let report = sgemm(&mut h, &args((4, 4, 4), &a, &b, &c), ComputeMode::CublasSimt).unwrap();
    assert_eq!(report.path, DispatchPath::Vendor);
}

#[test]
fn call_record_describes_the_dispatched_call() {
    let mut h = handle();
    let a = DeviceBuffer::<f32>::zeros(64 * 8).unwrap();
    let b = DeviceBuffer::<f32>::zeros(64 * 8).unwrap();
    let c = DeviceBuffer::<f32>::zeros(64 * 8).unwrap();
    let batch = StridedBatch { stride_a: 64, stride_b: 64, stride_c: 64, batch_count: 8 };
    sgemm_strided_batched(&mut h, &args((8, 8, 8), &a, &b, &c), &batch, ComputeMode::Tf32Tc).unwrap();
    let line = h.last_call().unwrap().to_string();
    assert_eq!(line, "[mpsgemm LOG] sgemm_strided_batched op=(N, N), shape=(8, 8, 8), batch=8, mode=TF32TC");
}

// ── strided batches ─────────────────────────────────────────────────────────

#[test]
fn small_batch_uses_one_launch() {
    let (m, n, k, batch) = (64, 64, 64, 8);
    let a_host = uniform(9, m * k * batch);
    let b_host = uniform(10, k * n * batch);
    let a = DeviceBuffer::from_slice(&a_host).unwrap();
    let b = DeviceBuffer::from_slice(&b_host).unwrap();
    let c = DeviceBuffer::<f32>::zeros(m * n * batch).unwrap();
    let mut h = handle();
    h.set_exp_stats_enabled(true).unwrap();
    h.set_batch_stats_mode(BatchStatsMode::PerItem).unwrap();
    let before = h.stream().kernel_launches();
    let strides = StridedBatch { stride_a: m * k, stride_b: k * n, stride_c: m * n, batch_count: batch };
    let report =
        sgemm_strided_batched(&mut h, &args((m, n, k), &a, &b, &c), &strides, ComputeMode::Fp16Tcec)
            .unwrap();
    h.synchronize().unwrap();

    assert_eq!(report.launches, 1);
    assert!(!report.decomposed);
    assert_eq!(h.stream().kernel_launches() - before, 1);
    assert_eq!(report.stats_slots.len(), batch);
    for &slot in &report.stats_slots {
        let stats = h.exp_stats(slot).unwrap();
        assert_eq!(stats.total, (m * n) as u64);
        assert!(stats.lost <= stats.total);
    }

    let got = c.to_host();
    for item in 0..batch {
        let want = reference(
            m,
            n,
            k,
            &a_host[item * m * k..(item + 1) * m * k],
            &b_host[item * k * n..(item + 1) * k * n],
        );
        let residual = relative_residual(&got[item * m * n..(item + 1) * m * n], &want);
        assert!(residual < 1e-5, "item {item}: {residual}");
    }
}

#[test]
fn large_items_are_decomposed() {
    let mut h = handle();
    h.set_batch_decompose_threshold(64).unwrap();
    let a = DeviceBuffer::from_slice(&[1.0f32; 64 * 3]).unwrap();
    let b = DeviceBuffer::from_slice(&[1.0f32; 64 * 3]).unwrap();
    let c = DeviceBuffer::<f32>::zeros(64 * 3).unwrap();
    let before = h.stream().kernel_launches();
    let strides = StridedBatch { stride_a: 64, stride_b: 64, stride_c: 64, batch_count: 3 };
    let report =
        sgemm_strided_batched(&mut h, &args((8, 8, 8), &a, &b, &c), &strides, ComputeMode::Fp16Tcec)
            .unwrap();
    h.synchronize().unwrap();
    assert!(report.decomposed);
    assert_eq!(report.launches, 3);
    assert_eq!(h.stream().kernel_launches() - before, 3);
    assert_eq!(c.to_host(), vec![8.0; 64 * 3]);
}

#[test]
fn complex_batch_items_are_independent() {
    let one = Complex32::new(1.0, 0.0);
    let a = DeviceBuffer::from_slice(&[one, Complex32::new(0.0, 2.0)]).unwrap();
    let b = DeviceBuffer::from_slice(&[Complex32::new(0.0, 1.0), one]).unwrap();
    let c = DeviceBuffer::<Complex32>::zeros(2).unwrap();
    let mut h = handle();
    let call = GemmArgs {
        op_a: Operation::N,
        op_b: Operation::N,
        m: 1,
        n: 1,
        k: 1,
        alpha: one,
        a: a.ptr(),
        lda: 1,
        b: b.ptr(),
        ldb: 1,
        beta: Complex32::new(0.0, 0.0),
        c: c.ptr(),
        ldc: 1,
    };
    let strides = StridedBatch { stride_a: 1, stride_b: 1, stride_c: 1, batch_count: 2 };
    cgemm_strided_batched(&mut h, &call, &strides, ComputeMode::Tf32Tcec).unwrap();
    h.synchronize().unwrap();
    assert_eq!(c.to_host(), vec![Complex32::new(0.0, 1.0), Complex32::new(0.0, 2.0)]);
}

// ── statistics ──────────────────────────────────────────────────────────────

fn tiny_batch(h: &mut EngineHandle, batch: usize) -> GemmReport {
    // Every product is 8e-6: non-zero and below the FP16 normal range.
    let a = DeviceBuffer::from_slice(&vec![1e-6f32; 64 * batch]).unwrap();
    let b = DeviceBuffer::from_slice(&vec![1.0f32; 64 * batch]).unwrap();
    let c = DeviceBuffer::<f32>::zeros(64 * batch).unwrap();
    let strides = StridedBatch { stride_a: 64, stride_b: 64, stride_c: 64, batch_count: batch };
    let report =
        sgemm_strided_batched(h, &args((8, 8, 8), &a, &b, &c), &strides, ComputeMode::Fp16Tcec).unwrap();
    h.synchronize().unwrap();
    report
}

#[test]
fn aggregate_stats_use_one_slot() {
    let mut h = handle();
    h.set_exp_stats_enabled(true).unwrap();
    let report = tiny_batch(&mut h, 4);
    assert_eq!(report.stats_slots.len(), 1);
    assert_eq!(h.last_slots(), report.stats_slots.as_slice());
    let stats = h.exp_stats(report.stats_slots[0]).unwrap();
    assert_eq!(stats.as_pair(), (256, 256));
}

#[test]
fn per_item_stats_use_one_slot_each() {
    let mut h = handle();
    h.set_exp_stats_enabled(true).unwrap();
    h.set_batch_stats_mode(BatchStatsMode::PerItem).unwrap();
    let report = tiny_batch(&mut h, 4);
    assert_eq!(report.stats_slots, vec![0, 1, 2, 3]);
    for slot in report.stats_slots {
        assert_eq!(h.exp_stats(slot).unwrap().as_pair(), (64, 64));
    }
}

#[test]
fn per_item_stats_need_enough_slots() {
    let config = EngineConfig {
        stats_ring_size: 2,
        exp_stats_enabled: true,
        batch_stats_mode: BatchStatsMode::PerItem,
        ..EngineConfig::default()
    };
    let mut h = EngineHandle::builder(config).with_topology(DeviceTopology::a100()).create().unwrap();
    let a = DeviceBuffer::<f32>::zeros(64 * 3).unwrap();
    let strides = StridedBatch { stride_a: 64, stride_b: 64, stride_c: 64, batch_count: 3 };
    let err = sgemm_strided_batched(&mut h, &args((8, 8, 8), &a, &a, &a), &strides, ComputeMode::Fp16Tcec)
        .unwrap_err();
    assert!(matches!(err, MpsgemmError::InvalidArgument(_)));
}

#[test]
fn decomposed_per_item_stats_need_enough_slots() {
    let config = EngineConfig {
        stats_ring_size: 2,
        exp_stats_enabled: true,
        batch_stats_mode: BatchStatsMode::PerItem,
        batch_decompose_threshold: 64,
        ..EngineConfig::default()
    };
    let mut h = EngineHandle::builder(config).with_topology(DeviceTopology::a100()).create().unwrap();
    let a = DeviceBuffer::<f32>::zeros(64 * 3).unwrap();
    let strides = StridedBatch { stride_a: 64, stride_b: 64, stride_c: 64, batch_count: 3 };
    let err = sgemm_strided_batched(&mut h, &args((8, 8, 8), &a, &a, &a), &strides, ComputeMode::Fp16Tcec)
        .unwrap_err();
    assert!(matches!(err, MpsgemmError::InvalidArgument(_)));
    assert_eq!(h.stream().kernel_launches(), 0);
    assert!(h.last_slots().is_empty());

    // A batch that fits the ring still decomposes with one slot per item.
    let strides = StridedBatch { batch_count: 2, ..strides };
    let report =
        sgemm_strided_batched(&mut h, &args((8, 8, 8), &a, &a, &a), &strides, ComputeMode::Fp16Tcec).unwrap();
    assert!(report.decomposed);
    assert_eq!(report.stats_slots, vec![0, 1]);
}

#[test]
fn decomposed_aggregate_stats_sum_over_items() {
    let mut h = handle();
    h.set_exp_stats_enabled(true).unwrap();
    h.set_batch_decompose_threshold(64).unwrap();
    let report = tiny_batch(&mut h, 3);
    assert!(report.decomposed);
    assert_eq!(report.stats_slots.len(), 1);
    assert_eq!(h.exp_stats(report.stats_slots[0]).unwrap().as_pair(), (192, 192));

    // Suppression ends with the call: the next GEMM gets a fresh slot.
    let next = tiny_batch(&mut h, 1);
    assert_ne!(next.stats_slots, report.stats_slots);
    assert_eq!(h.exp_stats(next.stats_slots[0]).unwrap().as_pair(), (64, 64));
}

#[test]
fn decomposed_per_item_stats() {
    let mut h = handle();
    h.set_exp_stats_enabled(true).unwrap();
    h.set_batch_decompose_threshold(64).unwrap();
    h.set_batch_stats_mode(BatchStatsMode::PerItem).unwrap();
    let report = tiny_batch(&mut h, 3);
    assert_eq!(report.stats_slots.len(), 3);
    for slot in report.stats_slots {
        assert_eq!(h.exp_stats(slot).unwrap().as_pair(), (64, 64));
    }
}

#[test]
fn disabled_stats_touch_no_slot() {
    let mut h = handle();
    let report = tiny_batch(&mut h, 2);
    assert!(report.stats_slots.is_empty());
    assert!(h.last_slots().is_empty());
}

#[test]
fn vendor_calls_collect_no_stats() {
    let mut h = handle();
    h.set_exp_stats_enabled(true).unwrap();
    let a = DeviceBuffer::from_slice(&[1e-6f32; 4]).unwrap();
    let c = DeviceBuffer::<f32>::zeros(4).unwrap();
    let report = sgemm(&mut h, &args((2, 2, 1), &a, &a, &c), ComputeMode::CublasFp16Tc).unwrap();
    assert!(report.stats_slots.is_empty());
    assert!(h.last_slots().is_empty());
}

// ── dynamic launch and scaling ──────────────────────────────────────────────

/// `8 x 8 x 8` GEMM where A holds 1e-9: FP16 flushes it, TF32 keeps it.
fn flagged_problem(h: &mut EngineHandle, a_drives_flag: bool) -> (GemmReport, f32) {
    h.set_exp_stats_enabled(true).unwrap();
    let a = DeviceBuffer::from_slice(&[1e-9f32; 64]).unwrap();
    let b = DeviceBuffer::from_slice(&[1.0f32; 64]).unwrap();
    let c = DeviceBuffer::<f32>::zeros(64).unwrap();
    let matrix = |buf: &DeviceBuffer<f32>| StridedMatrix {
        ptr: buf.ptr(),
        rows: 8,
        cols: 8,
        ld: 8,
        batch_count: 1,
        stride: 0,
    };
    let a_slot = exp_stats(h, &matrix(&a)).unwrap();
    let b_slot = exp_stats(h, &matrix(&b)).unwrap();
    let flag = h.advance_flag().unwrap();
    let first = if a_drives_flag { a_slot } else { b_slot };
    h.derive_flag(flag, first, b_slot, 0.1).unwrap();
    h.bind_flag(flag).unwrap();
    let report = sgemm(h, &args((8, 8, 8), &a, &b, &c), ComputeMode::Fp16Tcec).unwrap();
    h.synchronize().unwrap();
    assert_eq!(h.read_flag(flag).unwrap(), a_drives_flag);
    (report, c.to_host()[0])
}

#[test]
fn raised_flag_escalates_on_device() {
    let mut h = handle();
    let (report, value) = flagged_problem(&mut h, true);
    assert_eq!(report.path, DispatchPath::Dynamic);
    assert!(report.dynamic_flag.is_some());
    assert_relative_eq!(f64::from(value), 8e-9, max_relative = 1e-4);
}

#[test]
fn clear_flag_keeps_cheap_mode() {
    let mut h = handle();
    let (report, value) = flagged_problem(&mut h, false);
    assert_eq!(report.path, DispatchPath::Dynamic);
    let rel = ((f64::from(value) - 8e-9) / 8e-9).abs();
    assert!(rel > 1e-3, "FP16TCEC should lose precision on 1e-9, got {rel}");
}

#[test]
fn dynamic_report_names_both_candidate_modes() {
    let mut h = handle();
    let (report, _) = flagged_problem(&mut h, true);
    assert_eq!(report.mode, ComputeMode::Fp16Tcec);
    assert_eq!(report.dynamic_modes, Some((TensorCoreMode::Fp16Tcec, TensorCoreMode::Tf32Tcec)));
}

#[test]
fn flag_threshold_is_chosen_per_derivation() {
    let mut h = handle();
    // Half of the inspected values are below the FP16 range.
    let buf = DeviceBuffer::from_slice(&[1e-9f32, 1.0, 1e-9, 1.0]).unwrap();
    let matrix = StridedMatrix { ptr: buf.ptr(), rows: 2, cols: 2, ld: 2, batch_count: 1, stride: 0 };
    let slot = exp_stats(&mut h, &matrix).unwrap();

    let low = h.advance_flag().unwrap();
    h.derive_flag(low, slot, slot, 0.25).unwrap();
    let high = h.advance_flag().unwrap();
    h.derive_flag(high, slot, slot, 0.75).unwrap();
    let boundary = h.advance_flag().unwrap();
    h.derive_flag(boundary, slot, slot, 0.5).unwrap();
    h.synchronize().unwrap();

    assert!(h.read_flag(low).unwrap());
    assert!(!h.read_flag(high).unwrap());
    assert!(!h.read_flag(boundary).unwrap());
    assert_eq!(h.config().loss_ratio_threshold, EngineConfig::default().loss_ratio_threshold);

    for bad in [-0.1, 1.5, f64::NAN] {
        let err = h.derive_flag(low, slot, slot, bad).unwrap_err();
        assert!(matches!(err, MpsgemmError::InvalidArgument(_)), "{bad}");
    }
}

#[test]
fn unbound_flag_restores_static_dispatch() {
    let mut h = handle();
    let flag = h.advance_flag().unwrap();
    h.bind_flag(flag).unwrap();
    assert_eq!(h.unbind_flag().unwrap(), Some(flag));
    h.set_dynamic_policy(DynamicLaunchPolicy {
        cheap: TensorCoreMode::Fp16Tc,
        escalate: TensorCoreMode::Tf32Tcec,
    })
    .unwrap();
    let a = DeviceBuffer::from_slice(&[1.0f32; 4]).unwrap();
    let c = DeviceBuffer::<f32>::zeros(4).unwrap();
    let report = sgemm(&mut h, &args((2, 2, 1), &a, &a, &c), ComputeMode::Fp16Tcec).unwrap();
    assert_eq!(report.path, DispatchPath::TensorCore);
    assert_eq!(report.dynamic_flag, None);
}

#[test]
fn scaling_round_trips_through_the_product() {
    let mut h = handle();
    h.set_exp_stats_enabled(true).unwrap();
    let a = DeviceBuffer::from_slice(&[2f32.powi(-20); 16]).unwrap();
    let b = DeviceBuffer::from_slice(&[2f32.powi(-18); 16]).unwrap();
    let c = DeviceBuffer::<f32>::zeros(16).unwrap();
    let matrix = |buf: &DeviceBuffer<f32>| StridedMatrix {
        ptr: buf.ptr(),
        rows: 4,
        cols: 4,
        ld: 4,
        batch_count: 1,
        stride: 0,
    };
    let a_slot = exp_stats(&mut h, &matrix(&a)).unwrap();
    let b_slot = exp_stats(&mut h, &matrix(&b)).unwrap();
    let flag = h.advance_flag().unwrap();
    h.derive_flag(flag, a_slot, b_slot, 0.1).unwrap();

    scale_ab(&h, flag, &matrix(&a)).unwrap();
    scale_ab(&h, flag, &matrix(&b)).unwrap();
    sgemm(&mut h, &args((4, 4, 4), &a, &b, &c), ComputeMode::Fp16Tcec).unwrap();
    scale_c(&h, flag, &matrix(&c)).unwrap();
    h.synchronize().unwrap();

    assert_eq!(h.read_max_exponent(flag).unwrap(), -18);
    assert_eq!(a.to_host()[0], 2f32.powi(12));
    assert_eq!(c.to_host(), vec![2f32.powi(-36); 16]);
}

// ── validation and lifecycle ────────────────────────────────────────────────

#[test]
fn invalid_arguments_are_rejected() {
    let mut h = handle();
    let a = DeviceBuffer::<f32>::zeros(16).unwrap();
    let zero_m = args((0, 4, 4), &a, &a, &a);
    assert!(matches!(sgemm(&mut h, &zero_m, ComputeMode::Fp16Tcec), Err(MpsgemmError::InvalidArgument(_))));

    let short_ld = GemmArgs { lda: 2, ..args((4, 4, 4), &a, &a, &a) };
    assert!(matches!(sgemm(&mut h, &short_ld, ComputeMode::Fp16Tcec), Err(MpsgemmError::InvalidArgument(_))));

    let too_big = args((8, 8, 8), &a, &a, &a);
    assert!(matches!(sgemm(&mut h, &too_big, ComputeMode::Fp16Tcec), Err(MpsgemmError::InvalidArgument(_))));

    let empty_batch = StridedBatch { stride_a: 0, stride_b: 0, stride_c: 0, batch_count: 0 };
    let result = sgemm_strided_batched(&mut h, &args((4, 4, 4), &a, &a, &a), &empty_batch, ComputeMode::Fp16Tcec);
    assert!(matches!(result, Err(MpsgemmError::InvalidArgument(_))));
    assert_eq!(h.stream().kernel_launches(), 0);
}

#[test]
fn destroyed_handle_rejects_gemm() -> anyhow::Result<()> {
    let mut h = handle();
    h.destroy()?;
    assert_eq!(h.state(), HandleState::Destroyed);
    let a = DeviceBuffer::<f32>::zeros(4)?;
    let result = sgemm(&mut h, &args((2, 2, 1), &a, &a, &a), ComputeMode::Fp16Tcec);
    assert!(matches!(result, Err(MpsgemmError::InvalidState { .. })));
    Ok(())
}

#[test]
fn complex_modes_select_complex_variants() {
    let mut h = handle();
    let one = Complex32::new(1.0, 0.0);
    let a = DeviceBuffer::from_slice(&[one; 4]).unwrap();
    let c = DeviceBuffer::<Complex32>::zeros(4).unwrap();
    let call = GemmArgs {
        op_a: Operation::N,
        op_b: Operation::N,
        m: 2,
        n: 2,
        k: 2,
        alpha: one,
        a: a.ptr(),
        lda: 2,
        b: a.ptr(),
        ldb: 2,
        beta: Complex32::new(0.0, 0.0),
        c: c.ptr(),
        ldc: 2,
    };
    let report = cgemm(&mut h, &call, ComputeMode::Fp16Tcec).unwrap();
    assert_eq!(report.stage, Some(0));
    h.synchronize().unwrap();
    assert_eq!(c.to_host(), vec![Complex32::new(2.0, 0.0); 4]);
}
