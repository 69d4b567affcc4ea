//! Criterion benchmarks for the dispatch path.
//!
//! Measures end-to-end GEMM throughput per compute mode on the emulated
//! device and the host-side cost of variant selection.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mpsgemm_kernels::{
    derive_signature, select, sgemm, ComputeMode, DeviceBuffer, DeviceTopology, ElementKind,
    EngineConfig, EngineHandle, GemmArgs, ModuleTable, Operation, TableKind, TensorCoreMode,
};

fn matrix(len: usize) -> Vec<f32> {
    (0..len).map(|i| (i as f32 / len as f32) * 2.0 - 1.0).collect()
}

fn bench_sgemm(c: &mut Criterion) {
    let mut handle = EngineHandle::builder(EngineConfig::default())
        .with_topology(DeviceTopology::a100())
        .create()
        .unwrap();
    let mut group = c.benchmark_group("sgemm");
    group.sample_size(10);

    for size in [32usize, 64, 128] {
        let a = DeviceBuffer::from_slice(&matrix(size * size)).unwrap();
        let b = DeviceBuffer::from_slice(&matrix(size * size)).unwrap();
        let out = DeviceBuffer::<f32>::zeros(size * size).unwrap();
        let args = GemmArgs {
            op_a: Operation::N,
            op_b: Operation::N,
            m: size,
            n: size,
            k: size,
            alpha: 1.0,
            a: a.ptr(),
            lda: size,
            b: b.ptr(),
            ldb: size,
            beta: 0.0,
            c: out.ptr(),
            ldc: size,
        };
        group.throughput(Throughput::Elements((size * size * size) as u64));

        for mode in [ComputeMode::Cublas, ComputeMode::Fp16Tc, ComputeMode::Fp16Tcec, ComputeMode::Tf32Tcec] {
            group.bench_with_input(
                BenchmarkId::new(mode.to_string(), format!("{size}x{size}x{size}")),
                &mode,
                |bench, &mode| {
                    bench.iter(|| {
                        sgemm(&mut handle, black_box(&args), mode).unwrap();
                        handle.synchronize().unwrap();
                    });
                },
            );
        }
    }
    group.finish();
}

fn bench_select(c: &mut Criterion) {
    let table = ModuleTable::shared();
    let device = DeviceTopology::a100();
    let sig = derive_signature(TensorCoreMode::Fp16Tcec, Operation::N, Operation::T, ElementKind::Real);
    let variants = table.lookup(TableKind::Gemm, sig);

    c.bench_function("select_variant", |bench| {
        bench.iter(|| {
            select(variants, black_box(4096), black_box(1024), black_box(1), &device, 32)
                .map(|(stage, _)| stage)
        });
    });
}

criterion_group!(benches, bench_sgemm, bench_select);
criterion_main!(benches);
