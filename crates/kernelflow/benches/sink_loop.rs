//! Sink Loop Benchmarks
//!
//! Measures multi-iteration runs where the loop count actor re-arms the
//! graph without returning to the caller:
//! - Host-fed loops of increasing length
//! - Device-queue fed loops that run until end of input

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

use kernelflow::prelude::*;

const WIDTH: usize = 256;

fn meta() -> TensorMeta {
    TensorMeta::new(DType::F32, vec![WIDTH])
}

fn add_one() -> KernelRef {
    KernelRef::registered(
        "AddScalar",
        KernelSignature::new(vec![meta()], vec![meta()]).with_attr("scalar", 1.0),
    )
}

/// Benchmark host-fed sink loops
fn bench_host_loop(c: &mut Criterion) {
    let mut group = c.benchmark_group("sink_loop/host");
    group.sample_size(30);

    for loop_count in [1u64, 10, 100].iter() {
        group.throughput(Throughput::Elements(*loop_count));
        let cpu = DeviceContextKey::cpu(0);
        let graph = GraphBuilder::new("host_loop")
            .host_input("x", cpu.clone(), 0, meta())
            .kernel("add", cpu, add_one(), [NodeInput::node("x", 0)])
            .output(NodeInput::node("add", 0))
            .build();
        // Built outside any runtime, so the engine owns one.
        let engine = KernelFlow::builder()
            .cpu_device(0)
            .graph(graph)
            .loop_count(*loop_count)
            .build()
            .unwrap();

        group.bench_with_input(BenchmarkId::new("execute_blocking", loop_count), loop_count, |b, _| {
            b.iter(|| {
                let out = engine.execute_blocking(vec![HostTensor::zeros(meta())]).unwrap();
                black_box(out);
            });
        });
    }

    group.finish();
}

/// Benchmark queue-fed loops that stop on end of input
fn bench_queue_loop(c: &mut Criterion) {
    let mut group = c.benchmark_group("sink_loop/queue");
    group.sample_size(30);

    for batches in [10usize, 100].iter() {
        group.throughput(Throughput::Elements(*batches as u64));

        group.bench_with_input(BenchmarkId::new("until_end_of_input", batches), batches, |b, &n| {
            b.iter_batched(
                || {
                    let queue = RingDataQueue::from_batches((0..n).map(|_| vec![HostTensor::zeros(meta())])).unwrap();
                    let cpu = DeviceContextKey::cpu(0);
                    let graph = GraphBuilder::new("queue_loop")
                        .device_queue("q", cpu.clone(), Arc::new(queue), vec![meta()])
                        .kernel("add", cpu, add_one(), [NodeInput::node("q", 0)])
                        .output(NodeInput::node("add", 0))
                        .build();
                    KernelFlow::builder()
                        .cpu_device(0)
                        .graph(graph)
                        .loop_count(u64::MAX)
                        .build()
                        .unwrap()
                },
                |engine| {
                    let out = engine.execute_blocking(Vec::new()).unwrap();
                    assert!(out.end_of_input);
                    black_box(out);
                },
                BatchSize::PerIteration,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_host_loop, bench_queue_loop);
criterion_main!(benches);
