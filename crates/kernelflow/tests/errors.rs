//! Failure paths: every failed run reports its first error, returns all
//! transient memory and leaves the engine ready for the next run.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{add_scalar, assert_no_leaks, cpu, engine, f32_meta, Tracked};
use kernelflow::prelude::*;

fn x() -> Vec<HostTensor> {
    vec![HostTensor::from_f32(&[1.0, 2.0])]
}

/// `x -> tracked`, with a second healthy consumer of `x`.
fn fan_out(tracked: &Arc<Tracked>, device: &Arc<CpuDeviceContext>, loop_count: u64) -> ActorEngine {
    let graph = GraphBuilder::new("fan_out")
        .host_input("x", cpu(0), 0, f32_meta(2))
        .kernel("tracked", cpu(0), tracked.kernel_ref(), [NodeInput::node("x", 0)])
        .kernel("healthy", cpu(0), add_scalar(2, 5.0), [NodeInput::node("x", 0)])
        .output(NodeInput::node("tracked", 0))
        .output(NodeInput::node("healthy", 0))
        .build();
    engine(graph, &[Arc::clone(device)], loop_count)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_kernel_failure_then_recovery() {
    let device = CpuDeviceContext::new(0);
    let tracked = Tracked::flaky(AddScalarKernel::new(f32_meta(2), 1.0), 1);
    let engine = fan_out(&tracked, &device, 2);

    let err = engine.execute(x()).await.unwrap_err();
    assert_eq!(
        err,
        EngineError::KernelExecution {
            actor_id: "tracked".to_string(),
            kernel_name: "AddScalar".to_string(),
        }
    );
    assert_no_leaks(&device);

    let out = engine.execute(x()).await.unwrap();
    assert_eq!(out.outputs[0].to_vec::<f32>(), vec![2.0, 3.0]);
    assert_eq!(out.outputs[1].to_vec::<f32>(), vec![6.0, 7.0]);
    assert_eq!(out.steps, 2);
    assert_no_leaks(&device);

    let stats = engine.stats();
    assert_eq!(stats.runs, 2);
    assert_eq!(stats.failed_runs, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_out_of_memory() {
    let device = CpuDeviceContext::with_capacity(0, 16);
    let graph = GraphBuilder::new("too_big")
        .host_input("x", cpu(0), 0, f32_meta(8))
        .kernel("add", cpu(0), add_scalar(8, 1.0), [NodeInput::node("x", 0)])
        .output(NodeInput::node("add", 0))
        .build();
    let engine = engine(graph, &[Arc::clone(&device)], 1);

    let err = engine
        .execute(vec![HostTensor::from_f32(&[0.0; 8])])
        .await
        .unwrap_err();
    match err {
        EngineError::AllocationFailed { device, size, .. } => {
            assert_eq!(device, "CPU_0");
            assert_eq!(size, 32);
        }
        other => panic!("expected allocation failure, got {:?}", other),
    }
    assert!(fails_again(&engine).await);
    assert_no_leaks(&device);
}

async fn fails_again(engine: &ActorEngine) -> bool {
    // Reset leaves no stale state behind: the same failure repeats.
    matches!(
        engine.execute(vec![HostTensor::from_f32(&[0.0; 8])]).await,
        Err(EngineError::AllocationFailed { .. })
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_device_sync_fault() {
    let device = CpuDeviceContext::new(0);
    let tracked = Tracked::new(AddScalarKernel::new(f32_meta(2), 1.0));
    let engine = fan_out(&tracked, &device, 1);

    device.inject_sync_fault("uncorrectable ECC error");
    let err = engine.execute(x()).await.unwrap_err();
    assert_eq!(
        err,
        EngineError::DeviceSync {
            device: "CPU_0".to_string(),
            op: "synchronize_stream".to_string(),
            message: "uncorrectable ECC error".to_string(),
        }
    );
    assert_no_leaks(&device);

    let out = engine.execute(x()).await.unwrap();
    assert_eq!(out.outputs[0].to_vec::<f32>(), vec![2.0, 3.0]);
    assert_no_leaks(&device);
}

fn slow_chain(device: &Arc<CpuDeviceContext>, config: EngineConfig, delay: Duration) -> ActorEngine {
    let tracked = Tracked::slow(AddScalarKernel::new(f32_meta(2), 1.0), delay);
    let graph = GraphBuilder::new("slow")
        .host_input("x", cpu(0), 0, f32_meta(2))
        .kernel("slow", cpu(0), tracked.kernel_ref(), [NodeInput::node("x", 0)])
        .output(NodeInput::node("slow", 0))
        .build();
    KernelFlow::builder()
        .device(Arc::clone(device) as Arc<dyn DeviceContext>)
        .graph(graph)
        .config(config)
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abort() {
    let device = CpuDeviceContext::new(0);
    let config = EngineConfig::builder().loop_count(10).build().unwrap();
    let engine = Arc::new(slow_chain(&device, config, Duration::from_millis(50)));

    let running = Arc::clone(&engine);
    let handle = tokio::spawn(async move { running.execute(x()).await });
    tokio::time::sleep(Duration::from_millis(60)).await;
    engine.abort();

    let result = handle.await.unwrap();
    assert_eq!(result.unwrap_err(), EngineError::Aborted);
    assert_eq!(engine.phase(), RunPhase::Idle);
    assert_eq!(engine.stats().failed_runs, 1);
    assert_no_leaks(&device);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timeout() {
    let device = CpuDeviceContext::new(0);
    let limit = Duration::from_millis(50);
    let config = EngineConfig::builder()
        .loop_count(10)
        .run_timeout(limit)
        .build()
        .unwrap();
    let engine = slow_chain(&device, config, Duration::from_millis(30));

    let err = engine.execute(x()).await.unwrap_err();
    assert_eq!(err, EngineError::Timeout(limit));
    assert_no_leaks(&device);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_store_is_frozen_during_run() {
    let device = CpuDeviceContext::new(0);
    let config = EngineConfig::builder().loop_count(4).build().unwrap();
    let engine = Arc::new(slow_chain(&device, config, Duration::from_millis(25)));

    let running = Arc::clone(&engine);
    let handle = tokio::spawn(async move { running.execute(x()).await });
    tokio::time::sleep(Duration::from_millis(30)).await;

    let err = engine.store_mut(|store| store.len()).unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }), "{:?}", err);

    let out = handle.await.unwrap().unwrap();
    assert_eq!(out.steps, 4);
    assert_eq!(engine.store_mut(|store| store.len()).unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_invalid_inputs_leave_engine_usable() {
    let device = CpuDeviceContext::new(0);
    let tracked = Tracked::new(AddScalarKernel::new(f32_meta(2), 1.0));
    let engine = fan_out(&tracked, &device, 1);

    let err = engine.execute(Vec::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
    let err = engine
        .execute(vec![HostTensor::from_f32(&[1.0, 2.0, 3.0])])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
    assert_eq!(tracked.launches(), 0);
    assert_eq!(device.stats().allocations, 0);

    assert!(engine.execute(x()).await.is_ok());
    assert_no_leaks(&device);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_execute_after_shutdown() {
    let device = CpuDeviceContext::new(0);
    let tracked = Tracked::new(AddScalarKernel::new(f32_meta(2), 1.0));
    let engine = fan_out(&tracked, &device, 1);

    engine.execute(x()).await.unwrap();
    engine.shutdown().await.unwrap();
    engine.shutdown().await.unwrap();

    let err = engine.execute(x()).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }));
    assert_no_leaks(&device);
}
