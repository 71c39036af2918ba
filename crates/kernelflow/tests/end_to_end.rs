//! End-to-end execution of small graphs on the CPU backend.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{add_scalar, assert_no_leaks, binary, cpu, engine, f32_meta, Tracked};
use kernelflow::prelude::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_add_one() {
    let device = CpuDeviceContext::new(0);
    let graph = GraphBuilder::new("add_one")
        .host_input("x", cpu(0), 0, f32_meta(3))
        .kernel("add", cpu(0), add_scalar(3, 1.0), [NodeInput::node("x", 0)])
        .output(NodeInput::node("add", 0))
        .build();
    let engine = engine(graph, &[Arc::clone(&device)], 1);

    let out = engine
        .execute(vec![HostTensor::from_f32(&[1.0, 2.0, 3.0])])
        .await
        .unwrap();

    assert_eq!(out.outputs.len(), 1);
    assert_eq!(out.outputs[0].to_vec::<f32>(), vec![2.0, 3.0, 4.0]);
    assert_eq!(out.outputs[0].meta, f32_meta(3));
    assert_eq!(out.steps, 1);
    assert!(!out.end_of_input);
    assert!(out.profile.is_none());
    assert_no_leaks(&device);
}

async fn gather_pair(slow_left: bool) -> Vec<Vec<f32>> {
    let delay = Duration::from_millis(30);
    let left = AddScalarKernel::new(f32_meta(2), 1.0);
    let right = AddScalarKernel::new(f32_meta(2), 10.0);
    let (a, b) = if slow_left {
        (Tracked::slow(left, delay), Tracked::new(right))
    } else {
        (Tracked::new(left), Tracked::slow(right, delay))
    };

    let device = CpuDeviceContext::new(0);
    let graph = GraphBuilder::new("gather_pair")
        .host_input("x", cpu(0), 0, f32_meta(2))
        .kernel("a", cpu(0), a.kernel_ref(), [NodeInput::node("x", 0)])
        .kernel("b", cpu(0), b.kernel_ref(), [NodeInput::node("x", 0)])
        .gather("pair", cpu(0), [NodeInput::node("a", 0), NodeInput::node("b", 0)])
        .kernel(
            "sum",
            cpu(0),
            binary("Add", 2),
            [NodeInput::node("pair", 0), NodeInput::node("pair", 1)],
        )
        .output(NodeInput::node("pair", 0))
        .output(NodeInput::node("pair", 1))
        .output(NodeInput::node("sum", 0))
        .build();
    let engine = engine(graph, &[Arc::clone(&device)], 1);

    let out = engine.execute(vec![HostTensor::from_f32(&[1.0, 2.0])]).await.unwrap();
    assert_eq!(a.launches(), 1);
    assert_eq!(b.launches(), 1);
    assert_no_leaks(&device);
    out.outputs.iter().map(|t| t.to_vec::<f32>()).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_gather_is_order_independent() {
    let expected = vec![vec![2.0, 3.0], vec![11.0, 12.0], vec![13.0, 15.0]];
    assert_eq!(gather_pair(true).await, expected);
    assert_eq!(gather_pair(false).await, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_store_inputs() {
    let device = CpuDeviceContext::new(0);
    let mut store = DeviceTensorStore::new();
    store
        .insert_host(
            "w",
            Arc::clone(&device) as Arc<dyn DeviceContext>,
            &HostTensor::from_f32(&[2.0, 3.0]),
        )
        .unwrap();

    let graph = GraphBuilder::new("scale")
        .host_input("x", cpu(0), 0, f32_meta(2))
        .kernel(
            "scale",
            cpu(0),
            binary("Mul", 2),
            [NodeInput::node("x", 0), NodeInput::store("w")],
        )
        .output(NodeInput::node("scale", 0))
        .build();
    let engine = KernelFlow::builder()
        .device(Arc::clone(&device) as Arc<dyn DeviceContext>)
        .graph(graph)
        .store(store)
        .loop_count(2)
        .build()
        .unwrap();

    let input = || vec![HostTensor::from_f32(&[1.0, 2.0])];
    let out = engine.execute(input()).await.unwrap();
    assert_eq!(out.outputs[0].to_vec::<f32>(), vec![2.0, 6.0]);
    // Only the persistent weight survives the run.
    assert_eq!(device.live_allocations(), 1);

    engine
        .store_mut(|store| {
            store.insert_host(
                "w",
                Arc::clone(&device) as Arc<dyn DeviceContext>,
                &HostTensor::from_f32(&[10.0, 10.0]),
            )
        })
        .unwrap()
        .unwrap();
    let out = engine.execute(input()).await.unwrap();
    assert_eq!(out.outputs[0].to_vec::<f32>(), vec![10.0, 20.0]);
    assert_eq!(device.live_allocations(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_copy_between_devices() {
    let d0 = CpuDeviceContext::new(0);
    let d1 = CpuDeviceContext::new(1);
    let graph = GraphBuilder::new("copy")
        .host_input("x", cpu(0), 0, f32_meta(2))
        .copy("to_d1", cpu(0), cpu(1), NodeInput::node("x", 0))
        .kernel("add", cpu(1), add_scalar(2, 1.0), [NodeInput::node("to_d1", 0)])
        .output(NodeInput::node("add", 0))
        .build();
    let engine = engine(graph, &[Arc::clone(&d0), Arc::clone(&d1)], 3);

    let out = engine.execute(vec![HostTensor::from_f32(&[5.0, 6.0])]).await.unwrap();
    assert_eq!(out.outputs[0].to_vec::<f32>(), vec![6.0, 7.0]);
    assert_eq!(out.steps, 3);
    assert_no_leaks(&d0);
    assert_no_leaks(&d1);
    // The output actor synchronizes every device of the graph.
    assert!(d0.syncs() >= 1);
    assert!(d1.syncs() >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_super_kernel() {
    let device = CpuDeviceContext::new(0);
    let fused = SinkGraph::new()
        .kernel("inc", add_scalar(2, 1.0), [SinkValue::Input(0)])
        .kernel(
            "mul",
            binary("Mul", 2),
            [
                SinkValue::Kernel {
                    index: 0,
                    output_index: 0,
                },
                SinkValue::Input(1),
            ],
        )
        .output(SinkValue::Kernel {
            index: 1,
            output_index: 0,
        });
    let graph = GraphBuilder::new("fused")
        .host_input("x", cpu(0), 0, f32_meta(2))
        .host_input("y", cpu(0), 1, f32_meta(2))
        .super_kernel(
            "fused",
            cpu(0),
            fused,
            [NodeInput::node("x", 0), NodeInput::node("y", 0)],
        )
        .output(NodeInput::node("fused", 0))
        .build();
    let engine = engine(graph, &[Arc::clone(&device)], 2);

    let out = engine
        .execute(vec![
            HostTensor::from_f32(&[1.0, 2.0]),
            HostTensor::from_f32(&[3.0, 4.0]),
        ])
        .await
        .unwrap();
    assert_eq!(out.outputs[0].to_vec::<f32>(), vec![6.0, 12.0]);
    assert_eq!(engine.stats().kernel_launches, 4);
    assert_no_leaks(&device);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dump_names_every_actor() {
    let device = CpuDeviceContext::new(0);
    let graph = GraphBuilder::new("dumped")
        .host_input("x", cpu(0), 0, f32_meta(3))
        .kernel("add", cpu(0), add_scalar(3, 1.0), [NodeInput::node("x", 0)])
        .output(NodeInput::node("add", 0))
        .build();
    let engine = engine(graph, &[device], 1);

    let dump = engine.dump();
    for name in [
        "DataPrepareActor",
        "CPU_0_HostDSActor",
        "add",
        "LoopCountActor",
        "OutputActor",
    ] {
        assert!(dump.contains(&format!("actor_name:{}", name)), "{} missing:\n{}", name, dump);
    }
}
