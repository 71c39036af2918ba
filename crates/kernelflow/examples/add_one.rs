//! Add One Example
//!
//! Builds the smallest useful graph, `x -> AddScalar(+1) -> output`, runs it
//! for a few iterations and prints the result, the engine statistics and the
//! actor-graph dump.
//!
//! Run with `RUST_LOG=kernelflow_core=debug` to watch actors fire.

use std::sync::Arc;

use anyhow::Context;
use kernelflow::prelude::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cpu = DeviceContextKey::cpu(0);
    let meta = TensorMeta::new(DType::F32, vec![4]);
    let add_one = KernelRef::registered(
        "AddScalar",
        KernelSignature::new(vec![meta.clone()], vec![meta.clone()]).with_attr("scalar", 1.0),
    );
    let graph = GraphBuilder::new("add_one")
        .host_input("x", cpu.clone(), 0, meta)
        .kernel("add", cpu, add_one, [NodeInput::node("x", 0)])
        .output(NodeInput::node("add", 0))
        .build();

    let device = CpuDeviceContext::new(0);
    let config = EngineConfig::builder().loop_count(3).profile(true).build()?;
    let engine = KernelFlow::builder()
        .device(Arc::clone(&device) as Arc<dyn DeviceContext>)
        .graph(graph)
        .config(config)
        .build()
        .context("failed to build engine")?;

    println!("{}", engine.dump());

    let out = engine
        .execute(vec![HostTensor::from_f32(&[1.0, 2.0, 3.0, 4.0])])
        .await
        .context("run failed")?;
    println!("output: {:?}", out.outputs[0].to_vec::<f32>());
    println!("steps: {}", out.steps);
    if let Some(profile) = &out.profile {
        for (actor, timing) in &profile.actors {
            println!("  {:<24} runs={} total={:?}", actor, timing.runs, timing.total);
        }
    }

    let stats = engine.stats();
    println!(
        "runs={} iterations={} launches={} messages={}",
        stats.runs, stats.iterations, stats.kernel_launches, stats.messages_delivered
    );
    println!("device: {:?}", device.stats());

    engine.shutdown().await?;
    Ok(())
}
