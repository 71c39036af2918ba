//! Engine: owns a compiled actor set and drives runs through it.
//!
//! One mailbox task is spawned per actor when the engine is built. Each
//! [`execute`](GraphExecutor::execute) call creates a fresh [`RunContext`],
//! kicks the data prepare actor and waits for the output actor to complete
//! the run. Runs are serialized.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::actor::mailbox_loop;
use crate::compiler::{compile, ActorSet};
use crate::config::EngineConfig;
use crate::device::{DeviceContext, DeviceRegistry};
use crate::dump::{dump_actor_set, write_dump};
use crate::error::{EngineError, Result};
use crate::graph::GraphDescriptor;
use crate::kernel::KernelRegistry;
use crate::message::ActorMessage;
use crate::router::ActorRouter;
use crate::run::{RunContext, RunOutput, RunPhase};
use crate::store::DeviceTensorStore;
use crate::types::{HostTensor, RunId};

/// Executes a compiled graph.
#[async_trait]
pub trait GraphExecutor: Send + Sync {
    /// Run the graph on `inputs` for the configured number of iterations.
    async fn execute(&self, inputs: Vec<HostTensor>) -> Result<RunOutput>;

    /// Abort the run in progress, if any.
    fn abort(&self);

    /// Human-readable dump of the actor set.
    fn dump(&self) -> String;

    /// Get engine statistics.
    fn stats(&self) -> EngineStats;

    /// Stop every actor. The engine cannot run afterwards.
    async fn shutdown(&self) -> Result<()>;
}

/// Engine statistics accumulated over all runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Runs started.
    pub runs: u64,
    /// Runs that ended in an error.
    pub failed_runs: u64,
    /// Iterations started.
    pub iterations: u64,
    /// Kernel launches.
    pub kernel_launches: u64,
    /// Messages delivered between actors.
    pub messages_delivered: u64,
    /// Complete result sets assembled.
    pub result_sets: u64,
}

/// Builder for [`ActorEngine`].
#[derive(Debug, Default)]
pub struct EngineBuilder {
    graph: Option<GraphDescriptor>,
    devices: DeviceRegistry,
    kernels: Option<KernelRegistry>,
    config: EngineConfig,
    store: DeviceTensorStore,
}

impl EngineBuilder {
    /// Create a builder with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the graph to execute.
    pub fn graph(mut self, graph: GraphDescriptor) -> Self {
        self.graph = Some(graph);
        self
    }

    /// Register a device context.
    pub fn device(mut self, device: Arc<dyn DeviceContext>) -> Self {
        self.devices.register(device);
        self
    }

    /// Register several device contexts.
    pub fn devices(mut self, devices: impl IntoIterator<Item = Arc<dyn DeviceContext>>) -> Self {
        for device in devices {
            self.devices.register(device);
        }
        self
    }

    /// Set the kernel registry. Defaults to every statically registered kernel.
    pub fn kernels(mut self, kernels: KernelRegistry) -> Self {
        self.kernels = Some(kernels);
        self
    }

    /// Set the configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the number of iterations per run.
    pub fn loop_count(mut self, loop_count: u64) -> Self {
        self.config.loop_count = loop_count;
        self
    }

    /// Set the persistent tensor store.
    pub fn store(mut self, store: DeviceTensorStore) -> Self {
        self.store = store;
        self
    }

    /// Registered device contexts.
    pub fn device_registry(&self) -> &DeviceRegistry {
        &self.devices
    }

    /// Compile the graph and spawn one task per actor.
    ///
    /// Actors run on the ambient tokio runtime when called from inside one,
    /// otherwise on a runtime owned by the engine.
    pub fn build(self) -> Result<ActorEngine> {
        self.config.validate()?;
        let graph = self
            .graph
            .ok_or_else(|| EngineError::InvalidConfig("no graph set".to_string()))?;
        let kernels = self.kernels.unwrap_or_else(KernelRegistry::discover);
        let set = compile(&graph, &self.devices, &kernels)?;

        if self.config.dump.enabled {
            write_dump(&set, self.config.loop_count, Some(&self.store), &self.config.dump.dir)?;
        }

        let (handle, runtime) = match Handle::try_current() {
            Ok(handle) => (handle, None),
            Err(_) => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(self.config.worker_threads)
                    .thread_name("kernelflow-actor")
                    .enable_all()
                    .build()?;
                (runtime.handle().clone(), Some(runtime))
            }
        };

        let router = ActorRouter::new();
        let tasks = set
            .actors()
            .iter()
            .map(|actor| {
                let mailbox = router.register(actor.id().clone());
                handle.spawn(mailbox_loop(Arc::clone(actor), mailbox, Arc::clone(&router)))
            })
            .collect();

        info!(
            graph = %set.name,
            actors = set.len(),
            loop_count = self.config.loop_count,
            owned_runtime = runtime.is_some(),
            "engine built"
        );

        Ok(ActorEngine {
            set: Arc::new(set),
            router,
            config: self.config,
            store: RwLock::new(Arc::new(self.store)),
            run_lock: tokio::sync::Mutex::new(()),
            current: Mutex::new(None),
            next_run: AtomicU64::new(1),
            counters: Counters::default(),
            tasks: Mutex::new(tasks),
            runtime,
            shutdown: AtomicBool::new(false),
        })
    }
}

#[derive(Debug, Default)]
struct Counters {
    runs: AtomicU64,
    failed_runs: AtomicU64,
    iterations: AtomicU64,
    kernel_launches: AtomicU64,
    result_sets: AtomicU64,
}

/// Actor-based executor of one compiled graph.
pub struct ActorEngine {
    set: Arc<ActorSet>,
    router: Arc<ActorRouter>,
    config: EngineConfig,
    store: RwLock<Arc<DeviceTensorStore>>,
    run_lock: tokio::sync::Mutex<()>,
    current: Mutex<Option<Arc<RunContext>>>,
    next_run: AtomicU64,
    counters: Counters,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    runtime: Option<Runtime>,
    shutdown: AtomicBool,
}

impl ActorEngine {
    /// Create a builder.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Compiled actor set.
    pub fn actor_set(&self) -> &ActorSet {
        &self.set
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Phase of the run in progress, `Idle` when there is none.
    pub fn phase(&self) -> RunPhase {
        self.current
            .lock()
            .as_ref()
            .map_or(RunPhase::Idle, |run| run.phase())
    }

    /// Check if the engine was shut down.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Snapshot of the persistent tensor store.
    pub fn store(&self) -> Arc<DeviceTensorStore> {
        Arc::clone(&self.store.read())
    }

    /// Mutate the persistent tensor store.
    ///
    /// Fails with [`EngineError::InvalidState`] while a run is in progress.
    pub fn store_mut<R>(&self, f: impl FnOnce(&mut DeviceTensorStore) -> R) -> Result<R> {
        let _idle = self.run_lock.try_lock().map_err(|_| EngineError::InvalidState {
            expected: RunPhase::Idle.to_string(),
            actual: self.phase().to_string(),
        })?;
        let mut store = self.store.write();
        Ok(f(Arc::make_mut(&mut store)))
    }

    /// Blocking variant of [`execute`](GraphExecutor::execute).
    ///
    /// Only available when the engine owns its runtime.
    pub fn execute_blocking(&self, inputs: Vec<HostTensor>) -> Result<RunOutput> {
        match &self.runtime {
            Some(runtime) => runtime.block_on(self.execute(inputs)),
            None => Err(EngineError::InvalidState {
                expected: "engine-owned runtime".to_string(),
                actual: "ambient runtime".to_string(),
            }),
        }
    }

    fn check_inputs(&self, inputs: &[HostTensor]) -> Result<()> {
        let expected = &self.set.host_inputs;
        if inputs.len() != expected.len() {
            return Err(EngineError::InvalidInput(format!(
                "expected {} inputs, got {}",
                expected.len(),
                inputs.len()
            )));
        }
        for (position, (input, meta)) in inputs.iter().zip(expected).enumerate() {
            if input.byte_size() != meta.byte_size() {
                return Err(EngineError::InvalidInput(format!(
                    "input {} is {} bytes, expected {} bytes ({})",
                    position,
                    input.byte_size(),
                    meta.byte_size(),
                    meta
                )));
            }
        }
        Ok(())
    }

    async fn await_outcome(
        &self,
        run: &Arc<RunContext>,
        done: oneshot::Receiver<Result<RunOutput>>,
    ) -> Result<RunOutput> {
        let received = match self.config.run_timeout {
            Some(limit) => match tokio::time::timeout(limit, done).await {
                Ok(received) => received,
                Err(_) => {
                    run.fail(EngineError::Timeout(limit));
                    return Err(EngineError::Timeout(limit));
                }
            },
            None => done.await,
        };
        received.unwrap_or_else(|_| Err(EngineError::Internal("run completion dropped".to_string())))
    }

    /// Wait for stragglers, then return every actor to a clean state.
    async fn settle(&self, run: &Arc<RunContext>, failed: bool) {
        run.wait_drained().await;

        if failed {
            for ack in self.router.broadcast_reset() {
                let _ = ack.await;
            }
            let swept = run.sweep_live();
            debug!(run = %run.id(), swept, "actors reset after failure");
        } else if self.config.check_leaks {
            let leaked = run.live_tensors();
            if !leaked.is_empty() {
                warn!(
                    run = %run.id(),
                    count = leaked.len(),
                    bytes = leaked.iter().map(|t| t.size()).sum::<usize>(),
                    "transient tensors survived the run"
                );
                run.sweep_live();
            }
        }
    }

    fn record(&self, run: &RunContext, failed: bool) {
        let counters = run.counters();
        let c = &self.counters;
        c.runs.fetch_add(1, Ordering::Relaxed);
        if failed {
            c.failed_runs.fetch_add(1, Ordering::Relaxed);
        }
        c.iterations.fetch_add(counters.iterations, Ordering::Relaxed);
        c.kernel_launches.fetch_add(counters.kernel_launches, Ordering::Relaxed);
        c.result_sets.fetch_add(counters.result_sets, Ordering::Relaxed);
    }
}

#[async_trait]
impl GraphExecutor for ActorEngine {
    async fn execute(&self, inputs: Vec<HostTensor>) -> Result<RunOutput> {
        if self.is_shutdown() {
            return Err(EngineError::InvalidState {
                expected: "running engine".to_string(),
                actual: "shut down".to_string(),
            });
        }
        let _serial = self.run_lock.lock().await;
        self.check_inputs(&inputs)?;

        let id = RunId(self.next_run.fetch_add(1, Ordering::Relaxed));
        let (run, done) = RunContext::new(
            id,
            inputs,
            self.config.loop_count,
            self.store(),
            self.config.profile,
        );
        *self.current.lock() = Some(Arc::clone(&run));
        info!(run = %id, graph = %self.set.name, loop_count = self.config.loop_count, "run started");

        let outcome = match self.router.send(&run, &self.set.data_prepare, ActorMessage::Start) {
            Ok(()) => self.await_outcome(&run, done).await,
            Err(err) => {
                run.fail(err.clone());
                Err(err)
            }
        };

        let failed = outcome.is_err();
        self.settle(&run, failed).await;
        self.record(&run, failed);
        *self.current.lock() = None;
        outcome
    }

    fn abort(&self) {
        if let Some(run) = self.current.lock().as_ref() {
            info!(run = %run.id(), "aborting run");
            run.fail(EngineError::Aborted);
        }
    }

    fn dump(&self) -> String {
        dump_actor_set(&self.set, self.config.loop_count, Some(&self.store()))
    }

    fn stats(&self) -> EngineStats {
        let c = &self.counters;
        EngineStats {
            runs: c.runs.load(Ordering::Relaxed),
            failed_runs: c.failed_runs.load(Ordering::Relaxed),
            iterations: c.iterations.load(Ordering::Relaxed),
            kernel_launches: c.kernel_launches.load(Ordering::Relaxed),
            messages_delivered: self.router.stats().messages_delivered,
            result_sets: c.result_sets.load(Ordering::Relaxed),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(graph = %self.set.name, "shutting down engine");
        self.abort();
        let _serial = self.run_lock.lock().await;

        self.router.stop_all();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                debug!(error = %e, "actor task ended abnormally");
            }
        }
        info!(graph = %self.set.name, "engine shut down");
        Ok(())
    }
}

impl Drop for ActorEngine {
    fn drop(&mut self) {
        self.router.stop_all();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for ActorEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorEngine")
            .field("graph", &self.set.name)
            .field("actors", &self.set.len())
            .field("phase", &self.phase())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
