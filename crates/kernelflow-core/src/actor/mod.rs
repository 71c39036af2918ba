//! Actors of a compiled graph.
//!
//! Every actor runs as its own task draining one mailbox. Topology lives in
//! an immutable [`Actor`]; everything that changes while messages arrive
//! lives in the task-private [`ActorState`].
//!
//! # Protocol
//!
//! A worker actor (data source, kernel, super kernel, copy, gather, switch)
//! counts data and control deliveries per iteration. Once every dependency
//! of an iteration has arrived it either runs, or skips when one of them
//! was a skip marker. Skipping releases whatever it holds and sends skip
//! markers downstream so consumers still see a complete iteration.

mod base;
mod copy;
mod data_prepare;
mod data_source;
mod gather;
mod kernel;
mod loop_count;
mod output;
mod super_kernel;
mod switch;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace, warn};

pub use base::{ActorBase, ActorContext, InputSlot, InputTracker, Inputs, PendingInputs};
pub use copy::CopyActor;
pub use data_prepare::DataPrepareActor;
pub use data_source::{DataSourceActor, DataSourceKind};
pub use gather::GatherActor;
pub use kernel::KernelActor;
pub use loop_count::LoopCountActor;
pub use output::{OutputActor, OutputState};
pub use super_kernel::{SuperKernelActor, SuperKernelStep};
pub use switch::SwitchActor;

use crate::device::DeviceTensor;
use crate::error::{EngineError, Result};
use crate::message::{ActorMessage, Envelope, Payload};
use crate::router::{ActorRouter, Mailbox};
use crate::run::RunContext;
use crate::types::{ActorId, RunId};

/// Work performed by a worker actor once an iteration's inputs are complete.
pub trait ActorBehavior: Send + Sync {
    /// Execute one iteration. `inputs` holds the delivered value per slot.
    fn run(&self, ctx: &ActorContext<'_>, inputs: Vec<Option<Arc<DeviceTensor>>>) -> Result<()>;

    /// Handle an iteration on a dead path.
    fn skip(&self, ctx: &ActorContext<'_>, inputs: Vec<Option<Arc<DeviceTensor>>>) -> Result<()> {
        ctx.release_inputs(&inputs)?;
        ctx.skip_all()
    }
}

/// What an actor does.
pub enum ActorKind {
    /// Opens iterations.
    DataPrepare(DataPrepareActor),
    /// Stages inputs.
    DataSource(DataSourceActor),
    /// Launches one kernel.
    Kernel(KernelActor),
    /// Launches a fused sequence of kernels.
    SuperKernel(SuperKernelActor),
    /// Moves a tensor between devices.
    Copy(CopyActor),
    /// Relays several values.
    Gather(GatherActor),
    /// Routes values by condition.
    Switch(SwitchActor),
    /// Closes iterations.
    LoopCount(LoopCountActor),
    /// Assembles the run's result.
    Output(OutputActor),
}

impl ActorKind {
    /// Short name of the kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::DataPrepare(_) => "data_prepare",
            Self::DataSource(_) => "data_source",
            Self::Kernel(_) => "kernel",
            Self::SuperKernel(_) => "super_kernel",
            Self::Copy(_) => "copy",
            Self::Gather(_) => "gather",
            Self::Switch(_) => "switch",
            Self::LoopCount(_) => "loop_count",
            Self::Output(_) => "output",
        }
    }

    /// Worker behavior, for kinds that follow the common input protocol.
    pub fn behavior(&self) -> Option<&dyn ActorBehavior> {
        match self {
            Self::DataSource(a) => Some(a),
            Self::Kernel(a) => Some(a),
            Self::SuperKernel(a) => Some(a),
            Self::Copy(a) => Some(a),
            Self::Gather(a) => Some(a),
            Self::Switch(a) => Some(a),
            Self::DataPrepare(_) | Self::LoopCount(_) | Self::Output(_) => None,
        }
    }
}

impl std::fmt::Debug for ActorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Mutable state owned by an actor's task.
#[derive(Debug)]
pub enum ActorState {
    /// Pending iterations of a worker actor.
    Inputs(PendingInputs),
    /// Control signals received per iteration.
    LoopCount(HashMap<u64, usize>),
    /// Result sets being assembled.
    Output(OutputState),
    /// Stateless actor.
    None,
}

/// One actor of a compiled graph.
#[derive(Debug)]
pub struct Actor {
    /// Topology and device bindings.
    pub base: ActorBase,
    /// Behavior.
    pub kind: ActorKind,
}

impl Actor {
    /// Create an actor.
    pub fn new(base: ActorBase, kind: ActorKind) -> Self {
        Self { base, kind }
    }

    /// Actor id.
    pub fn id(&self) -> &ActorId {
        &self.base.id
    }

    /// Fresh state for this actor.
    pub fn new_state(&self) -> ActorState {
        match &self.kind {
            ActorKind::LoopCount(_) => ActorState::LoopCount(HashMap::new()),
            ActorKind::Output(_) => ActorState::Output(OutputState::default()),
            ActorKind::DataPrepare(_) => ActorState::None,
            _ => ActorState::Inputs(PendingInputs::default()),
        }
    }

    /// Count a data delivery for `iteration`.
    pub fn on_receive_data(
        &self,
        pending: &mut PendingInputs,
        run: RunId,
        iteration: u64,
        input_index: usize,
        payload: Payload,
    ) -> Result<()> {
        let label = format!("input {}", input_index);
        pending
            .tracker(&self.base, run, iteration, &label)?
            .on_data(&self.base, iteration, input_index, payload)
    }

    /// Count a control delivery for `iteration`.
    pub fn on_receive_control(
        &self,
        pending: &mut PendingInputs,
        run: RunId,
        iteration: u64,
        skipped: bool,
    ) -> Result<()> {
        pending
            .tracker(&self.base, run, iteration, "control")?
            .on_control(&self.base, iteration, skipped)
    }

    fn try_run(&self, ctx: &ActorContext<'_>, behavior: &dyn ActorBehavior, pending: &mut PendingInputs) -> Result<()> {
        let Some(tracker) = pending.take_ready(&self.base, ctx.iteration) else {
            return Ok(());
        };
        let inputs = tracker.into_inputs(&self.base);
        if inputs.dead {
            debug!(actor = %self.base.id, iteration = ctx.iteration, "dead path, skipping");
            return behavior.skip(ctx, inputs.values);
        }

        let started = ctx.run.is_profiling().then(Instant::now);
        let result = behavior.run(ctx, inputs.values);
        if let Some(started) = started {
            ctx.run.record_timing(&self.base.id, started.elapsed());
        }
        result
    }

    /// Handle one message of `run`.
    pub fn handle(
        &self,
        state: &mut ActorState,
        run: &Arc<RunContext>,
        router: &ActorRouter,
        message: ActorMessage,
    ) -> Result<()> {
        let ctx = ActorContext {
            base: &self.base,
            run,
            router,
            iteration: message.iteration(),
        };
        match (&self.kind, state) {
            (ActorKind::DataPrepare(actor), _) => actor.on_message(&ctx, message),
            (ActorKind::LoopCount(actor), ActorState::LoopCount(counts)) => actor.on_message(&ctx, counts, message),
            (ActorKind::Output(actor), ActorState::Output(state)) => actor.on_message(&ctx, state, message),
            (kind, ActorState::Inputs(pending)) => {
                let behavior = kind.behavior().ok_or_else(|| {
                    EngineError::Internal(format!("actor '{}' has no behavior", self.base.id))
                })?;
                match message {
                    ActorMessage::Data {
                        iteration,
                        input_index,
                        payload,
                        ..
                    } => self.on_receive_data(pending, run.id(), iteration, input_index, payload)?,
                    ActorMessage::Control {
                        iteration, skipped, ..
                    } => self.on_receive_control(pending, run.id(), iteration, skipped)?,
                    other => {
                        return Err(EngineError::protocol(
                            self.base.id.as_str(),
                            format!("unexpected {} message", other.kind()),
                        ))
                    }
                }
                self.try_run(&ctx, behavior, pending)
            }
            (kind, _) => Err(EngineError::Internal(format!(
                "actor '{}' of kind {} has mismatched state",
                self.base.id,
                kind.name()
            ))),
        }
    }
}

/// Drain `mailbox` until stopped.
pub(crate) async fn mailbox_loop(actor: Arc<Actor>, mut mailbox: Mailbox, router: Arc<ActorRouter>) {
    let mut state = actor.new_state();
    while let Some(envelope) = mailbox.recv().await {
        match envelope {
            Envelope::Run { run, message } => {
                if !run.is_aborted() {
                    if let Err(err) = actor.handle(&mut state, &run, &router, message) {
                        if err.is_fatal() {
                            run.fail(err);
                        } else {
                            warn!(actor = %actor.id(), error = %err, "non-fatal actor error");
                        }
                    }
                }
                run.message_done();
            }
            Envelope::Reset(ack) => {
                state = actor.new_state();
                let _ = ack.send(());
            }
            Envelope::Stop => break,
        }
    }
    trace!(actor = %actor.id(), "mailbox closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrow::{ControlArrow, DataArrow};
    use crate::device::testing::TestDevice;
    use crate::kernel::testing::CountingKernel;
    use crate::store::DeviceTensorStore;
    use crate::types::TensorMeta;

    fn kernel_actor(kernel: Arc<CountingKernel>, device: Arc<TestDevice>) -> Actor {
        let mut base = ActorBase::new(ActorId::new("k"), vec![device]);
        base.input_slots = vec![InputSlot {
            expected: 1,
            release_weight: 1,
        }];
        base.output_data_arrows = vec![DataArrow::new(0, ActorId::new("dst"), 0)];
        base.output_control_arrows = vec![ControlArrow::new(ActorId::new("sink"))];
        base.output_fanout = vec![1];
        base.output_sizes = vec![Some(4)];
        base.update_dependent_count();
        Actor::new(base, ActorKind::Kernel(KernelActor::new(kernel)))
    }

    fn input(device: Arc<TestDevice>) -> Arc<DeviceTensor> {
        let t = DeviceTensor::transient(device, 4, TensorMeta::bytes(4), 1);
        t.allocate(&ActorId::new("src")).unwrap();
        t
    }

    #[tokio::test]
    async fn test_kernel_actor_fires_and_forwards() {
        let device = TestDevice::new(0);
        let kernel = CountingKernel::new("inc", vec![4], vec![4]);
        let actor = kernel_actor(Arc::clone(&kernel), Arc::clone(&device));
        let router = ActorRouter::new();
        let mut dst = router.register(ActorId::new("dst"));
        let mut sink = router.register(ActorId::new("sink"));
        let (run, _rx) = RunContext::new(RunId(1), Vec::new(), 1, Arc::new(DeviceTensorStore::new()), false);

        let value = input(Arc::clone(&device));
        let mut state = actor.new_state();
        actor
            .handle(
                &mut state,
                &run,
                &router,
                ActorMessage::Data {
                    iteration: 0,
                    from: ActorId::new("src"),
                    input_index: 0,
                    payload: Payload::Tensor(Arc::clone(&value)),
                },
            )
            .unwrap();

        assert_eq!(kernel.launches(), 1);
        assert!(!value.is_allocated());
        match dst.try_recv().unwrap() {
            Envelope::Run {
                message: ActorMessage::Data { payload, .. },
                ..
            } => assert!(!payload.is_skipped()),
            other => panic!("unexpected envelope {:?}", other),
        }
        assert!(matches!(
            sink.try_recv().unwrap(),
            Envelope::Run {
                message: ActorMessage::Control { skipped: false, .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_dead_input_skips_downstream() {
        let device = TestDevice::new(0);
        let kernel = CountingKernel::new("inc", vec![4], vec![4]);
        let actor = kernel_actor(Arc::clone(&kernel), device);
        let router = ActorRouter::new();
        let mut dst = router.register(ActorId::new("dst"));
        let mut sink = router.register(ActorId::new("sink"));
        let (run, _rx) = RunContext::new(RunId(1), Vec::new(), 1, Arc::new(DeviceTensorStore::new()), false);

        let mut state = actor.new_state();
        actor
            .handle(
                &mut state,
                &run,
                &router,
                ActorMessage::Data {
                    iteration: 0,
                    from: ActorId::new("src"),
                    input_index: 0,
                    payload: Payload::Skipped,
                },
            )
            .unwrap();

        assert_eq!(kernel.launches(), 0);
        assert!(matches!(
            dst.try_recv().unwrap(),
            Envelope::Run {
                message: ActorMessage::Data {
                    payload: Payload::Skipped,
                    ..
                },
                ..
            }
        ));
        assert!(matches!(
            sink.try_recv().unwrap(),
            Envelope::Run {
                message: ActorMessage::Control { skipped: true, .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unexpected_message_is_protocol_error() {
        let device = TestDevice::new(0);
        let actor = kernel_actor(CountingKernel::new("inc", vec![4], vec![4]), device);
        let router = ActorRouter::new();
        let (run, _rx) = RunContext::new(RunId(1), Vec::new(), 1, Arc::new(DeviceTensorStore::new()), false);

        let mut state = actor.new_state();
        let err = actor
            .handle(&mut state, &run, &router, ActorMessage::Start)
            .unwrap_err();
        assert!(err.is_protocol());
    }
}
