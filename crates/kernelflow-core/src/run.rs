//! Per-`execute` run context.
//!
//! Everything that belongs to one run lives here instead of in process-wide
//! state: the phase machine, abort flag, completion channel, in-flight
//! message accounting, the transient tensors still alive, and the optional
//! per-actor profile.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error};

use crate::device::DeviceTensor;
use crate::error::{EngineError, Result};
use crate::store::DeviceTensorStore;
use crate::types::{ActorId, HostTensor, RunId};

/// Run state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    /// No run in progress.
    Idle,
    /// Inputs are being staged for the first iteration.
    Preparing,
    /// Iteration `n` is executing.
    Iterating(u64),
    /// The last iteration finished; output is being assembled.
    Draining,
    /// The run completed or failed.
    Done,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Preparing => f.write_str("preparing"),
            Self::Iterating(n) => write!(f, "iterating({})", n),
            Self::Draining => f.write_str("draining"),
            Self::Done => f.write_str("done"),
        }
    }
}

/// Accumulated time spent in one actor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActorTiming {
    /// Number of `run` invocations.
    pub runs: u64,
    /// Total wall time.
    pub total: Duration,
}

/// Per-actor timings of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunProfile {
    /// Timings by actor name.
    pub actors: BTreeMap<String, ActorTiming>,
}

impl RunProfile {
    /// Timing of one actor.
    pub fn get(&self, actor: &str) -> Option<&ActorTiming> {
        self.actors.get(actor)
    }
}

/// Result of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutput {
    /// Output tensors by position.
    pub outputs: Vec<HostTensor>,
    /// Iterations that completed with data.
    pub steps: u64,
    /// The run ended because a data source ran dry.
    pub end_of_input: bool,
    /// Per-actor timings, when profiling is enabled.
    pub profile: Option<RunProfile>,
}

/// Counters collected while a run executes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunCounters {
    /// Iterations started.
    pub iterations: u64,
    /// Kernel launches.
    pub kernel_launches: u64,
    /// Complete result sets seen by the output actor.
    pub result_sets: u64,
}

/// Shared state of one `execute` call.
pub struct RunContext {
    id: RunId,
    inputs: Vec<HostTensor>,
    loop_count: u64,
    store: Arc<DeviceTensorStore>,
    phase: Mutex<RunPhase>,
    aborted: AtomicBool,
    error: Mutex<Option<EngineError>>,
    completion: Mutex<Option<oneshot::Sender<Result<RunOutput>>>>,
    in_flight: AtomicUsize,
    drained: Notify,
    end_of_input: Mutex<Option<(u64, ActorId)>>,
    steps: AtomicU64,
    iterations: AtomicU64,
    kernel_launches: AtomicU64,
    result_sets: AtomicU64,
    live: Mutex<Vec<Arc<DeviceTensor>>>,
    profile: Option<Mutex<RunProfile>>,
}

impl RunContext {
    /// Create a run context and the receiver its outcome is delivered on.
    pub fn new(
        id: RunId,
        inputs: Vec<HostTensor>,
        loop_count: u64,
        store: Arc<DeviceTensorStore>,
        profile: bool,
    ) -> (Arc<Self>, oneshot::Receiver<Result<RunOutput>>) {
        let (tx, rx) = oneshot::channel();
        let ctx = Arc::new(Self {
            id,
            inputs,
            loop_count,
            store,
            phase: Mutex::new(RunPhase::Idle),
            aborted: AtomicBool::new(false),
            error: Mutex::new(None),
            completion: Mutex::new(Some(tx)),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            end_of_input: Mutex::new(None),
            steps: AtomicU64::new(0),
            iterations: AtomicU64::new(0),
            kernel_launches: AtomicU64::new(0),
            result_sets: AtomicU64::new(0),
            live: Mutex::new(Vec::new()),
            profile: profile.then(|| Mutex::new(RunProfile::default())),
        });
        (ctx, rx)
    }

    /// Run id.
    pub fn id(&self) -> RunId {
        self.id
    }

    /// Host input at `position`.
    pub fn input(&self, position: usize) -> Option<&HostTensor> {
        self.inputs.get(position)
    }

    /// Iterations to execute.
    pub fn loop_count(&self) -> u64 {
        self.loop_count
    }

    /// Persistent tensors visible to this run.
    pub fn store(&self) -> &DeviceTensorStore {
        &self.store
    }

    // ------------------------------------------------------------------
    // Phase
    // ------------------------------------------------------------------

    /// Current phase.
    pub fn phase(&self) -> RunPhase {
        *self.phase.lock()
    }

    /// Move to `phase`. A finished run stays finished.
    pub fn set_phase(&self, phase: RunPhase) {
        let mut current = self.phase.lock();
        if *current != RunPhase::Done {
            debug!(run = %self.id, from = %*current, to = %phase, "run phase");
            *current = phase;
        }
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    /// Check if the run was aborted or failed.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// First fatal error, if any.
    pub fn error(&self) -> Option<EngineError> {
        self.error.lock().clone()
    }

    /// Fail the run. Only the first error is reported.
    pub fn fail(&self, err: EngineError) {
        {
            let mut slot = self.error.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(err.clone());
        }
        self.aborted.store(true, Ordering::Release);
        error!(run = %self.id, error = %err, "run failed");
        self.set_phase(RunPhase::Done);
        if let Some(tx) = self.completion.lock().take() {
            let _ = tx.send(Err(err));
        }
    }

    /// Complete the run successfully.
    pub fn complete(&self, output: RunOutput) {
        if self.is_aborted() {
            return;
        }
        self.set_phase(RunPhase::Done);
        if let Some(tx) = self.completion.lock().take() {
            let _ = tx.send(Ok(output));
        }
    }

    // ------------------------------------------------------------------
    // In-flight accounting
    // ------------------------------------------------------------------

    /// Record a message handed to a mailbox.
    pub fn message_sent(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// Record a message fully handled.
    pub fn message_done(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Messages sent but not yet handled.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Wait until no message of this run is in flight.
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    // ------------------------------------------------------------------
    // Iteration bookkeeping
    // ------------------------------------------------------------------

    /// Record that `source` ran out of input in `iteration`. The earliest
    /// iteration wins.
    pub fn set_end_of_input(&self, iteration: u64, source: &ActorId) {
        let mut slot = self.end_of_input.lock();
        if slot.as_ref().map_or(true, |(at, _)| iteration < *at) {
            *slot = Some((iteration, source.clone()));
        }
    }

    /// Check if a data source ran out of input.
    pub fn end_of_input(&self) -> bool {
        self.end_of_input.lock().is_some()
    }

    /// Iteration in which input ran out. No result of it or a later
    /// iteration is user-visible.
    pub fn end_of_input_at(&self) -> Option<u64> {
        self.end_of_input.lock().as_ref().map(|(at, _)| *at)
    }

    /// Data source that ran out of input first.
    pub fn end_of_input_source(&self) -> Option<ActorId> {
        self.end_of_input.lock().as_ref().map(|(_, source)| source.clone())
    }

    /// Record completed iterations.
    pub fn set_steps(&self, steps: u64) {
        self.steps.store(steps, Ordering::Release);
    }

    /// Completed iterations.
    pub fn steps(&self) -> u64 {
        self.steps.load(Ordering::Acquire)
    }

    /// Record an iteration start.
    pub fn record_iteration(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a kernel launch.
    pub fn record_kernel_launch(&self) {
        self.kernel_launches.fetch_add(1, Ordering::Relaxed);
    }

    /// Record complete result sets.
    pub fn record_result_sets(&self, sets: u64) {
        self.result_sets.fetch_add(sets, Ordering::Relaxed);
    }

    /// Counter snapshot.
    pub fn counters(&self) -> RunCounters {
        RunCounters {
            iterations: self.iterations.load(Ordering::Relaxed),
            kernel_launches: self.kernel_launches.load(Ordering::Relaxed),
            result_sets: self.result_sets.load(Ordering::Relaxed),
        }
    }

    // ------------------------------------------------------------------
    // Live transient tensors
    // ------------------------------------------------------------------

    /// Track a transient tensor created during this run.
    pub fn track(&self, tensor: &Arc<DeviceTensor>) {
        if !tensor.is_persistent() {
            self.live.lock().push(Arc::clone(tensor));
        }
    }

    /// Forget tensors whose memory is already freed.
    pub fn prune_live(&self) {
        self.live.lock().retain(|t| t.is_allocated());
    }

    /// Tensors still holding memory.
    pub fn live_tensors(&self) -> Vec<Arc<DeviceTensor>> {
        self.live
            .lock()
            .iter()
            .filter(|t| t.is_allocated())
            .cloned()
            .collect()
    }

    /// Free every tracked tensor still holding memory. Returns how many were freed.
    pub fn sweep_live(&self) -> usize {
        let live = std::mem::take(&mut *self.live.lock());
        live.iter().filter(|t| t.force_free()).count()
    }

    // ------------------------------------------------------------------
    // Profiling
    // ------------------------------------------------------------------

    /// Check if profiling is enabled.
    pub fn is_profiling(&self) -> bool {
        self.profile.is_some()
    }

    /// Add one timed `run` of `actor`.
    pub fn record_timing(&self, actor: &ActorId, elapsed: Duration) {
        if let Some(profile) = &self.profile {
            let mut profile = profile.lock();
            let entry = profile.actors.entry(actor.to_string()).or_default();
            entry.runs += 1;
            entry.total += elapsed;
        }
    }

    /// Snapshot of the profile.
    pub fn profile(&self) -> Option<RunProfile> {
        self.profile.as_ref().map(|p| p.lock().clone())
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("id", &self.id)
            .field("phase", &self.phase())
            .field("aborted", &self.is_aborted())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
