//! Output actor: assembles the user-visible result of a run.
//!
//! Result tensors are grouped per iteration. A set is final once every
//! result arrow of that iteration has delivered, real or skipped. The two
//! newest complete sets are kept; older ones are released as soon as a
//! newer one completes. When the loop count actor signals the end, the
//! output waits for the last iteration's set, copies the newest set from
//! before end of input to the host and completes the run. A run whose input
//! ran out before any set completed fails with `EndOfInput`.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use super::base::ActorContext;
use crate::device::DeviceTensor;
use crate::error::{EngineError, Result};
use crate::message::{ActorMessage, Payload};
use crate::run::RunOutput;

/// Output actor.
#[derive(Debug)]
pub struct OutputActor {
    /// Result arrows per output position.
    pub expected: Vec<usize>,
}

#[derive(Debug)]
struct PendingSet {
    arrivals: Vec<usize>,
    values: Vec<Option<Arc<DeviceTensor>>>,
    remaining: usize,
}

/// Result sets of the run in progress.
#[derive(Debug, Default)]
pub struct OutputState {
    pending: HashMap<u64, PendingSet>,
    /// Newest complete sets by ascending iteration, at most `RETAINED_SETS`.
    retained: Vec<(u64, Vec<Arc<DeviceTensor>>)>,
    complete_sets: u64,
    finalized: u64,
    finish_at: Option<u64>,
}

/// The newest complete set may belong to the end-of-input iteration, so the
/// one before it stays alive until the run finishes.
const RETAINED_SETS: usize = 2;

fn release_all<'a>(tensors: impl IntoIterator<Item = &'a Arc<DeviceTensor>>) -> Result<()> {
    for t in tensors {
        t.release()?;
    }
    Ok(())
}

impl OutputActor {
    /// Number of output positions.
    pub fn positions(&self) -> usize {
        self.expected.len()
    }

    fn total_expected(&self) -> usize {
        self.expected.iter().sum()
    }

    pub(crate) fn on_message(
        &self,
        ctx: &ActorContext<'_>,
        state: &mut OutputState,
        message: ActorMessage,
    ) -> Result<()> {
        match message {
            ActorMessage::Result {
                iteration,
                position,
                payload,
                ..
            } => self.on_result(ctx, state, iteration, position, payload),
            ActorMessage::Control { iteration, .. } => {
                state.finish_at = Some(iteration);
                self.maybe_finish(ctx, state)
            }
            other => Err(EngineError::protocol(
                ctx.base.id.as_str(),
                format!("unexpected {} message", other.kind()),
            )),
        }
    }

    fn on_result(
        &self,
        ctx: &ActorContext<'_>,
        state: &mut OutputState,
        iteration: u64,
        position: usize,
        payload: Payload,
    ) -> Result<()> {
        let expected = self.expected.get(position).copied().ok_or_else(|| {
            EngineError::protocol(
                ctx.base.id.as_str(),
                format!("result for unknown position {}", position),
            )
        })?;
        let duplicate = || EngineError::DuplicateDelivery {
            actor: ctx.base.id.to_string(),
            input: format!("position {}", position),
            iteration,
        };

        let set = state.pending.entry(iteration).or_insert_with(|| PendingSet {
            arrivals: vec![0; self.expected.len()],
            values: vec![None; self.expected.len()],
            remaining: self.total_expected(),
        });
        if set.arrivals[position] >= expected {
            return Err(duplicate());
        }
        if let Payload::Tensor(tensor) = payload {
            if set.values[position].is_some() {
                return Err(duplicate());
            }
            set.values[position] = Some(tensor);
        }
        set.arrivals[position] += 1;
        set.remaining -= 1;

        if set.remaining == 0 {
            if let Some(set) = state.pending.remove(&iteration) {
                self.finalize_set(ctx, state, iteration, set)?;
            }
            self.maybe_finish(ctx, state)?;
        }
        Ok(())
    }

    fn finalize_set(
        &self,
        ctx: &ActorContext<'_>,
        state: &mut OutputState,
        iteration: u64,
        set: PendingSet,
    ) -> Result<()> {
        state.finalized += 1;
        if set.values.iter().all(Option::is_some) {
            let values: Vec<Arc<DeviceTensor>> = set.values.into_iter().flatten().collect();
            state.complete_sets += 1;
            let at = state
                .retained
                .partition_point(|(retained, _)| *retained < iteration);
            state.retained.insert(at, (iteration, values));
            if state.retained.len() > RETAINED_SETS {
                let (_, oldest) = state.retained.remove(0);
                release_all(&oldest)?;
            }
            Ok(())
        } else {
            release_all(set.values.iter().flatten())?;
            if ctx.run.end_of_input_at().is_some_and(|at| iteration >= at) {
                debug!(iteration, "partial result set dropped at end of input");
                Ok(())
            } else {
                Err(EngineError::protocol(
                    ctx.base.id.as_str(),
                    format!("iteration {} produced an incomplete result set", iteration),
                ))
            }
        }
    }

    fn maybe_finish(&self, ctx: &ActorContext<'_>, state: &mut OutputState) -> Result<()> {
        let Some(last) = state.finish_at else {
            return Ok(());
        };
        if self.total_expected() > 0 && state.finalized < last + 1 {
            return Ok(());
        }
        let result = self.finish(ctx, state);
        *state = OutputState::default();
        result
    }

    fn finish(&self, ctx: &ActorContext<'_>, state: &mut OutputState) -> Result<()> {
        let run = ctx.run;
        let cut_off = run.end_of_input_at();
        let (mut visible, dropped): (Vec<_>, Vec<_>) = std::mem::take(&mut state.retained)
            .into_iter()
            .partition(|(iteration, _)| cut_off.map_or(true, |at| *iteration < at));
        let newest = visible.pop();
        for (iteration, values) in dropped.iter().chain(visible.iter()) {
            debug!(iteration, "result set superseded");
            release_all(values)?;
        }
        run.record_result_sets(state.complete_sets - dropped.len() as u64);

        let tensors = match newest {
            Some((_, values)) => values,
            None if self.positions() == 0 => Vec::new(),
            None => {
                let err = match run.end_of_input_source() {
                    Some(source) => EngineError::EndOfInput {
                        actor: source.to_string(),
                    },
                    None => EngineError::protocol(
                        ctx.base.id.as_str(),
                        "run finished without a complete result set",
                    ),
                };
                run.fail(err);
                return Ok(());
            }
        };

        let synced = ctx.base.device_contexts.iter().try_for_each(|device| {
            device
                .synchronize_stream()
                .map_err(|f| EngineError::DeviceSync {
                    device: device.key().to_string(),
                    op: "synchronize_stream".to_string(),
                    message: f.message,
                })
        });
        let outputs = synced.and_then(|_| tensors.iter().map(|t| t.to_host()).collect::<Result<Vec<_>>>());
        release_all(&tensors)?;
        let outputs = outputs?;

        info!(
            run = %run.id(),
            steps = run.steps(),
            outputs = outputs.len(),
            end_of_input = run.end_of_input(),
            "run finished"
        );
        run.complete(RunOutput {
            outputs,
            steps: run.steps(),
            end_of_input: run.end_of_input(),
            profile: run.profile(),
        });
        Ok(())
    }
}
