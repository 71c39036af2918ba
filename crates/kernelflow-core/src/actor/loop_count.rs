//! Loop count actor: closes each iteration and decides whether to go on.

use std::collections::HashMap;

use tracing::debug;

use super::base::ActorContext;
use crate::error::{EngineError, Result};
use crate::message::ActorMessage;
use crate::run::RunPhase;
use crate::types::ActorId;

/// Collects one control signal per sink and restarts or finishes the loop.
///
/// Skipped sinks count as completed: a dead path still ends the iteration.
#[derive(Debug)]
pub struct LoopCountActor {
    /// Actor that opens the next iteration.
    pub data_prepare: ActorId,
    /// Actor that assembles the final result.
    pub output: ActorId,
}

impl LoopCountActor {
    pub(crate) fn on_message(
        &self,
        ctx: &ActorContext<'_>,
        counts: &mut HashMap<u64, usize>,
        message: ActorMessage,
    ) -> Result<()> {
        let iteration = match &message {
            ActorMessage::Control { iteration, .. } => *iteration,
            other => {
                return Err(EngineError::protocol(
                    ctx.base.id.as_str(),
                    format!("unexpected {} message", other.kind()),
                ))
            }
        };
        let expected = ctx.base.input_control_arrows.len();
        let count = counts.entry(iteration).or_insert(0);
        if *count >= expected {
            return Err(EngineError::DuplicateDelivery {
                actor: ctx.base.id.to_string(),
                input: "control".to_string(),
                iteration,
            });
        }
        *count += 1;
        if *count < expected {
            return Ok(());
        }
        counts.remove(&iteration);
        self.iteration_done(ctx, iteration)
    }

    fn iteration_done(&self, ctx: &ActorContext<'_>, iteration: u64) -> Result<()> {
        let run = ctx.run;
        run.prune_live();
        let end_of_input = run.end_of_input();
        let steps = if end_of_input { iteration } else { iteration + 1 };
        run.set_steps(steps);

        if !end_of_input && steps < run.loop_count() {
            debug!(run = %run.id(), iteration, "iteration done, looping");
            ctx.send(
                &self.data_prepare,
                ActorMessage::Control {
                    iteration: iteration + 1,
                    from: ctx.base.id.clone(),
                    skipped: false,
                },
            )
        } else {
            debug!(run = %run.id(), iteration, steps, end_of_input, "loop finished");
            run.set_phase(RunPhase::Draining);
            ctx.send(
                &self.output,
                ActorMessage::Control {
                    iteration,
                    from: ctx.base.id.clone(),
                    skipped: false,
                },
            )
        }
    }
}
