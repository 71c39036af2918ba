//! Data prepare actor: opens each iteration.

use tracing::debug;

use super::base::ActorContext;
use crate::error::{EngineError, Result};
use crate::message::ActorMessage;
use crate::run::RunPhase;

/// Signals every actor that has no data dependency.
///
/// Receives `Start` from the engine for iteration 0 and a control signal
/// from the loop count actor for every following iteration.
#[derive(Debug, Default)]
pub struct DataPrepareActor;

impl DataPrepareActor {
    pub(crate) fn on_message(&self, ctx: &ActorContext<'_>, message: ActorMessage) -> Result<()> {
        match message {
            ActorMessage::Start => {
                ctx.run.set_phase(RunPhase::Preparing);
                self.prepare(ctx)
            }
            ActorMessage::Control { skipped: false, .. } => self.prepare(ctx),
            other => Err(EngineError::protocol(
                ctx.base.id.as_str(),
                format!("unexpected {} message", other.kind()),
            )),
        }
    }

    fn prepare(&self, ctx: &ActorContext<'_>) -> Result<()> {
        debug!(run = %ctx.run.id(), iteration = ctx.iteration, "iteration start");
        ctx.run.record_iteration();
        ctx.run.set_phase(RunPhase::Iterating(ctx.iteration));
        ctx.send_output_controls()
    }
}
