//! Messages exchanged between actors.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::device::DeviceTensor;
use crate::run::RunContext;
use crate::types::ActorId;

/// Value carried by a data or result delivery.
#[derive(Debug, Clone)]
pub enum Payload {
    /// A live tensor.
    Tensor(Arc<DeviceTensor>),
    /// The producer did not run this iteration (untaken branch or end of input).
    Skipped,
}

impl Payload {
    /// Check for a skip marker.
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }
}

/// Protocol message of one run.
#[derive(Debug, Clone)]
pub enum ActorMessage {
    /// Kick off iteration 0. Sent to the data prepare actor only.
    Start,
    /// Data arrow delivery.
    Data {
        /// Iteration the value belongs to.
        iteration: u64,
        /// Producer.
        from: ActorId,
        /// Input slot on the receiver.
        input_index: usize,
        /// Value.
        payload: Payload,
    },
    /// Control arrow delivery.
    Control {
        /// Iteration the signal belongs to.
        iteration: u64,
        /// Sender.
        from: ActorId,
        /// The sender did not run this iteration.
        skipped: bool,
    },
    /// Result arrow delivery to the output actor.
    Result {
        /// Iteration the value belongs to.
        iteration: u64,
        /// Producer.
        from: ActorId,
        /// Output position.
        position: usize,
        /// Value.
        payload: Payload,
    },
}

impl ActorMessage {
    /// Iteration the message belongs to.
    pub fn iteration(&self) -> u64 {
        match self {
            Self::Start => 0,
            Self::Data { iteration, .. }
            | Self::Control { iteration, .. }
            | Self::Result { iteration, .. } => *iteration,
        }
    }

    /// Short message kind for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Data { .. } => "data",
            Self::Control { .. } => "control",
            Self::Result { .. } => "result",
        }
    }
}

/// Item in an actor mailbox.
#[derive(Debug)]
pub enum Envelope {
    /// Protocol message of a run.
    Run {
        /// Run the message belongs to.
        run: Arc<RunContext>,
        /// Message.
        message: ActorMessage,
    },
    /// Drop all per-iteration state, then acknowledge.
    Reset(oneshot::Sender<()>),
    /// Exit the mailbox loop.
    Stop,
}
