//! Arrows: the static edges between actors.
//!
//! Arrows are built once by the compiler and never change while a run is
//! alive. They address actors by [`ActorId`].

use std::fmt;

use crate::types::ActorId;

/// Carries a tensor from a producer output into a consumer input slot.
///
/// The number of data arrows targeting one `(to_actor_id, to_input_index)`
/// is the number of deliveries that slot waits for per iteration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataArrow {
    /// Output index on the producing actor.
    pub from_output_index: usize,
    /// Consuming actor.
    pub to_actor_id: ActorId,
    /// Input slot on the consuming actor.
    pub to_input_index: usize,
}

impl DataArrow {
    /// Create a data arrow.
    pub fn new(from_output_index: usize, to_actor_id: ActorId, to_input_index: usize) -> Self {
        Self {
            from_output_index,
            to_actor_id,
            to_input_index,
        }
    }
}

impl fmt::Display for DataArrow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "from_output_index:{}\tto_actor_name:{}\tto_input_index:{}",
            self.from_output_index, self.to_actor_id, self.to_input_index
        )
    }
}

/// Readiness signal without payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ControlArrow {
    /// Signalled actor.
    pub to_actor_id: ActorId,
}

impl ControlArrow {
    /// Create a control arrow.
    pub fn new(to_actor_id: ActorId) -> Self {
        Self { to_actor_id }
    }
}

/// Carries a tensor into an output position of the output actor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResultArrow {
    /// Output index on the producing actor.
    pub from_output_index: usize,
    /// Output actor.
    pub to_actor_id: ActorId,
    /// Position in the user-visible result list.
    pub position: usize,
}

impl ResultArrow {
    /// Create a result arrow.
    pub fn new(from_output_index: usize, to_actor_id: ActorId, position: usize) -> Self {
        Self {
            from_output_index,
            to_actor_id,
            position,
        }
    }
}

/// Reverse-index entry: a data arrow seen from its consumer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InputDataArrow {
    /// Producing actor.
    pub from_actor_id: ActorId,
    /// Output index on the producer.
    pub from_output_index: usize,
    /// Input slot on this actor.
    pub to_input_index: usize,
}
