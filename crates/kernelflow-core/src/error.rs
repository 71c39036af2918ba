//! Error types for the actor runtime.
//!
//! Every failure that can end a run is an [`EngineError`]. Device contexts
//! report the narrower [`OutOfMemory`] and [`DeviceFault`] errors, which the
//! engine lifts into `EngineError` once it knows which actor was involved.

use std::time::Duration;

use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors produced while compiling or running an actor graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Unexpected delivery or malformed topology detected at runtime.
    #[error("Protocol violation at actor '{actor}': {message}")]
    Protocol {
        /// Actor that detected the violation.
        actor: String,
        /// Description of the violation.
        message: String,
    },

    /// More deliveries reached an input than it has declared producers.
    #[error("Duplicate delivery to actor '{actor}' on {input} in iteration {iteration}")]
    DuplicateDelivery {
        /// Receiving actor.
        actor: String,
        /// Input that was over-delivered (`input 2`, `control`, ...).
        input: String,
        /// Iteration of the offending delivery.
        iteration: u64,
    },

    /// A kernel's launch reported failure.
    #[error("Kernel '{kernel_name}' failed to launch in actor '{actor_id}'")]
    KernelExecution {
        /// Actor that issued the launch.
        actor_id: String,
        /// Name of the failed kernel.
        kernel_name: String,
    },

    /// Device memory could not be allocated.
    #[error("Failed to allocate {size} bytes on {device} for actor '{actor}'")]
    AllocationFailed {
        /// Actor that requested the memory.
        actor: String,
        /// Device context the request went to.
        device: String,
        /// Requested size in bytes.
        size: usize,
    },

    /// A data source ran out of input. Not fatal to the actor that hit it;
    /// a run fails with it only when no result set completed before.
    #[error("End of input reached by actor '{actor}'")]
    EndOfInput {
        /// Data source actor that found no data.
        actor: String,
    },

    /// Asynchronous device fault observed at a synchronization point.
    #[error("Device synchronization failed on {device} during '{op}': {message}")]
    DeviceSync {
        /// Device context that faulted.
        device: String,
        /// Operation that synchronized.
        op: String,
        /// Fault description reported by the device.
        message: String,
    },

    /// Graph descriptor rejected at compile time.
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    /// Caller-supplied run inputs do not match the graph.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation not allowed in the current engine state.
    #[error("Invalid state: expected {expected}, actual {actual}")]
    InvalidState {
        /// Expected state.
        expected: String,
        /// Actual state.
        actual: String,
    },

    /// Data queue has no batch available.
    #[error("Queue is empty")]
    QueueEmpty,

    /// Data queue is full.
    #[error("Queue is full (capacity: {capacity})")]
    QueueFull {
        /// Queue capacity.
        capacity: usize,
    },

    /// The run was stopped by the caller.
    #[error("Run aborted")]
    Aborted,

    /// The run did not complete in time.
    #[error("Run timed out after {0:?}")]
    Timeout(Duration),

    /// File system error (diagnostics dump).
    #[error("IO error: {0}")]
    Io(String),

    /// Internal engine error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Create a protocol error.
    pub fn protocol(actor: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            actor: actor.into(),
            message: message.into(),
        }
    }

    /// Create an invalid graph error.
    pub fn invalid_graph(msg: impl Into<String>) -> Self {
        Self::InvalidGraph(msg.into())
    }

    /// Create an invalid input error.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether the error aborts the run it occurred in.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::EndOfInput { .. } | Self::QueueEmpty)
    }

    /// Whether the error is a protocol violation (including duplicate delivery).
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol { .. } | Self::DuplicateDelivery { .. })
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Allocation request a device context could not satisfy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("out of device memory: requested {requested} bytes, {available} available")]
pub struct OutOfMemory {
    /// Requested size in bytes.
    pub requested: usize,
    /// Bytes still available on the device.
    pub available: usize,
}

/// Fault reported by a device context for a copy or synchronization.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct DeviceFault {
    /// Fault description.
    pub message: String,
}

impl DeviceFault {
    /// Create a device fault.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
