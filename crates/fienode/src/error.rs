//! Error types for fienode.

use std::fmt;

use fie_network::AllocationError;
use thiserror::Error;

use crate::workload::WorkloadState;

/// What kind of object a lookup missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// An emulated node.
    Node,
    /// A workload container.
    Container,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node => write!(f, "node"),
            Self::Container => write!(f, "container"),
        }
    }
}

/// Errors that can occur in node and orchestrator operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// No address block left for a new node.
    #[error("address pool exhausted ({capacity} blocks)")]
    AllocationExhausted {
        /// Size of the exhausted pool.
        capacity: usize,
    },

    /// A fabric, accounting-group or lifecycle step failed while building
    /// a node or a workload.
    #[error("construction of {node} failed at {step}: {reason}")]
    ConstructionFailure {
        /// Node being constructed.
        node: String,
        /// Step that failed.
        step: String,
        /// Underlying reason.
        reason: String,
    },

    /// Name lookup miss.
    #[error("{kind} not found: {name}")]
    NotFound {
        /// Node or container.
        kind: ObjectKind,
        /// The missing name.
        name: String,
    },

    /// The container runtime rejected or failed a call.
    #[error("runtime call {operation} failed: {reason}")]
    RuntimeCallFailure {
        /// Runtime operation.
        operation: String,
        /// Underlying reason.
        reason: String,
    },

    /// A workload lifecycle transition that the state machine forbids.
    #[error("container {name} cannot go from {from} to {to}")]
    InvalidTransition {
        /// Container name.
        name: String,
        /// Current state.
        from: WorkloadState,
        /// Requested state.
        to: WorkloadState,
    },

    /// Workload configuration rejected at the node boundary.
    #[error("invalid workload spec: {0}")]
    InvalidSpec(String),

    /// Topology or pool configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A host or context command could not run or exited non-zero.
    #[error("command `{program}` failed: {reason}")]
    Command {
        /// Program that was executed.
        program: String,
        /// Exit status and stderr, or the spawn error.
        reason: String,
    },

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl NodeError {
    /// Shorthand for a node lookup miss.
    pub fn node_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: ObjectKind::Node,
            name: name.into(),
        }
    }

    /// Shorthand for a container lookup miss.
    pub fn container_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: ObjectKind::Container,
            name: name.into(),
        }
    }

    /// Shorthand for a construction failure.
    pub fn construction(
        node: impl Into<String>,
        step: impl fmt::Display,
        reason: impl fmt::Display,
    ) -> Self {
        Self::ConstructionFailure {
            node: node.into(),
            step: step.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for a runtime call failure.
    pub fn runtime(operation: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::RuntimeCallFailure {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the caller can carry on as if the operation was a no-op.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::InvalidSpec(_) | Self::InvalidTransition { .. }
        )
    }

    /// Whether this is a lookup miss.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<AllocationError> for NodeError {
    fn from(err: AllocationError) -> Self {
        match err {
            AllocationError::Exhausted { capacity } => Self::AllocationExhausted { capacity },
            other => Self::Config(other.to_string()),
        }
    }
}
