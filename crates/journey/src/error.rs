use thiserror::Error;
use uuid::Uuid;

use crate::types::{JourneyStatus, NodeId, RunStatus};

pub type JourneyResult<T> = Result<T, JourneyError>;

#[derive(Error, Debug)]
pub enum JourneyError {
    #[error("Journey {0} not found")]
    JourneyNotFound(Uuid),

    #[error("Journey {0} already exists")]
    JourneyExists(Uuid),

    #[error("Run {0} not found")]
    RunNotFound(Uuid),

    #[error("Node {node_id} not found in journey {journey_id}")]
    NodeNotFound { journey_id: Uuid, node_id: NodeId },

    #[error("Invalid journey graph: {0}")]
    Validation(#[from] ValidationError),

    #[error("Journey {id} is {status:?}; deactivate it before editing")]
    NotEditable { id: Uuid, status: JourneyStatus },

    #[error("Journey {id} cannot move from {from:?} to {to:?}")]
    InvalidJourneyTransition {
        id: Uuid,
        from: JourneyStatus,
        to: JourneyStatus,
    },

    #[error("Run {id} cannot move from {from:?} to {to:?}")]
    InvalidRunTransition {
        id: Uuid,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("Run {id} changed concurrently (expected version {expected}, found {found})")]
    ConcurrencyConflict { id: Uuid, expected: u64, found: u64 },

    #[error("Collaborator failure: {0}")]
    Collaborator(#[from] CollaboratorError),
}

/// Graph invariants checked before a journey may go live.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("journey has no entry node")]
    MissingEntry,

    #[error("journey has {0} entry nodes, expected exactly one")]
    MultipleEntries(usize),

    #[error("node id {0} is used more than once")]
    DuplicateNodeId(NodeId),

    #[error("edge {from} -> {to} references an unknown node")]
    DanglingEdge { from: NodeId, to: NodeId },

    #[error("entry node must have exactly one outgoing edge, found {0}")]
    EntryOutgoing(usize),

    #[error("edge {from} -> {to} points back at the entry node")]
    EdgeIntoEntry { from: NodeId, to: NodeId },

    #[error("condition node {0} needs exactly one true and one false edge")]
    ConditionBranches(NodeId),

    #[error("message node {node_id} has {count} outgoing edges, at most one allowed")]
    MessageFanOut { node_id: NodeId, count: usize },

    #[error("edge {from} -> {to} carries a branch label but {from} is not a condition")]
    UnexpectedBranchLabel { from: NodeId, to: NodeId },

    #[error("journey reference node {0} must not have outgoing edges")]
    OutgoingFromJourneyRef(NodeId),

    #[error("journey reference node {0} points at its own journey")]
    SelfReference(NodeId),

    #[error("journey reference node {node_id} targets unknown journey {target}")]
    UnknownJourneyRef { node_id: NodeId, target: Uuid },

    #[error("node {0} is not reachable from the entry node")]
    Unreachable(NodeId),

    #[error("node {0} sits on a cycle with no delay")]
    ZeroDelayCycle(NodeId),

    #[error("delay of {secs}s on {location} exceeds the {max}s limit")]
    DelayOutOfRange {
        location: String,
        secs: u64,
        max: u64,
    },
}

/// Error returned by a channel sender.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Transient failure; the node is retried after a backoff.
    #[error("channel unavailable: {0}")]
    Unavailable(String),

    /// Permanent rejection; retrying cannot succeed.
    #[error("message rejected: {0}")]
    Rejected(String),
}

impl DispatchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Unavailable(_))
    }
}

/// Failure reported by the donation repository or contact directory.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CollaboratorError(pub String);
