use serde::{Deserialize, Serialize};

/// The element-wise reduction applied by reducing collectives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceOp {
    Sum,
    Average,
}

/// The kind of collective a worker is taking part in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectiveOp {
    AllReduce { op: ReduceOp },
    Broadcast { root: usize },
    AllGather,
    ReduceScatter { op: ReduceOp },
    Barrier,
}

impl CollectiveOp {
    /// Whether every participant must contribute a tensor of the same length.
    pub fn requires_equal_len(&self) -> bool {
        !matches!(self, CollectiveOp::AllGather)
    }
}

/// Announces a worker's contribution to a collective, the tensor follows as a
/// separate data message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectiveHeader {
    /// Position of this collective in the worker's sequence of collectives.
    pub seq: u64,
    pub op: CollectiveOp,
    /// Logical length of the tensor taking part in the collective.
    pub len: usize,
}

/// A collective failure detected by the hub and fanned out to every leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Failure {
    ShapeMismatch {
        seq: u64,
        rank: usize,
        got: usize,
        expected: usize,
    },
    CollectiveMismatch {
        rank: usize,
        got: Option<CollectiveHeader>,
        expected: CollectiveHeader,
    },
    Timeout {
        seq: u64,
        waited_ms: u64,
    },
}
