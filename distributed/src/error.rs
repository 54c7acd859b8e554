use std::{error::Error, fmt, io, time::Duration};

use comms::specs::collective::{CollectiveHeader, Failure};
use machine_learning::MlErr;

/// The distributed module's result type.
pub type Result<T> = std::result::Result<T, DistErr>;

/// Failures of the coordination layer.
///
/// Every variant is fatal for the whole group, a worker that hits one aborts the group instead of
/// continuing in a desynchronized state.
#[derive(Debug)]
pub enum DistErr {
    /// Missing or inconsistent launch identity.
    Topology { reason: String },
    /// The rendezvous or a collective didn't complete within the group timeout.
    RendezvousTimeout { seq: Option<u64>, waited: Duration },
    /// The hub refused this worker during the rendezvous.
    RendezvousRejected { reason: String },
    /// A collective received tensors of different lengths.
    ShapeMismatch {
        seq: u64,
        rank: usize,
        got: usize,
        expected: usize,
    },
    /// Workers issued different collectives at the same point of their sequence.
    CollectiveMismatch {
        rank: usize,
        got: Option<CollectiveHeader>,
        expected: CollectiveHeader,
    },
    /// A peer sent a message that doesn't fit the protocol's current phase.
    UnexpectedMessage {
        rank: usize,
        got: &'static str,
        expected: &'static str,
    },
    /// The shard union doesn't equal the full parameter set, or the plans differ across workers.
    PartitionInvariant { reason: String },
    /// Another worker hit a fatal error or vanished.
    PeerAborted { rank: usize, reason: String },
    InvalidConfig { reason: String },
    Io(io::Error),
    Ml(MlErr),
}

impl DistErr {
    /// Returns the stable name of the check that failed.
    pub fn kind(&self) -> &'static str {
        match self {
            DistErr::Topology { .. } => "TopologyError",
            DistErr::RendezvousTimeout { .. } => "RendezvousTimeout",
            DistErr::RendezvousRejected { .. } => "RendezvousRejected",
            DistErr::ShapeMismatch { .. } => "ShapeMismatchError",
            DistErr::CollectiveMismatch { .. } => "CollectiveMismatch",
            DistErr::UnexpectedMessage { .. } => "UnexpectedMessage",
            DistErr::PartitionInvariant { .. } => "PartitionInvariantError",
            DistErr::PeerAborted { .. } => "PeerAborted",
            DistErr::InvalidConfig { .. } => "InvalidConfig",
            DistErr::Io(_) => "IoError",
            DistErr::Ml(_) => "ModelError",
        }
    }

    pub(crate) fn topology(reason: impl Into<String>) -> Self {
        Self::Topology {
            reason: reason.into(),
        }
    }

    pub(crate) fn partition(reason: impl Into<String>) -> Self {
        Self::PartitionInvariant {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for DistErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistErr::Topology { reason } => write!(f, "invalid launch topology: {reason}"),
            DistErr::RendezvousTimeout {
                seq: Some(seq),
                waited,
            } => write!(f, "collective #{seq} did not complete within {waited:?}"),
            DistErr::RendezvousTimeout { seq: None, waited } => {
                write!(f, "rendezvous did not complete within {waited:?}")
            }
            DistErr::RendezvousRejected { reason } => write!(f, "rendezvous rejected: {reason}"),
            DistErr::ShapeMismatch {
                seq,
                rank,
                got,
                expected,
            } => write!(
                f,
                "collective #{seq}: rank {rank} contributed {got} values, expected {expected}"
            ),
            DistErr::CollectiveMismatch {
                rank,
                got: Some(got),
                expected,
            } => write!(
                f,
                "rank {rank} issued {:?} #{} but the group is in {:?} #{}",
                got.op, got.seq, expected.op, expected.seq
            ),
            DistErr::CollectiveMismatch {
                rank,
                got: None,
                expected,
            } => write!(
                f,
                "rank {rank} left the collective sequence while the group is in {:?} #{}",
                expected.op, expected.seq
            ),
            DistErr::UnexpectedMessage {
                rank,
                got,
                expected,
            } => write!(f, "rank {rank} sent {got}, expected {expected}"),
            DistErr::PartitionInvariant { reason } => {
                write!(f, "partition invariant violated: {reason}")
            }
            DistErr::PeerAborted { rank, reason } => write!(f, "rank {rank} aborted: {reason}"),
            DistErr::InvalidConfig { reason } => write!(f, "invalid configuration: {reason}"),
            DistErr::Io(e) => write!(f, "io error: {e}"),
            DistErr::Ml(e) => write!(f, "model error: {e}"),
        }
    }
}

impl Error for DistErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DistErr::Io(e) => Some(e),
            DistErr::Ml(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for DistErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<MlErr> for DistErr {
    fn from(value: MlErr) -> Self {
        Self::Ml(value)
    }
}

impl From<Failure> for DistErr {
    fn from(value: Failure) -> Self {
        match value {
            Failure::ShapeMismatch {
                seq,
                rank,
                got,
                expected,
            } => Self::ShapeMismatch {
                seq,
                rank,
                got,
                expected,
            },
            Failure::CollectiveMismatch {
                rank,
                got,
                expected,
            } => Self::CollectiveMismatch {
                rank,
                got,
                expected,
            },
            Failure::Timeout { seq, waited_ms } => Self::RendezvousTimeout {
                seq: Some(seq),
                waited: Duration::from_millis(waited_ms),
            },
        }
    }
}
