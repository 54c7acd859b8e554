use std::{error::Error, fmt, io};

use distributed::DistErr;
use machine_learning::MlErr;

/// The worker module's result type.
pub type Result<T> = std::result::Result<T, WorkerErr>;

/// Worker runtime failures.
#[derive(Debug)]
pub enum WorkerErr {
    Dist(DistErr),
    Ml(MlErr),
    Io(io::Error),
    InvalidConfig { reason: String },
    /// The local loader ran out of batches. The only recoverable kind, the driver answers it by
    /// moving on to the next epoch.
    EndOfEpoch,
    Interrupted,
}

impl WorkerErr {
    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns the name of the check that failed, as shown in the fatal exit message.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerErr::Dist(e) => e.kind(),
            WorkerErr::Ml(_) => "ModelError",
            WorkerErr::Io(_) => "IoError",
            WorkerErr::InvalidConfig { .. } => "InvalidConfig",
            WorkerErr::EndOfEpoch => "EndOfEpoch",
            WorkerErr::Interrupted => "Interrupted",
        }
    }
}

impl fmt::Display for WorkerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerErr::Dist(e) => write!(f, "{e}"),
            WorkerErr::Ml(e) => write!(f, "model error: {e}"),
            WorkerErr::Io(e) => write!(f, "io error: {e}"),
            WorkerErr::InvalidConfig { reason } => write!(f, "invalid configuration: {reason}"),
            WorkerErr::EndOfEpoch => write!(f, "end of epoch"),
            WorkerErr::Interrupted => write!(f, "interrupted by a signal"),
        }
    }
}

impl Error for WorkerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WorkerErr::Dist(e) => Some(e),
            WorkerErr::Ml(e) => Some(e),
            WorkerErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DistErr> for WorkerErr {
    fn from(value: DistErr) -> Self {
        Self::Dist(value)
    }
}

impl From<MlErr> for WorkerErr {
    fn from(value: MlErr) -> Self {
        Self::Ml(value)
    }
}

impl From<io::Error> for WorkerErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}
