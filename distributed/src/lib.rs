pub mod error;
pub mod group;
pub mod partition;
pub mod strategy;
pub mod topology;

pub use comms::specs::collective::ReduceOp;
pub use error::{DistErr, Result};
pub use group::CommunicationGroup;
pub use partition::{ShardPlan, shard_range};
pub use strategy::{DataParallel, Replicated, Sharded, Strategy};
pub use topology::{LaunchEnv, Topology, resolve};
