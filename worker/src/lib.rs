pub mod builder;
pub mod config;
pub mod data;
pub mod driver;
pub mod error;

pub use builder::{DriverBuilder, train};
pub use config::{Method, RunConfig};
pub use driver::{Driver, DriverState, LossReport, TrainingSummary, ValidationReport};
pub use error::{Result, WorkerErr};
