pub mod dataset;
pub mod error;
pub mod loss;
pub mod model;
pub mod optimization;

pub use error::{MlErr, Result};
