mod loader;

pub use loader::{Batch, DataLoader};
