use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::{
    driver::MAX_EXACT_COUNT,
    error::{Result, WorkerErr},
};

/// How the model's parameters are kept consistent across the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Method {
    /// Every worker holds every parameter, gradients are averaged each step.
    #[value(alias = "ddp")]
    Replicated,
    /// Every worker holds a shard of every parameter group and its optimizer state.
    #[value(alias = "fsdp")]
    Sharded,
}

/// The run configuration of a worker, the same on every worker of the group.
///
/// The worker's identity doesn't live here, it comes from the launch environment.
#[derive(Debug, Clone, Parser)]
#[command(name = "worker")]
#[command(about = "Data parallel training worker", long_about = None)]
#[command(version)]
pub struct RunConfig {
    /// The data parallel strategy
    #[arg(short, long, value_enum, default_value_t = Method::Replicated)]
    pub method: Method,

    /// Amount of passes over the dataset
    #[arg(short, long, default_value_t = 10)]
    pub epochs: usize,

    /// Global batch size, split among the workers every step
    #[arg(short, long, default_value_t = 256)]
    pub batch_size: usize,

    /// Steps between two global loss reports
    #[arg(short, long = "print-every", default_value_t = 32)]
    pub print_every: usize,

    /// The optimizer's learning rate
    #[arg(long, default_value_t = 0.001)]
    pub lr: f32,

    /// Bound on the rendezvous and on every collective, in seconds
    #[arg(long = "timeout-secs", default_value_t = 30)]
    pub timeout_secs: u64,

    /// Seed for the dataset, the initial parameters and the shuffling
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Amount of training samples of the synthetic dataset
    #[arg(long, default_value_t = 8192)]
    pub samples: usize,

    /// Amount of samples held out for validation at the end of every epoch, 0 skips validation
    #[arg(long = "val-samples", default_value_t = 1024)]
    pub val_samples: usize,

    /// Reshuffle the dataset every epoch
    #[arg(long)]
    pub shuffle: bool,
}

impl RunConfig {
    /// Checks the values clap can't check on its own.
    ///
    /// # Errors
    /// `InvalidConfig` naming the first offending option.
    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("--epochs", self.epochs),
            ("--batch-size", self.batch_size),
            ("--print-every", self.print_every),
            ("--samples", self.samples),
        ]
        .into_iter()
        .find(|(_, value)| *value == 0);

        if let Some((name, _)) = zero {
            return Err(WorkerErr::invalid_config(format!("{name} must be positive")));
        }

        let per_report = self.print_every.checked_mul(self.batch_size);
        if per_report.is_none_or(|n| n > MAX_EXACT_COUNT) {
            return Err(WorkerErr::invalid_config(format!(
                "--print-every times --batch-size must not exceed {MAX_EXACT_COUNT}"
            )));
        }

        if self.val_samples > MAX_EXACT_COUNT {
            return Err(WorkerErr::invalid_config(format!(
                "--val-samples must not exceed {MAX_EXACT_COUNT}"
            )));
        }

        if self.timeout_secs == 0 {
            return Err(WorkerErr::invalid_config("--timeout-secs must be positive"));
        }

        if !self.lr.is_finite() || self.lr <= 0. {
            return Err(WorkerErr::invalid_config(format!(
                "--lr must be a positive number, got {}",
                self.lr
            )));
        }

        Ok(())
    }

    /// Returns the bound on the rendezvous and on every collective.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunConfig::try_parse_from(["worker"]).unwrap();

        assert_eq!(config.method, Method::Replicated);
        assert_eq!(config.batch_size, 256);
        assert_eq!(config.timeout(), Duration::from_secs(30));
        config.validate().unwrap();
    }

    #[test]
    fn test_method_aliases() {
        let config = RunConfig::try_parse_from(["worker", "--method", "fsdp"]).unwrap();
        assert_eq!(config.method, Method::Sharded);

        let config = RunConfig::try_parse_from(["worker", "-m", "ddp"]).unwrap();
        assert_eq!(config.method, Method::Replicated);

        assert!(RunConfig::try_parse_from(["worker", "--method", "pipeline"]).is_err());
    }

    #[test]
    fn test_zero_values_are_rejected() {
        let config = RunConfig::try_parse_from(["worker", "--print-every", "0"]).unwrap();
        let err = config.validate().unwrap_err();

        assert_eq!(err.kind(), "InvalidConfig");
        assert!(err.to_string().contains("--print-every"));

        let config = RunConfig::try_parse_from(["worker", "--lr=-1"]).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sample_counts_stay_exact() {
        let config =
            RunConfig::try_parse_from(["worker", "--print-every", "65536", "-b", "256"]).unwrap();
        config.validate().unwrap();

        let config =
            RunConfig::try_parse_from(["worker", "--print-every", "100000", "-b", "256"]).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("--print-every"), "{err}");

        let overflow = format!("{}", usize::MAX / 2);
        let config =
            RunConfig::try_parse_from(["worker", "--print-every", overflow.as_str(), "-b", "4"])
                .unwrap();
        assert!(config.validate().is_err());

        let config =
            RunConfig::try_parse_from(["worker", "--val-samples", "20000000"]).unwrap();
        assert!(config.validate().is_err());
    }
}
