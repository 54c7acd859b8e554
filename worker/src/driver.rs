use distributed::{CommunicationGroup, DataParallel, ReduceOp};
use log::{debug, error, info};
use machine_learning::loss::{LossFn, Reduction};

use crate::{
    data::{Batch, DataLoader},
    error::{Result, WorkerErr},
};

/// The phases a training run goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Initializing,
    Stepping,
    Reporting,
    ShuttingDown,
}

/// The group wide loss of the steps since the previous report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossReport {
    pub epoch: usize,
    /// The step count at the time of the report.
    pub step: usize,
    /// The sum of every worker's local loss.
    pub global_loss: f32,
    /// The amount of samples the loss covers, across the group.
    pub samples: usize,
}

/// The group wide loss over the validation split at the end of an epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationReport {
    pub epoch: usize,
    /// The sum of every worker's local validation loss.
    pub loss: f32,
    pub samples: usize,
}

/// Sample counts travel through an f32 all reduce, which counts exactly up to 2^24.
pub const MAX_EXACT_COUNT: usize = 1 << 24;

/// What a completed run leaves behind.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    pub steps: usize,
    pub epochs: usize,
    pub reports: Vec<LossReport>,
    /// One entry per epoch, empty when the run had no validation split.
    pub validation: Vec<ValidationReport>,
    /// The full, final parameter set.
    pub parameters: Vec<f32>,
}

/// Runs the epochs and steps of a data parallel training run.
///
/// Every step draws this worker's share of a global batch, runs the forward pass, the loss, the
/// backward pass (which synchronizes the gradient across the group) and the optimizer step.
/// Every `report_every` steps the local losses are summed across the group into one report, and
/// at the end of every epoch the validation split, if any, is evaluated the same way.
pub struct Driver<S, L> {
    strategy: S,
    loss: L,
    loader: DataLoader,
    validation: Option<DataLoader>,
    epochs: usize,
    report_every: usize,
    state: DriverState,
    steps: usize,
    loss_acc: f32,
    samples_acc: usize,
    reports: Vec<LossReport>,
    validations: Vec<ValidationReport>,
}

impl<S, L> Driver<S, L>
where
    S: DataParallel,
    L: LossFn + Send,
{
    /// Creates a new `Driver`.
    ///
    /// # Arguments
    /// * `strategy` - The data parallel strategy holding the model and optimizer.
    /// * `loss` - The loss function, it has to sum over the samples.
    /// * `loader` - This worker's data loader.
    /// * `epochs` - The amount of passes over the dataset.
    /// * `report_every` - The amount of steps between two global loss reports.
    ///
    /// # Errors
    /// `InvalidConfig` if the loss averages over the batch, `report_every` is zero or a report
    /// would count more samples than `MAX_EXACT_COUNT`.
    pub fn new(
        strategy: S,
        loss: L,
        loader: DataLoader,
        epochs: usize,
        report_every: usize,
    ) -> Result<Self> {
        // Local batches differ in size, only sums add up across workers.
        if loss.reduction() != Reduction::Sum {
            return Err(WorkerErr::invalid_config(
                "the loss must sum over the batch, mean reduction isn't supported",
            ));
        }

        if report_every == 0 {
            return Err(WorkerErr::invalid_config("the report interval must be positive"));
        }

        let per_report = report_every.checked_mul(loader.global_batch());
        if per_report.is_none_or(|n| n > MAX_EXACT_COUNT) {
            return Err(WorkerErr::invalid_config(format!(
                "a report of {report_every} steps of {} samples counts past {MAX_EXACT_COUNT}",
                loader.global_batch()
            )));
        }

        Ok(Self {
            strategy,
            loss,
            loader,
            validation: None,
            epochs,
            report_every,
            state: DriverState::Initializing,
            steps: 0,
            loss_acc: 0.,
            samples_acc: 0,
            reports: Vec::new(),
            validations: Vec::new(),
        })
    }

    /// Evaluates `loader`'s samples at the end of every epoch.
    ///
    /// # Errors
    /// `InvalidConfig` if the split holds more samples than `MAX_EXACT_COUNT`.
    pub fn with_validation(mut self, loader: DataLoader) -> Result<Self> {
        let len = loader.dataset().len();
        if len > MAX_EXACT_COUNT {
            return Err(WorkerErr::invalid_config(format!(
                "a validation split of {len} samples counts past {MAX_EXACT_COUNT}"
            )));
        }

        self.validation = Some(loader);
        Ok(self)
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Trains for every configured epoch.
    ///
    /// On a fatal error the rest of the group is told through `abort` before the error is
    /// returned, so no peer is left waiting on a collective this worker will never join.
    ///
    /// # Arguments
    /// * `group` - This worker's group handle.
    ///
    /// # Returns
    /// The run's summary, identical on every worker.
    pub async fn run(mut self, group: &mut CommunicationGroup) -> Result<TrainingSummary> {
        match self.train(group).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                error!(rank = group.rank(), step = self.steps; "training failed: {e}");
                self.transition(group.rank(), DriverState::ShuttingDown);
                group.abort(&format!("[{}] {e}", e.kind())).await;
                Err(e)
            }
        }
    }

    async fn train(&mut self, group: &mut CommunicationGroup) -> Result<TrainingSummary> {
        let rank = group.rank();
        info!(
            rank = rank,
            epochs = self.epochs,
            steps_per_epoch = self.loader.steps_per_epoch();
            "starting training"
        );

        self.transition(rank, DriverState::Stepping);

        for epoch in 0..self.epochs {
            self.loader.reset(epoch);

            loop {
                let batch = match self.loader.next_batch() {
                    Ok(batch) => batch,
                    Err(WorkerErr::EndOfEpoch) => break,
                    Err(e) => return Err(e),
                };

                self.train_step(group, &batch).await?;

                if self.steps % self.report_every == 0 {
                    self.report(group, epoch).await?;
                }
            }

            debug!(rank = rank, epoch = epoch, steps = self.steps; "epoch done");
            self.validate(group, epoch).await?;
        }

        if self.steps % self.report_every != 0 {
            self.report(group, self.epochs.saturating_sub(1)).await?;
        }

        self.transition(rank, DriverState::ShuttingDown);

        let parameters = self.strategy.full_parameters(group).await?;
        group.barrier().await?;

        info!(rank = rank, steps = self.steps; "training done");

        Ok(TrainingSummary {
            steps: self.steps,
            epochs: self.epochs,
            reports: std::mem::take(&mut self.reports),
            validation: std::mem::take(&mut self.validations),
            parameters,
        })
    }

    async fn train_step(&mut self, group: &mut CommunicationGroup, batch: &Batch) -> Result<()> {
        let y_pred = self.strategy.forward(group, batch.x.view()).await?;
        let loss = self.loss.loss(y_pred.view(), batch.y.view())?;
        let d = self.loss.loss_prime(y_pred.view(), batch.y.view())?;

        self.strategy.backward(group, d.view()).await?;
        self.strategy.step()?;
        self.strategy.zero_grad();

        self.loss_acc += loss;
        self.samples_acc += batch.len();
        self.steps += 1;
        Ok(())
    }

    /// Sums the accumulated loss and sample count across the group.
    async fn report(&mut self, group: &mut CommunicationGroup, epoch: usize) -> Result<()> {
        let rank = group.rank();
        self.transition(rank, DriverState::Reporting);

        let mut totals = [self.loss_acc, self.samples_acc as f32];
        group.all_reduce(&mut totals, ReduceOp::Sum).await?;

        let [global_loss, samples] = totals;
        let report = LossReport {
            epoch,
            step: self.steps,
            global_loss,
            samples: samples as usize,
        };

        if rank == 0 {
            info!(epoch = epoch, step = self.steps, samples = report.samples; "global loss {global_loss:.6}");
        }

        self.reports.push(report);
        self.loss_acc = 0.;
        self.samples_acc = 0;

        self.transition(rank, DriverState::Stepping);
        Ok(())
    }

    /// Runs the validation split through the model and sums its loss across the group.
    ///
    /// Every worker evaluates its share of every validation batch, then a single all reduce
    /// combines the losses and sample counts.
    async fn validate(&mut self, group: &mut CommunicationGroup, epoch: usize) -> Result<()> {
        let Some(loader) = self.validation.as_mut() else {
            return Ok(());
        };

        loader.reset(0);
        let mut loss = 0.;
        let mut samples = 0;

        loop {
            let batch = match loader.next_batch() {
                Ok(batch) => batch,
                Err(WorkerErr::EndOfEpoch) => break,
                Err(e) => return Err(e),
            };

            let y_pred = self.strategy.evaluate(group, batch.x.view()).await?;
            loss += self.loss.loss(y_pred.view(), batch.y.view())?;
            samples += batch.len();
        }

        let mut totals = [loss, samples as f32];
        group.all_reduce(&mut totals, ReduceOp::Sum).await?;

        let [loss, samples] = totals;
        let report = ValidationReport {
            epoch,
            loss,
            samples: samples as usize,
        };

        if group.rank() == 0 {
            info!(epoch = epoch, samples = report.samples; "validation loss {loss:.6}");
        }

        self.validations.push(report);
        Ok(())
    }

    fn transition(&mut self, rank: usize, to: DriverState) {
        if self.state != to {
            debug!(rank = rank; "{:?} -> {:?}", self.state, to);
            self.state = to;
        }
    }
}
