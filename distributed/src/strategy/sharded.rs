use std::ops::Range;

use comms::specs::collective::ReduceOp;
use log::debug;
use machine_learning::{model::Model, optimization::Optimizer};
use ndarray::{Array2, ArrayView2};

use super::{DataParallel, check_init};
use crate::{
    error::{DistErr, Result},
    group::CommunicationGroup,
    partition::ShardPlan,
};

/// Sharding: every worker keeps one shard of every parameter group and an optimizer sized to it.
///
/// The full parameters are gathered before each forward pass and released after the backward
/// pass, the gradient is reduce scattered so each worker only receives the average gradient of
/// what it owns.
pub struct Sharded<M, O> {
    model: M,
    plan: ShardPlan,
    rank: usize,
    /// Where each group's shard lives in `shard`.
    local: Vec<Range<usize>>,
    shard: Vec<f32>,
    shard_grad: Vec<f32>,
    full: Option<Vec<f32>>,
    optimizer: O,
}

impl<M: Model, O: Optimizer> Sharded<M, O> {
    /// Creates a new `Sharded` strategy with the balanced plan for the model's parameter groups.
    ///
    /// # Arguments
    /// * `group` - The worker's group handle.
    /// * `model` - The model to train.
    /// * `init` - This worker's initial parameters, only rank 0's survive.
    /// * `optimizer` - Builds the optimizer for the given amount of parameters.
    ///
    /// # Errors
    /// `PartitionInvariant` if the plan doesn't cover the parameters exactly or differs across
    /// workers, a model error if `init` doesn't fit the model, or any collective failure.
    pub async fn new<F>(
        group: &mut CommunicationGroup,
        model: M,
        init: Vec<f32>,
        optimizer: F,
    ) -> Result<Self>
    where
        F: FnOnce(usize) -> O,
    {
        let plan = ShardPlan::new(&model.param_sizes(), group.world_size())?;
        Self::with_plan(group, model, plan, init, optimizer).await
    }

    /// Creates a new `Sharded` strategy following `plan`.
    ///
    /// The plan is validated before any parameter moves, then compared against every other
    /// worker's plan.
    pub async fn with_plan<F>(
        group: &mut CommunicationGroup,
        model: M,
        plan: ShardPlan,
        mut init: Vec<f32>,
        optimizer: F,
    ) -> Result<Self>
    where
        F: FnOnce(usize) -> O,
    {
        let rank = group.rank();

        check_init(&model, &init)?;

        if plan.world_size() != group.world_size() || plan.total() != model.size() {
            return Err(DistErr::partition(format!(
                "plan for {} parameters among {} workers, the model has {} and the group {}",
                plan.total(),
                plan.world_size(),
                model.size(),
                group.world_size()
            )));
        }

        plan.validate()?;
        check_agreement(group, &plan).await?;

        group.broadcast(&mut init, 0).await?;
        let shard = plan.extract(&init, rank)?;
        drop(init);

        debug!(rank = rank, owned = shard.len(), total = plan.total(); "sharded parameters");

        Ok(Self {
            model,
            local: plan.local_ranges(rank),
            plan,
            rank,
            shard_grad: vec![0.; shard.len()],
            optimizer: optimizer(shard.len()),
            shard,
            full: None,
        })
    }

    /// Returns the parameters this worker owns, the concatenation of its shard of every group.
    pub fn shard(&self) -> &[f32] {
        &self.shard
    }

    pub fn plan(&self) -> &ShardPlan {
        &self.plan
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    /// Whether the full parameters are currently materialized.
    pub fn is_materialized(&self) -> bool {
        self.full.is_some()
    }
}

/// Rebuilds the full parameter set, one all gather per parameter group.
///
/// # Arguments
/// * `group` - The worker's group handle.
/// * `plan` - The plan every worker follows.
/// * `local` - Where each group's shard lives in `shard`.
/// * `shard` - This worker's shard buffer.
async fn gather(
    group: &mut CommunicationGroup,
    plan: &ShardPlan,
    local: &[Range<usize>],
    shard: &[f32],
) -> Result<Vec<f32>> {
    let mut full = Vec::with_capacity(plan.total());

    for (g, local) in plan.groups().iter().zip(local) {
        let values = group.all_gather(&shard[local.clone()]).await?;

        if values.len() != g.len {
            return Err(DistErr::partition(format!(
                "gathered {} values for a group of {}",
                values.len(),
                g.len
            )));
        }

        full.extend_from_slice(&values);
    }

    Ok(full)
}

/// Fails unless every worker of the group built the same plan.
async fn check_agreement(group: &mut CommunicationGroup, plan: &ShardPlan) -> Result<()> {
    let mine = plan.encoded_boundaries();
    let all = group.all_gather(&mine).await?;

    if all.len() != mine.len() * group.world_size() {
        return Err(DistErr::partition("workers built shard plans of different shapes"));
    }

    let same = |a: &f32, b: &f32| a.to_bits() == b.to_bits();
    for (rank, theirs) in all.chunks_exact(mine.len().max(1)).enumerate() {
        if !theirs.iter().zip(&mine).all(|(a, b)| same(a, b)) {
            return Err(DistErr::partition(format!(
                "rank {rank} built a different shard plan"
            )));
        }
    }

    Ok(())
}

impl<M, O> DataParallel for Sharded<M, O>
where
    M: Model + Send,
    O: Optimizer + Send,
{
    async fn forward(
        &mut self,
        group: &mut CommunicationGroup,
        x: ArrayView2<'_, f32>,
    ) -> Result<Array2<f32>> {
        let full = gather(group, &self.plan, &self.local, &self.shard).await?;
        let y = self.model.forward(&full, x)?;
        self.full = Some(full);
        Ok(y)
    }

    async fn evaluate(
        &mut self,
        group: &mut CommunicationGroup,
        x: ArrayView2<'_, f32>,
    ) -> Result<Array2<f32>> {
        let full = gather(group, &self.plan, &self.local, &self.shard).await?;
        Ok(self.model.forward(&full, x)?)
    }

    /// Computes the full gradient locally, then reduce scatters it one group at a time.
    async fn backward(
        &mut self,
        group: &mut CommunicationGroup,
        d: ArrayView2<'_, f32>,
    ) -> Result<()> {
        let Some(full) = self.full.take() else {
            return Err(DistErr::invalid_config(
                "backward called without a preceding forward",
            ));
        };

        let mut grad = vec![0.; full.len()];
        self.model.backward(&full, d, &mut grad)?;
        drop(full);

        for (g, local) in self.plan.groups().iter().zip(&self.local) {
            let part = &grad[g.offset..g.offset + g.len];
            let owned = group.reduce_scatter(part, &g.ranges, ReduceOp::Average).await?;

            self.shard_grad[local.clone()]
                .iter_mut()
                .zip(owned)
                .for_each(|(acc, g)| *acc += g);
        }

        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        Ok(self
            .optimizer
            .update_params(&mut self.shard, &self.shard_grad)?)
    }

    fn zero_grad(&mut self) {
        self.shard_grad.fill(0.);
    }

    async fn full_parameters(&mut self, group: &mut CommunicationGroup) -> Result<Vec<f32>> {
        gather(group, &self.plan, &self.local, &self.shard).await
    }
}
