use std::ops::Range;

use crate::error::{DistErr, Result};

/// Splits `total` elements among `world_size` workers and returns the range owned by `rank`.
///
/// Ranges are contiguous, disjoint and cover `0..total`, the first `total % world_size` ranks own
/// one extra element. An out of range `rank` owns nothing.
pub fn shard_range(total: usize, rank: usize, world_size: usize) -> Range<usize> {
    if rank >= world_size {
        return total..total;
    }

    let base = total / world_size;
    let rem = total % world_size;

    let start = rank * base + rank.min(rem);
    let extra = usize::from(rank < rem);
    start..start + base + extra
}

/// How one parameter group is laid out in the flat parameter buffer and split among the workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupPlan {
    /// Where the group starts in the full parameter buffer.
    pub offset: usize,
    pub len: usize,
    /// The range of the group owned by each rank, relative to the group.
    pub ranges: Vec<Range<usize>>,
}

/// The assignment of every parameter group's elements to the workers of the group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPlan {
    world_size: usize,
    groups: Vec<GroupPlan>,
}

impl ShardPlan {
    /// Plans the balanced split of every parameter group.
    ///
    /// # Arguments
    /// * `param_sizes` - The size of every parameter group, in the model's canonical order.
    /// * `world_size` - The amount of workers.
    ///
    /// # Errors
    /// `InvalidConfig` if `world_size` is zero.
    pub fn new(param_sizes: &[usize], world_size: usize) -> Result<Self> {
        let ranges = param_sizes
            .iter()
            .map(|&len| (0..world_size).map(|r| shard_range(len, r, world_size)).collect())
            .collect();

        Self::from_ranges(param_sizes, world_size, ranges)
    }

    /// Builds a plan from explicit per group, per rank ranges. The plan isn't validated.
    ///
    /// # Arguments
    /// * `param_sizes` - The size of every parameter group.
    /// * `world_size` - The amount of workers.
    /// * `ranges` - For every group, the range owned by every rank.
    ///
    /// # Errors
    /// `InvalidConfig` if `world_size` is zero or there isn't one entry of `ranges` per group.
    pub fn from_ranges(
        param_sizes: &[usize],
        world_size: usize,
        ranges: Vec<Vec<Range<usize>>>,
    ) -> Result<Self> {
        if world_size == 0 {
            return Err(DistErr::invalid_config("a shard plan needs at least one worker"));
        }

        if ranges.len() != param_sizes.len() {
            return Err(DistErr::invalid_config(format!(
                "got ranges for {} parameter groups, the model has {}",
                ranges.len(),
                param_sizes.len()
            )));
        }

        let mut offset = 0;
        let groups = param_sizes
            .iter()
            .zip(ranges)
            .map(|(&len, ranges)| {
                let group = GroupPlan {
                    offset,
                    len,
                    ranges,
                };
                offset += len;
                group
            })
            .collect();

        Ok(Self { world_size, groups })
    }

    /// Checks that every group's ranges are contiguous, disjoint and cover the group exactly.
    ///
    /// # Errors
    /// `PartitionInvariant` naming the first group that breaks the invariant.
    pub fn validate(&self) -> Result<()> {
        for (i, group) in self.groups.iter().enumerate() {
            if group.ranges.len() != self.world_size {
                return Err(DistErr::partition(format!(
                    "group {i} is split in {} shards for {} workers",
                    group.ranges.len(),
                    self.world_size
                )));
            }

            let mut next = 0;
            for (rank, range) in group.ranges.iter().enumerate() {
                if range.start != next || range.start > range.end {
                    return Err(DistErr::partition(format!(
                        "group {i}: shard {range:?} of rank {rank} should start at {next}"
                    )));
                }

                next = range.end;
            }

            if next != group.len {
                return Err(DistErr::partition(format!(
                    "group {i}: shards cover {next} of {} parameters",
                    group.len
                )));
            }
        }

        Ok(())
    }

    /// Returns every range boundary of the plan encoded as `f32` bit patterns.
    ///
    /// Each boundary is written as its low and high 32 bits, so the encoding survives a tensor
    /// collective untouched and two plans are equal iff their encodings are bitwise equal.
    pub fn encoded_boundaries(&self) -> Vec<f32> {
        let mut out = Vec::new();
        let mut push = |n: usize| {
            let n = n as u64;
            out.push(f32::from_bits(n as u32));
            out.push(f32::from_bits((n >> 32) as u32));
        };

        push(self.world_size);
        for group in &self.groups {
            push(group.len);
            for range in &group.ranges {
                push(range.start);
                push(range.end);
            }
        }

        out
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn groups(&self) -> &[GroupPlan] {
        &self.groups
    }

    /// Returns the total amount of parameters.
    pub fn total(&self) -> usize {
        self.groups.iter().map(|g| g.len).sum()
    }

    /// Returns, for every group, where `rank`'s shard lives inside its local shard buffer.
    ///
    /// The local buffer is the concatenation of the rank's shard of every group, in group order.
    pub fn local_ranges(&self, rank: usize) -> Vec<Range<usize>> {
        let mut offset = 0;

        self.groups
            .iter()
            .map(|group| {
                let len = group.ranges.get(rank).map_or(0, |r| r.len());
                let local = offset..offset + len;
                offset += len;
                local
            })
            .collect()
    }

    /// Returns the amount of parameters `rank` owns.
    pub fn local_len(&self, rank: usize) -> usize {
        self.local_ranges(rank).last().map_or(0, |r| r.end)
    }

    /// Copies `rank`'s shard of every group out of a full parameter buffer.
    ///
    /// # Errors
    /// `PartitionInvariant` if `full` doesn't hold exactly `total()` parameters.
    pub fn extract(&self, full: &[f32], rank: usize) -> Result<Vec<f32>> {
        if full.len() != self.total() {
            return Err(DistErr::partition(format!(
                "full buffer holds {} parameters, the plan covers {}",
                full.len(),
                self.total()
            )));
        }

        let mut shard = Vec::with_capacity(self.local_len(rank));
        for group in &self.groups {
            let Some(range) = group.ranges.get(rank) else {
                continue;
            };

            let span = group.offset + range.start..group.offset + range.end;
            let Some(values) = full.get(span.clone()) else {
                return Err(DistErr::partition(format!(
                    "shard {span:?} of rank {rank} is outside the parameter buffer"
                )));
            };

            shard.extend_from_slice(values);
        }

        Ok(shard)
    }
}
