use std::ops::Range;

use distributed::shard_range;
use machine_learning::dataset::Dataset;
use ndarray::Array2;
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

use crate::error::{Result, WorkerErr};

/// This worker's share of one global batch, one sample per row.
#[derive(Debug, Clone)]
pub struct Batch {
    pub x: Array2<f32>,
    pub y: Array2<f32>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.x.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Walks a dataset in global batches and hands out this worker's share of each.
///
/// Every worker draws the same global batches in the same order, so the workers' local batches
/// are disjoint and together cover the global batch. A worker with an empty share still gets a
/// batch, so every worker takes the same amount of steps.
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: Dataset,
    global_batch: usize,
    rank: usize,
    world_size: usize,
    shuffle_seed: Option<u64>,
    order: Vec<usize>,
    cursor: usize,
}

impl DataLoader {
    /// Creates a new `DataLoader`, positioned at the start of epoch 0.
    ///
    /// # Arguments
    /// * `dataset` - The full dataset, the same on every worker.
    /// * `global_batch` - The amount of samples all the workers process together each step.
    /// * `rank` - This worker's rank.
    /// * `world_size` - The amount of workers.
    ///
    /// # Errors
    /// `InvalidConfig` if the batch size or the world size is zero, or the rank is out of range.
    pub fn new(dataset: Dataset, global_batch: usize, rank: usize, world_size: usize) -> Result<Self> {
        if global_batch == 0 {
            return Err(WorkerErr::invalid_config("the global batch size must be positive"));
        }

        if rank >= world_size {
            return Err(WorkerErr::invalid_config(format!(
                "rank {rank} is out of range for {world_size} workers"
            )));
        }

        Ok(Self {
            order: (0..dataset.len()).collect(),
            dataset,
            global_batch,
            rank,
            world_size,
            shuffle_seed: None,
            cursor: 0,
        })
    }

    /// Makes every epoch visit the samples in a fresh order, seeded by `seed + epoch`.
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self.reset(0);
        self
    }

    /// Rewinds the loader to the start of `epoch`.
    pub fn reset(&mut self, epoch: usize) {
        self.cursor = 0;
        self.order = (0..self.dataset.len()).collect();

        if let Some(seed) = self.shuffle_seed {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
            self.order.shuffle(&mut rng);
        }
    }

    /// Returns the amount of global batches in an epoch, the last one may be short.
    pub fn steps_per_epoch(&self) -> usize {
        self.dataset.len().div_ceil(self.global_batch)
    }

    /// Returns the amount of samples all the workers process together each step.
    pub fn global_batch(&self) -> usize {
        self.global_batch
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Returns this worker's share of the next global batch.
    ///
    /// # Errors
    /// `EndOfEpoch` once every global batch of the epoch was handed out.
    pub fn next_batch(&mut self) -> Result<Batch> {
        let global = self.next_global().ok_or(WorkerErr::EndOfEpoch)?;
        let local = shard_range(global.len(), self.rank, self.world_size);

        let start = global.start + local.start;
        let indices = &self.order[start..start + local.len()];
        let (x, y) = self.dataset.gather(indices)?;
        Ok(Batch { x, y })
    }

    fn next_global(&mut self) -> Option<Range<usize>> {
        let len = self.dataset.len();
        if self.cursor >= len {
            return None;
        }

        let global = self.cursor..(self.cursor + self.global_batch).min(len);
        self.cursor = global.end;
        Some(global)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(len: usize) -> Dataset {
        let x = (0..len).map(|i| i as f32).collect();
        let y = (0..len).map(|i| i as f32 + 100.).collect();
        Dataset::new(x, y, 1, 1).unwrap()
    }

    fn ids(batch: &Batch) -> Vec<usize> {
        batch.x.iter().map(|&x| x as usize).collect()
    }

    #[test]
    fn test_global_batch_is_split_disjoint_and_complete() {
        let mut loaders: Vec<_> = (0..3)
            .map(|r| DataLoader::new(dataset(10), 8, r, 3).unwrap())
            .collect();

        let first: Vec<_> = loaders.iter_mut().map(|l| ids(&l.next_batch().unwrap())).collect();
        assert_eq!(first, [vec![0, 1, 2], vec![3, 4, 5], vec![6, 7]]);

        let second: Vec<_> = loaders.iter_mut().map(|l| ids(&l.next_batch().unwrap())).collect();
        assert_eq!(second, [vec![8], vec![9], vec![]]);

        for loader in &mut loaders {
            assert!(matches!(loader.next_batch(), Err(WorkerErr::EndOfEpoch)));
            assert_eq!(loader.steps_per_epoch(), 2);
        }
    }

    #[test]
    fn test_empty_share_keeps_the_columns() {
        let mut loader = DataLoader::new(dataset(2), 2, 3, 4).unwrap();
        let batch = loader.next_batch().unwrap();

        assert!(batch.is_empty());
        assert_eq!(batch.x.dim(), (0, 1));
        assert_eq!(batch.y.dim(), (0, 1));
    }

    #[test]
    fn test_targets_follow_inputs() {
        let mut loader = DataLoader::new(dataset(6), 6, 1, 2).unwrap().with_shuffle(7);
        let batch = loader.next_batch().unwrap();

        batch
            .x
            .iter()
            .zip(batch.y.iter())
            .for_each(|(x, y)| assert_eq!(*y, x + 100.));
    }

    #[test]
    fn test_shuffle_is_shared_and_changes_per_epoch() {
        let epoch = |rank: usize, epoch: usize| -> Vec<usize> {
            let mut loader = DataLoader::new(dataset(32), 32, rank, 2).unwrap().with_shuffle(1);
            loader.reset(epoch);
            ids(&loader.next_batch().unwrap())
        };

        let mut union = [epoch(0, 0), epoch(1, 0)].concat();
        union.sort();
        assert_eq!(union, (0..32).collect::<Vec<_>>());

        assert_eq!(epoch(0, 3), epoch(0, 3));
        assert_ne!(epoch(0, 0), epoch(0, 1));
    }

    #[test]
    fn test_reset_rewinds() {
        let mut loader = DataLoader::new(dataset(4), 4, 0, 1).unwrap();
        let first = ids(&loader.next_batch().unwrap());

        assert!(matches!(loader.next_batch(), Err(WorkerErr::EndOfEpoch)));
        loader.reset(1);
        assert_eq!(ids(&loader.next_batch().unwrap()), first);
    }

    #[test]
    fn test_bad_arguments() {
        assert!(DataLoader::new(dataset(4), 0, 0, 1).is_err());
        assert!(DataLoader::new(dataset(4), 4, 2, 2).is_err());
    }
}
