use ndarray::{Array2, ArrayView2, Axis};
use rand::{SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Uniform};

use crate::error::{MlErr, Result};

/// An in-memory supervised dataset stored as two row major buffers.
#[derive(Debug, Clone)]
pub struct Dataset {
    x: Vec<f32>,
    y: Vec<f32>,
    x_size: usize,
    y_size: usize,
    len: usize,
}

impl Dataset {
    /// Creates a new `Dataset`.
    ///
    /// # Arguments
    /// * `x` - The inputs, `x_size` values per sample.
    /// * `y` - The targets, `y_size` values per sample.
    /// * `x_size` - The amount of features per sample.
    /// * `y_size` - The amount of target values per sample.
    ///
    /// # Errors
    /// `EmptyDataset` if there are no samples, a size mismatch if the buffers don't describe the
    /// same amount of samples.
    pub fn new(x: Vec<f32>, y: Vec<f32>, x_size: usize, y_size: usize) -> Result<Self> {
        if x_size == 0 || y_size == 0 || x.is_empty() {
            return Err(MlErr::EmptyDataset);
        }

        let len = x.len() / x_size;

        if x.len() % x_size != 0 || y.len() != len * y_size {
            return Err(MlErr::SizeMismatch {
                a: "targets",
                b: "inputs",
                got: y.len(),
                expected: len * y_size,
            });
        }

        Ok(Self {
            x,
            y,
            x_size,
            y_size,
            len,
        })
    }

    /// Generates `len` samples of `y = x·weights + bias` with inputs drawn from `U(-1, 1)`.
    ///
    /// # Arguments
    /// * `len` - The amount of samples.
    /// * `weights` - One weight per input feature.
    /// * `bias` - The offset added to every target.
    /// * `seed` - The seed for the inputs, equal seeds give equal datasets.
    pub fn synthetic_linear(len: usize, weights: &[f32], bias: f32, seed: u64) -> Result<Self> {
        let x_size = weights.len();
        let mut rng = StdRng::seed_from_u64(seed);
        let dist = Uniform::new(-1f32, 1.).map_err(|_| MlErr::EmptyDataset)?;

        let x: Vec<f32> = (0..len * x_size).map(|_| dist.sample(&mut rng)).collect();
        let y = x
            .chunks_exact(x_size.max(1))
            .map(|row| row.iter().zip(weights).map(|(x, w)| x * w).sum::<f32>() + bias)
            .collect();

        Self::new(x, y, x_size, 1)
    }

    /// Moves the samples from `at` onwards into a new dataset, keeping the ones before it.
    ///
    /// # Arguments
    /// * `at` - The first sample of the split off part.
    ///
    /// # Errors
    /// `EmptyDataset` if either part would be left without samples.
    pub fn split_off(&mut self, at: usize) -> Result<Dataset> {
        if at == 0 || at >= self.len {
            return Err(MlErr::EmptyDataset);
        }

        let x = self.x.split_off(at * self.x_size);
        let y = self.y.split_off(at * self.y_size);
        let tail = Self::new(x, y, self.x_size, self.y_size)?;

        self.len = at;
        Ok(tail)
    }

    /// Returns the amount of samples.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn x_size(&self) -> usize {
        self.x_size
    }

    pub fn y_size(&self) -> usize {
        self.y_size
    }

    /// Copies the samples at `indices` into a new `(x, y)` batch.
    ///
    /// # Arguments
    /// * `indices` - Sample indices, all of them must be lower than `len()`.
    pub fn gather(&self, indices: &[usize]) -> Result<(Array2<f32>, Array2<f32>)> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.len) {
            return Err(MlErr::SizeMismatch {
                a: "sample index",
                b: "dataset length",
                got: bad,
                expected: self.len,
            });
        }

        if indices.is_empty() {
            return Ok((
                Array2::zeros((0, self.x_size)),
                Array2::zeros((0, self.y_size)),
            ));
        }

        let x = ArrayView2::from_shape((self.len, self.x_size), &self.x)?;
        let y = ArrayView2::from_shape((self.len, self.y_size), &self.y)?;
        Ok((x.select(Axis(0), indices), y.select(Axis(0), indices)))
    }
}
