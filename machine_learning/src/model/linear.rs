use ndarray::{Array2, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Axis, linalg};
use rand::Rng;
use rand_distr::{Distribution, Uniform};

use super::Model;
use crate::error::{MlErr, Result};

/// A fully connected layer without activation, `y = x·W + b`.
///
/// Parameter groups are the `(input, output)` weight matrix in row major order followed by the
/// `output` biases.
#[derive(Debug, Clone)]
pub struct Linear {
    dim: (usize, usize),
    x: Array2<f32>,
}

impl Linear {
    /// Creates a new `Linear` model.
    ///
    /// # Arguments
    /// * `input` - The amount of features per sample.
    /// * `output` - The amount of outputs per sample.
    pub fn new(input: usize, output: usize) -> Self {
        Self {
            dim: (input, output),
            x: Array2::zeros((0, input)),
        }
    }

    fn check_len(&self, what: &'static str, got: usize) -> Result<()> {
        let expected = self.size();

        if got != expected {
            return Err(MlErr::SizeMismatch {
                a: what,
                b: "linear model",
                got,
                expected,
            });
        }

        Ok(())
    }

    fn view_params<'a>(&self, params: &'a [f32]) -> Result<(ArrayView2<'a, f32>, ArrayView1<'a, f32>)> {
        let (w, b) = params.split_at(self.dim.0 * self.dim.1);
        Ok((
            ArrayView2::from_shape(self.dim, w)?,
            ArrayView1::from_shape(self.dim.1, b)?,
        ))
    }

    fn view_grad<'a>(
        &self,
        grad: &'a mut [f32],
    ) -> Result<(ArrayViewMut2<'a, f32>, ArrayViewMut1<'a, f32>)> {
        let (dw, db) = grad.split_at_mut(self.dim.0 * self.dim.1);
        Ok((
            ArrayViewMut2::from_shape(self.dim, dw)?,
            ArrayViewMut1::from_shape(self.dim.1, db)?,
        ))
    }
}

impl Model for Linear {
    fn param_sizes(&self) -> Vec<usize> {
        vec![self.dim.0 * self.dim.1, self.dim.1]
    }

    /// Weights are drawn from `U(-k, k)` with `k = 1 / sqrt(input)`, biases start at zero.
    fn init_params<R: Rng>(&self, rng: &mut R) -> Vec<f32> {
        let k = 1. / (self.dim.0.max(1) as f32).sqrt();
        let mut params = vec![0.; self.size()];

        if let Ok(dist) = Uniform::new(-k, k) {
            let w_size = self.dim.0 * self.dim.1;
            params[..w_size]
                .iter_mut()
                .for_each(|w| *w = dist.sample(rng));
        }

        params
    }

    fn forward(&mut self, params: &[f32], x: ArrayView2<f32>) -> Result<Array2<f32>> {
        self.check_len("params", params.len())?;

        if x.ncols() != self.dim.0 {
            return Err(MlErr::SizeMismatch {
                a: "input features",
                b: "linear input",
                got: x.ncols(),
                expected: self.dim.0,
            });
        }

        let (w, b) = self.view_params(params)?;
        let z = x.dot(&w) + &b;

        self.x = x.to_owned();
        Ok(z)
    }

    fn backward(&mut self, params: &[f32], d: ArrayView2<f32>, grad: &mut [f32]) -> Result<()> {
        self.check_len("params", params.len())?;
        self.check_len("grad", grad.len())?;

        if d.dim() != (self.x.nrows(), self.dim.1) {
            return Err(MlErr::SizeMismatch {
                a: "output delta rows",
                b: "cached batch rows",
                got: d.nrows(),
                expected: self.x.nrows(),
            });
        }

        let (mut dw, mut db) = self.view_grad(grad)?;
        linalg::general_mat_mul(1., &self.x.t(), &d, 1., &mut dw);
        db += &d.sum_axis(Axis(0));

        Ok(())
    }
}
