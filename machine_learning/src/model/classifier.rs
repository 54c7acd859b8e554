use ndarray::{Array2, ArrayView2, Axis};
use rand::Rng;

use super::{Linear, Model};
use crate::error::{MlErr, Result};

/// A linear layer followed by a log softmax, one row of class log probabilities per sample.
///
/// Meant to be trained with `Nll`. The parameters are the inner `Linear`'s.
#[derive(Debug, Clone)]
pub struct Classifier {
    linear: Linear,
    /// The class probabilities of the last forward pass.
    p: Array2<f32>,
}

impl Classifier {
    /// Creates a new `Classifier`.
    ///
    /// # Arguments
    /// * `input` - The amount of features per sample.
    /// * `classes` - The amount of classes.
    pub fn new(input: usize, classes: usize) -> Self {
        Self {
            linear: Linear::new(input, classes),
            p: Array2::zeros((0, classes)),
        }
    }
}

/// Row wise `z - log(sum(exp(z)))`, shifted by the row's max.
fn log_softmax(mut z: Array2<f32>) -> Array2<f32> {
    for mut row in z.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        let lse = max + row.iter().map(|v| (v - max).exp()).sum::<f32>().ln();
        row.mapv_inplace(|v| v - lse);
    }

    z
}

impl Model for Classifier {
    fn param_sizes(&self) -> Vec<usize> {
        self.linear.param_sizes()
    }

    fn init_params<R: Rng>(&self, rng: &mut R) -> Vec<f32> {
        self.linear.init_params(rng)
    }

    fn forward(&mut self, params: &[f32], x: ArrayView2<f32>) -> Result<Array2<f32>> {
        let log_p = log_softmax(self.linear.forward(params, x)?);
        self.p = log_p.mapv(f32::exp);
        Ok(log_p)
    }

    fn backward(&mut self, params: &[f32], d: ArrayView2<f32>, grad: &mut [f32]) -> Result<()> {
        if d.dim() != self.p.dim() {
            return Err(MlErr::SizeMismatch {
                a: "output delta rows",
                b: "cached batch rows",
                got: d.nrows(),
                expected: self.p.nrows(),
            });
        }

        let total = d.sum_axis(Axis(1)).insert_axis(Axis(1));
        let dz = &d - &(&self.p * &total);

        self.linear.backward(params, dz.view(), grad)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn test_rows_are_log_probabilities() {
        let mut model = Classifier::new(2, 3);
        let params = [1., 0., -1., 0.5, 2., 0., 0., 0., 0.];
        let x = array![[1., 2.], [-3., 0.5]];

        let log_p = model.forward(&params, x.view()).unwrap();
        for row in log_p.rows() {
            let total: f32 = row.iter().map(|v| v.exp()).sum();
            assert!((total - 1.).abs() < 1e-6);
        }
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let mut model = Classifier::new(1, 2);
        let params = [0.3, -0.2, 0.1, 0.];
        let x = array![[1.5], [-0.5]];
        let targets = [0, 1];

        let nll = |model: &mut Classifier, params: &[f32]| -> f32 {
            let log_p = model.forward(params, x.view()).unwrap();
            targets.iter().enumerate().map(|(row, &c)| -log_p[(row, c)]).sum()
        };

        model.forward(&params, x.view()).unwrap();
        let mut d = Array2::zeros((2, 2));
        d[(0, 0)] = -1.;
        d[(1, 1)] = -1.;

        let mut grad = [0.; 4];
        model.backward(&params, d.view(), &mut grad).unwrap();

        let eps = 1e-3;
        for i in 0..params.len() {
            let mut up = params;
            let mut down = params;
            up[i] += eps;
            down[i] -= eps;

            let numeric = (nll(&mut model, &up) - nll(&mut model, &down)) / (2. * eps);
            assert!((grad[i] - numeric).abs() < 1e-2, "param {i}: {} vs {numeric}", grad[i]);
        }
    }
}
