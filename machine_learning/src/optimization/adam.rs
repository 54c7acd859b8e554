use super::{Optimizer, check_len};
use crate::error::{MlErr, Result};

/// The Adam optimizer, its moment estimates are sized to the parameters it was built for.
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    beta1_t: f32,
    beta2_t: f32,
    v: Box<[f32]>,
    s: Box<[f32]>,
    epsilon: f32,
}

impl Adam {
    /// Creates a new `Adam` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `beta1`, `beta2`, `epsilon` - Hyperparameters to the optimization algorithm.
    ///
    /// # Returns
    /// A new `Adam` instance.
    pub fn new(len: usize, learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            beta1_t: 1.,
            beta2_t: 1.,
            v: vec![0.; len].into_boxed_slice(),
            s: vec![0.; len].into_boxed_slice(),
            epsilon,
        }
    }

    /// Creates an `Adam` optimizer with the usual `0.9`, `0.999` and `1e-8` hyperparameters.
    pub fn with_defaults(len: usize, learning_rate: f32) -> Self {
        Self::new(len, learning_rate, 0.9, 0.999, 1e-8)
    }

    /// Returns the amount of parameters the moment estimates cover.
    pub fn state_len(&self) -> usize {
        self.v.len()
    }
}

impl Optimizer for Adam {
    fn update_params(&mut self, params: &mut [f32], grad: &[f32]) -> Result<()> {
        check_len(params, grad)?;

        if params.len() != self.v.len() {
            return Err(MlErr::SizeMismatch {
                a: "parameters",
                b: "adam state",
                got: params.len(),
                expected: self.v.len(),
            });
        }

        let Self {
            learning_rate: lr,
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            ..
        } = *self;

        self.beta1_t *= b1;
        self.beta2_t *= b2;

        let bc1 = 1. - self.beta1_t;
        let bc2 = 1. - self.beta2_t;

        params
            .iter_mut()
            .zip(grad)
            .zip(self.v.iter_mut())
            .zip(self.s.iter_mut())
            .for_each(|(((p, g), v), s)| {
                *v = b1 * *v + (1. - b1) * g;
                *s = b2 * *s + (1. - b2) * g.powi(2);
                let v_hat = *v / bc1;
                let s_hat = *s / bc2;
                *p -= lr * v_hat / (s_hat.sqrt() + eps);
            });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        let mut adam = Adam::with_defaults(2, 0.1);
        let mut params = [1., 1.];
        adam.update_params(&mut params, &[3., -0.5]).unwrap();

        assert!((params[0] - 0.9).abs() < 1e-5);
        assert!((params[1] - 1.1).abs() < 1e-5);
    }

    #[test]
    fn test_state_is_sized_to_params() {
        let mut adam = Adam::with_defaults(3, 0.1);
        assert_eq!(adam.state_len(), 3);

        let err = adam.update_params(&mut [0.; 4], &[0.; 4]).unwrap_err();
        assert!(matches!(err, MlErr::SizeMismatch { got: 4, expected: 3, .. }));
    }

    #[test]
    fn test_empty_shard_is_a_noop() {
        let mut adam = Adam::with_defaults(0, 0.1);
        adam.update_params(&mut [], &[]).unwrap();
    }
}
