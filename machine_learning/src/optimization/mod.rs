mod adam;
mod gradient_descent;

pub use adam::Adam;
pub use gradient_descent::GradientDescent;

use crate::error::{MlErr, Result};

pub trait Optimizer {
    /// Updates `params` in place following the algorithm's learning rule.
    ///
    /// # Arguments
    /// * `params` - The parameters that are going to be modified.
    /// * `grad` - The gradient used for taking the step.
    ///
    /// # Errors
    /// A size mismatch if `params`, `grad` and the optimizer's state disagree in length.
    fn update_params(&mut self, params: &mut [f32], grad: &[f32]) -> Result<()>;
}

fn check_len(params: &[f32], grad: &[f32]) -> Result<()> {
    if params.len() != grad.len() {
        return Err(MlErr::SizeMismatch {
            a: "gradient",
            b: "parameters",
            got: grad.len(),
            expected: params.len(),
        });
    }

    Ok(())
}
