//! A small binarized classifier for exercising the optimizers end to end.
//!
//! ```text
//! x ─ quant_dense_1 (±1 kernel) ─ scale_1 (γ, β) ─ ste_sign ─ quant_dense_2 (±1 kernel) ─ logits
//! ```
//!
//! Kernel names follow the `quant_*.kernel` convention so
//! [`Bop::is_binary_variable`] picks them up; `scale_1.*` stays full precision.

use candle_core::{DType, Result, Tensor};
use candle_nn::{Init, VarBuilder};

use lowbit_core::{sign, ste_sign, Variable};
use lowbit_optim::{Adam, Bop, CaseOptimizer, Hyperparameter};

/// Kernels are binarized right after creation, so only the sign of the
/// initial draw matters.
const KERNEL_INIT: Init = Init::Randn {
    mean: 0.,
    stdev: 1.,
};

pub struct SmallBnn {
    kernel_1: Tensor,
    gamma_1: Tensor,
    beta_1: Tensor,
    kernel_2: Tensor,
}

impl SmallBnn {
    pub fn new(
        vb: VarBuilder,
        input_dim: usize,
        hidden_dim: usize,
        num_classes: usize,
    ) -> Result<Self> {
        let kernel_1 =
            vb.pp("quant_dense_1")
                .get_with_hints((input_dim, hidden_dim), "kernel", KERNEL_INIT)?;
        let scale = vb.pp("scale_1");
        let gamma_1 = scale.get_with_hints(hidden_dim, "gamma", Init::Const(1.0))?;
        let beta_1 = scale.get_with_hints(hidden_dim, "beta", Init::Const(0.0))?;
        let kernel_2 =
            vb.pp("quant_dense_2")
                .get_with_hints((hidden_dim, num_classes), "kernel", KERNEL_INIT)?;
        Ok(Self {
            kernel_1,
            gamma_1,
            beta_1,
            kernel_2,
        })
    }

    /// Logits `[B, num_classes]` for inputs `[B, input_dim]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let in_dim = self.kernel_1.dim(0)?;
        let hidden_dim = self.kernel_2.dim(0)?;

        let h = x
            .matmul(&ste_sign(&self.kernel_1)?)?
            .affine(1.0 / (in_dim as f64).sqrt(), 0.0)?;
        let h = h.broadcast_mul(&self.gamma_1)?.broadcast_add(&self.beta_1)?;
        let h = ste_sign(&h)?;
        h.matmul(&ste_sign(&self.kernel_2)?)?
            .affine(1.0 / (hidden_dim as f64).sqrt(), 0.0)
    }
}

/// Snap every binary kernel in `vars` to ±1. Returns how many were touched.
pub fn binarize_kernels(vars: &[Variable]) -> Result<usize> {
    let mut n = 0;
    for var in vars.iter().filter(|v| Bop::is_binary_variable(v)) {
        var.set(&sign(var.as_tensor())?)?;
        n += 1;
    }
    Ok(n)
}

/// Fraction of rows whose argmax matches the label.
pub fn accuracy(logits: &Tensor, labels: &Tensor) -> Result<f32> {
    logits
        .argmax(1)?
        .eq(labels)?
        .to_dtype(DType::F32)?
        .mean_all()?
        .to_scalar::<f32>()
}

/// Bop for binary kernels, Adam for everything else.
pub fn bnn_optimizer(
    threshold: impl Into<Hyperparameter>,
    gamma: impl Into<Hyperparameter>,
    learning_rate: impl Into<Hyperparameter>,
) -> CaseOptimizer {
    CaseOptimizer::builder()
        .case(Bop::is_binary_variable, Bop::new(threshold, gamma))
        .default_optimizer(Adam::new(learning_rate))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;
    use lowbit_core::is_binary;

    #[test]
    fn kernels_start_binary_and_logits_have_class_dim() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = SmallBnn::new(vb, 5, 8, 3).unwrap();
        let vars = Variable::from_varmap(&varmap);
        assert_eq!(binarize_kernels(&vars).unwrap(), 2);

        for var in vars.iter().filter(|v| Bop::is_binary_variable(v)) {
            assert!(is_binary(var.as_tensor()).unwrap(), "{var}");
        }
        let x = Tensor::zeros((4, 5), DType::F32, &dev).unwrap();
        assert_eq!(model.forward(&x).unwrap().dims(), &[4, 3]);
    }

    #[test]
    fn accuracy_counts_matches() {
        let dev = Device::Cpu;
        let logits = Tensor::new(&[[2f32, 1.0], [0.0, 3.0], [5.0, 1.0], [0.0, 1.0]], &dev).unwrap();
        let labels = Tensor::new(&[0u32, 1, 1, 1], &dev).unwrap();
        assert!((accuracy(&logits, &labels).unwrap() - 0.75).abs() < 1e-6);
    }
}
