//! Adam with optional decoupled weight decay, for full-precision variables.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use candle_core::Var;
use serde::Deserialize;
use serde_json::{json, Value};

use lowbit_core::Variable;

use crate::error::Result;
use crate::optimizer::{parse_config, Gradient, Optimizer, StepReport};
use crate::registry::Registry;
use crate::schedule::Hyperparameter;

#[derive(Debug)]
pub struct Adam {
    name: String,
    learning_rate: Hyperparameter,
    beta_1: f64,
    beta_2: f64,
    epsilon: f64,
    weight_decay: f64,
    /// (first moment, second moment) per variable.
    slots: HashMap<String, (Var, Var)>,
    iterations: usize,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AdamConfig {
    #[serde(default = "default_name")]
    name: String,
    #[serde(default)]
    learning_rate: Option<Value>,
    #[serde(default = "default_beta_1")]
    beta_1: f64,
    #[serde(default = "default_beta_2")]
    beta_2: f64,
    #[serde(default = "default_epsilon")]
    epsilon: f64,
    #[serde(default)]
    weight_decay: f64,
}

fn default_name() -> String {
    "Adam".to_string()
}
fn default_learning_rate() -> f64 {
    1e-3
}
fn default_beta_1() -> f64 {
    0.9
}
fn default_beta_2() -> f64 {
    0.999
}
fn default_epsilon() -> f64 {
    1e-7
}

impl Default for Adam {
    fn default() -> Self {
        Self::new(default_learning_rate())
    }
}

impl Adam {
    pub fn new(learning_rate: impl Into<Hyperparameter>) -> Self {
        Self {
            name: default_name(),
            learning_rate: learning_rate.into(),
            beta_1: default_beta_1(),
            beta_2: default_beta_2(),
            epsilon: default_epsilon(),
            weight_decay: 0.0,
            slots: HashMap::new(),
            iterations: 0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_betas(mut self, beta_1: f64, beta_2: f64) -> Self {
        self.beta_1 = beta_1;
        self.beta_2 = beta_2;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn learning_rate(&self) -> &Hyperparameter {
        &self.learning_rate
    }

    pub fn from_config(config: &Value, custom: Option<&Registry>) -> Result<Self> {
        let cfg: AdamConfig = parse_config("Adam", config)?;
        let learning_rate = match cfg.learning_rate {
            Some(v) => Hyperparameter::from_value("Adam.learning_rate", &v, custom)?,
            None => default_learning_rate().into(),
        };
        let mut adam = Self::new(learning_rate)
            .with_name(cfg.name)
            .with_betas(cfg.beta_1, cfg.beta_2)
            .with_weight_decay(cfg.weight_decay);
        adam.epsilon = cfg.epsilon;
        Ok(adam)
    }
}

impl Optimizer for Adam {
    fn name(&self) -> &str {
        &self.name
    }

    fn class_name(&self) -> &'static str {
        "Adam"
    }

    fn iterations(&self) -> usize {
        self.iterations
    }

    fn apply_gradients(&mut self, grads_and_vars: &[(Gradient, Variable)]) -> Result<StepReport> {
        let lr = self.learning_rate.value_at(self.iterations);
        let t = (self.iterations + 1) as i32;
        let scale_m = 1.0 / (1.0 - self.beta_1.powi(t));
        let scale_v = 1.0 / (1.0 - self.beta_2.powi(t));

        for (grad, var) in grads_and_vars {
            let value = var.as_tensor().detach();
            let g = grad.to_dense(&value)?.to_dtype(value.dtype())?.detach();

            let (m, v) = match self.slots.entry(var.name().to_string()) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(e) => e.insert((
                    Var::from_tensor(&value.zeros_like()?)?,
                    Var::from_tensor(&value.zeros_like()?)?,
                )),
            };

            let next_m = (m.as_tensor().affine(self.beta_1, 0.0)? + g.affine(1.0 - self.beta_1, 0.0)?)?;
            let next_v =
                (v.as_tensor().affine(self.beta_2, 0.0)? + g.sqr()?.affine(1.0 - self.beta_2, 0.0)?)?;
            let m_hat = next_m.affine(scale_m, 0.0)?;
            let v_hat = next_v.affine(scale_v, 0.0)?;
            let step = m_hat.div(&v_hat.sqrt()?.affine(1.0, self.epsilon)?)?;
            let decayed = value.affine(1.0 - lr * self.weight_decay, 0.0)?;
            let next = (decayed - step.affine(lr, 0.0)?)?;

            m.set(&next_m)?;
            v.set(&next_v)?;
            var.set(&next)?;
        }
        self.iterations += 1;
        Ok(StepReport::updated(grads_and_vars.len()))
    }

    fn get_config(&self) -> Value {
        json!({
            "name": self.name,
            "learning_rate": self.learning_rate.to_value(),
            "beta_1": self.beta_1,
            "beta_2": self.beta_2,
            "epsilon": self.epsilon,
            "weight_decay": self.weight_decay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::ExponentialDecay;
    use candle_core::{Device, Tensor};

    #[test]
    fn first_step_moves_by_learning_rate() {
        let dev = Device::Cpu;
        let w = Variable::from_tensor("dense/kernel", &Tensor::new(&[1f32, -1.0, 0.5], &dev).unwrap())
            .unwrap();
        let mut adam = Adam::new(0.1);
        let grad = Gradient::Dense(Tensor::new(&[2f32, -3.0, 0.0], &dev).unwrap());
        adam.apply_gradients(&[(grad, w.clone())]).unwrap();
        // Bias-corrected first step is lr·g/|g|; zero gradient leaves the value.
        let got: Vec<f32> = w.as_tensor().to_vec1().unwrap();
        assert!((got[0] - 0.9).abs() < 1e-4);
        assert!((got[1] + 0.9).abs() < 1e-4);
        assert!((got[2] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn sparse_gradients_are_densified() {
        let dev = Device::Cpu;
        let w = Variable::from_tensor("emb", &Tensor::new(&[[1f32], [1.0]], &dev).unwrap()).unwrap();
        let mut adam = Adam::new(0.1);
        let grad = Gradient::Sparse {
            indices: Tensor::new(&[1u32], &dev).unwrap(),
            values: Tensor::new(&[[1f32]], &dev).unwrap(),
        };
        adam.apply_gradients(&[(grad, w.clone())]).unwrap();
        let got: Vec<Vec<f32>> = w.as_tensor().to_vec2().unwrap();
        assert!((got[0][0] - 1.0).abs() < 1e-6);
        assert!((got[1][0] - 0.9).abs() < 1e-4);
    }

    #[test]
    fn config_round_trip() {
        let adam = Adam::new(Hyperparameter::schedule(ExponentialDecay::new(0.01, 100.0, 0.9)))
            .with_weight_decay(1e-4);
        let restored = Adam::from_config(&adam.get_config(), None).unwrap();
        assert_eq!(restored.get_config(), adam.get_config());
        assert!(restored.learning_rate().is_schedule());
    }
}
