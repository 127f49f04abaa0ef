//! Stochastic gradient descent with optional (Nesterov) momentum.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use candle_core::{Tensor, Var};
use serde::Deserialize;
use serde_json::{json, Value};

use lowbit_core::Variable;

use crate::error::{OptimError, Result};
use crate::optimizer::{parse_config, Gradient, Optimizer, StepReport};
use crate::registry::Registry;
use crate::schedule::Hyperparameter;

#[derive(Debug)]
pub struct Sgd {
    name: String,
    learning_rate: Hyperparameter,
    momentum: f64,
    nesterov: bool,
    velocity: HashMap<String, Var>,
    iterations: usize,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SgdConfig {
    #[serde(default = "default_name")]
    name: String,
    #[serde(default)]
    learning_rate: Option<Value>,
    #[serde(default)]
    momentum: f64,
    #[serde(default)]
    nesterov: bool,
}

fn default_name() -> String {
    "SGD".to_string()
}
fn default_learning_rate() -> f64 {
    0.01
}

impl Default for Sgd {
    fn default() -> Self {
        Self::new(default_learning_rate())
    }
}

impl Sgd {
    pub fn new(learning_rate: impl Into<Hyperparameter>) -> Self {
        Self {
            name: default_name(),
            learning_rate: learning_rate.into(),
            momentum: 0.0,
            nesterov: false,
            velocity: HashMap::new(),
            iterations: 0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// `momentum` must lie in [0, 1].
    pub fn with_momentum(mut self, momentum: f64, nesterov: bool) -> Result<Self> {
        if !(0.0..=1.0).contains(&momentum) {
            return Err(OptimError::invalid(
                "SGD.momentum",
                "a value in [0, 1]",
                momentum.to_string(),
            ));
        }
        self.momentum = momentum;
        self.nesterov = nesterov;
        Ok(self)
    }

    pub fn from_config(config: &Value, custom: Option<&Registry>) -> Result<Self> {
        let cfg: SgdConfig = parse_config("SGD", config)?;
        let learning_rate = match cfg.learning_rate {
            Some(v) => Hyperparameter::from_value("SGD.learning_rate", &v, custom)?,
            None => default_learning_rate().into(),
        };
        Self::new(learning_rate)
            .with_name(cfg.name)
            .with_momentum(cfg.momentum, cfg.nesterov)
    }

    fn apply_momentum(&mut self, g: &Tensor, var: &Variable, lr: f64) -> Result<()> {
        let value = var.as_tensor().detach();
        let velocity = match self.velocity.entry(var.name().to_string()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(Var::from_tensor(&value.zeros_like()?)?),
        };
        let next_velocity =
            (velocity.as_tensor().affine(self.momentum, 0.0)? - g.affine(lr, 0.0)?)?;
        let next = if self.nesterov {
            ((&value + next_velocity.affine(self.momentum, 0.0)?)? - g.affine(lr, 0.0)?)?
        } else {
            (&value + &next_velocity)?
        };
        velocity.set(&next_velocity)?;
        var.set(&next)?;
        Ok(())
    }
}

impl Optimizer for Sgd {
    fn name(&self) -> &str {
        &self.name
    }

    fn class_name(&self) -> &'static str {
        "SGD"
    }

    fn iterations(&self) -> usize {
        self.iterations
    }

    fn apply_gradients(&mut self, grads_and_vars: &[(Gradient, Variable)]) -> Result<StepReport> {
        let lr = self.learning_rate.value_at(self.iterations);

        for (grad, var) in grads_and_vars {
            let value = var.as_tensor().detach();
            match grad {
                // Plain SGD touches only the listed rows.
                Gradient::Sparse { indices, values } if self.momentum == 0.0 => {
                    let delta = values.to_dtype(value.dtype())?.affine(-lr, 0.0)?;
                    var.set(&value.index_add(indices, &delta, 0)?)?;
                }
                _ if self.momentum == 0.0 => {
                    let g = grad.to_dense(&value)?.to_dtype(value.dtype())?;
                    var.set(&(value - g.affine(lr, 0.0)?)?)?;
                }
                _ => {
                    let g = grad.to_dense(&value)?.to_dtype(value.dtype())?.detach();
                    self.apply_momentum(&g, var, lr)?;
                }
            }
        }
        self.iterations += 1;
        Ok(StepReport::updated(grads_and_vars.len()))
    }

    fn get_config(&self) -> Value {
        json!({
            "name": self.name,
            "learning_rate": self.learning_rate.to_value(),
            "momentum": self.momentum,
            "nesterov": self.nesterov,
        })
    }
}
