//! Bop: the latent-free binary optimizer.
//!
//! Bop keeps an exponential moving average `m` of each variable's gradient and
//! flips a ±1 weight when `m` agrees with the weight's sign strongly enough:
//!
//! ```text
//! m ← (1 - γ)·m + γ·g
//! w ← sign(-tsign(w·m - τ) · w)
//! ```
//!
//! `tsign` is the three-valued sign and `sign` the binary one
//! ([`lowbit_core::sign`]), so a weight in {-1, +1} stays in {-1, +1}.
//!
//! γ (`gamma`) plays the role of a learning rate: high values converge fast but
//! train noisily. τ (`threshold`) sets flip sensitivity: too high and nothing
//! flips, too low and weights chatter.
//!
//! Reference: Helwegen et al., "Latent Weights Do Not Exist: Rethinking
//! Binarized Neural Network Optimization" (2019).

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use candle_core::{Tensor, Var};
use serde::Deserialize;
use serde_json::{json, Value};

use lowbit_core::{sign, Variable};

use crate::error::{OptimError, Result};
use crate::optimizer::{parse_config, Gradient, Optimizer, StepReport};
use crate::registry::Registry;
use crate::schedule::Hyperparameter;

pub const DEFAULT_THRESHOLD: f64 = 1e-7;
pub const DEFAULT_GAMMA: f64 = 1e-2;

/// Binary optimizer. Only meaningful for variables already in {-1, +1}; pair
/// it with [`Bop::is_binary_variable`] inside a `CaseOptimizer`.
#[derive(Debug)]
pub struct Bop {
    name: String,
    threshold: Hyperparameter,
    gamma: Hyperparameter,
    /// Per-variable gradient EMA, created on first sight.
    momentum: HashMap<String, Var>,
    iterations: usize,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct BopConfig {
    #[serde(default = "default_name")]
    name: String,
    #[serde(default)]
    threshold: Option<Value>,
    #[serde(default)]
    gamma: Option<Value>,
}

fn default_name() -> String {
    "Bop".to_string()
}

impl Default for Bop {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD, DEFAULT_GAMMA)
    }
}

impl Bop {
    pub fn new(threshold: impl Into<Hyperparameter>, gamma: impl Into<Hyperparameter>) -> Self {
        Self {
            name: default_name(),
            threshold: threshold.into(),
            gamma: gamma.into(),
            momentum: HashMap::new(),
            iterations: 0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn threshold(&self) -> &Hyperparameter {
        &self.threshold
    }

    pub fn gamma(&self) -> &Hyperparameter {
        &self.gamma
    }

    /// The momentum slot of `var_name`, if that variable has been updated.
    pub fn momentum(&self, var_name: &str) -> Option<&Var> {
        self.momentum.get(var_name)
    }

    /// Naming-convention predicate for binary kernels: the name carries the
    /// `quant_` layer marker and a path segment (split on `/` or `.`) that
    /// starts with `kernel`, e.g. `quant_conv2d/kernel:0` or
    /// `block_1.quant_dense.kernel`.
    pub fn is_binary_variable(var: &Variable) -> bool {
        let name = var.name();
        name.contains("quant_")
            && name
                .split(['/', '.'])
                .skip(1)
                .any(|segment| segment.starts_with("kernel"))
    }

    pub fn from_config(config: &Value, custom: Option<&Registry>) -> Result<Self> {
        let cfg: BopConfig = parse_config("Bop", config)?;
        let threshold = match cfg.threshold {
            Some(v) => Hyperparameter::from_value("Bop.threshold", &v, custom)?,
            None => DEFAULT_THRESHOLD.into(),
        };
        let gamma = match cfg.gamma {
            Some(v) => Hyperparameter::from_value("Bop.gamma", &v, custom)?,
            None => DEFAULT_GAMMA.into(),
        };
        Ok(Self::new(threshold, gamma).with_name(cfg.name))
    }

    fn apply_dense(&mut self, grad: &Tensor, var: &Variable, gamma: f64, threshold: f64) -> Result<()> {
        let value = var.as_tensor().detach();
        let grad = grad.to_dtype(value.dtype())?.detach();

        let m = match self.momentum.entry(var.name().to_string()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(Var::from_tensor(&value.zeros_like()?)?),
        };

        let m_t = (m.as_tensor().affine(1.0 - gamma, 0.0)? + grad.affine(gamma, 0.0)?)?;
        m.set(&m_t)?;

        let flip = value.mul(&m_t)?.affine(1.0, -threshold)?.sign()?;
        let next = sign(&flip.neg()?.mul(&value)?)?;
        var.set(&next)?;
        Ok(())
    }
}

impl Optimizer for Bop {
    fn name(&self) -> &str {
        &self.name
    }

    fn class_name(&self) -> &'static str {
        "Bop"
    }

    fn iterations(&self) -> usize {
        self.iterations
    }

    fn check_gradients(&self, grads_and_vars: &[(Gradient, Variable)]) -> Result<()> {
        match grads_and_vars.iter().find(|(g, _)| g.is_sparse()) {
            Some((_, var)) => Err(OptimError::NotImplemented(format!(
                "sparse gradient update for `{}` in Bop",
                var.name()
            ))),
            None => Ok(()),
        }
    }

    fn apply_gradients(&mut self, grads_and_vars: &[(Gradient, Variable)]) -> Result<StepReport> {
        // Reject the whole batch before touching any variable or slot.
        self.check_gradients(grads_and_vars)?;

        let gamma = self.gamma.value_at(self.iterations);
        let threshold = self.threshold.value_at(self.iterations);

        for (grad, var) in grads_and_vars {
            if let Gradient::Dense(g) = grad {
                self.apply_dense(g, var, gamma, threshold)?;
            }
        }
        self.iterations += 1;
        Ok(StepReport::updated(grads_and_vars.len()))
    }

    fn get_config(&self) -> Value {
        json!({
            "name": self.name,
            "threshold": self.threshold.to_value(),
            "gamma": self.gamma.to_value(),
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
