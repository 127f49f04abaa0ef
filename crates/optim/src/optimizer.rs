//! The optimizer capability: apply (gradient, variable) pairs, export config.
//!
//! Unlike `candle_nn::Optimizer`, which owns a fixed `Vec<Var>` from
//! construction, an [`Optimizer`] here receives its variables with every call.
//! That is what lets a router hand each delegate a different subset, and lets
//! delegates create their per-variable state lazily.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use lowbit_core::Variable;

use crate::error::{OptimError, Result};

// ── Gradient ────────────────────────────────────────────────────────────────

/// Gradient for one variable.
#[derive(Debug, Clone)]
pub enum Gradient {
    Dense(Tensor),
    /// Row slices along dim 0: `values[i]` is the gradient of row `indices[i]`.
    Sparse { indices: Tensor, values: Tensor },
}

impl Gradient {
    pub fn is_sparse(&self) -> bool {
        matches!(self, Self::Sparse { .. })
    }

    /// Materialize as a dense tensor shaped like `like`.
    ///
    /// Repeated sparse indices accumulate.
    pub fn to_dense(&self, like: &Tensor) -> Result<Tensor> {
        match self {
            Self::Dense(g) => Ok(g.clone()),
            Self::Sparse { indices, values } => {
                let values = values.to_dtype(like.dtype())?;
                Ok(like.zeros_like()?.index_add(indices, &values, 0)?)
            }
        }
    }
}

impl From<Tensor> for Gradient {
    fn from(t: Tensor) -> Self {
        Self::Dense(t)
    }
}

// ── Completion signal ───────────────────────────────────────────────────────

/// Outcome of one `apply_gradients` call.
///
/// Returned only after every update of the call has been written, so holding
/// a `StepReport` means all variables it counts are already updated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepReport {
    /// Variables whose value was written.
    pub updated: usize,
    /// Pairs dropped without an update (unrouted variables).
    pub skipped: usize,
}

impl StepReport {
    pub fn updated(n: usize) -> Self {
        Self {
            updated: n,
            skipped: 0,
        }
    }

    pub fn merge(self, other: Self) -> Self {
        Self {
            updated: self.updated + other.updated,
            skipped: self.skipped + other.skipped,
        }
    }
}

// ── Serialized form ─────────────────────────────────────────────────────────

/// `{class_name, config}`: how optimizers and schedules are serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaggedConfig {
    pub class_name: String,
    pub config: Value,
}

impl TaggedConfig {
    pub fn new(class_name: impl Into<String>, config: Value) -> Self {
        Self {
            class_name: class_name.into(),
            config,
        }
    }

    /// Parse a `{class_name, config}` object; errors name `position`.
    pub fn from_value(position: &str, value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone()).map_err(|e| {
            OptimError::invalid(position, "a `{class_name, config}` object", e.to_string())
        })
    }

    pub fn to_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("class_name".into(), Value::String(self.class_name.clone()));
        map.insert("config".into(), self.config.clone());
        Value::Object(map)
    }
}

// ── Optimizer ───────────────────────────────────────────────────────────────

/// A stateful update rule over named variables.
///
/// Implementations advance [`Optimizer::iterations`] exactly once per
/// `apply_gradients` call, including calls with an empty slice.
pub trait Optimizer: Send {
    /// Instance name (part of the config).
    fn name(&self) -> &str;

    /// Registry tag used to rebuild this optimizer from its config.
    fn class_name(&self) -> &'static str;

    /// Number of completed `apply_gradients` calls.
    fn iterations(&self) -> usize;

    fn apply_gradients(&mut self, grads_and_vars: &[(Gradient, Variable)]) -> Result<StepReport>;

    /// Fail if `apply_gradients` would reject this batch. Must not touch any
    /// variable or slot; a router runs it on every bucket before any write.
    fn check_gradients(&self, _grads_and_vars: &[(Gradient, Variable)]) -> Result<()> {
        Ok(())
    }

    /// Flat mapping of serializable hyperparameters.
    fn get_config(&self) -> Value;

    fn serialize(&self) -> TaggedConfig {
        TaggedConfig::new(self.class_name(), self.get_config())
    }
}

impl std::fmt::Debug for dyn Optimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(self.class_name())
            .field("name", &self.name())
            .field("iterations", &self.iterations())
            .finish()
    }
}

// ── Config helpers ──────────────────────────────────────────────────────────

/// Deserialize a typed config struct, reporting failures against `class_name`.
pub(crate) fn parse_config<T: serde::de::DeserializeOwned>(
    class_name: &str,
    config: &Value,
) -> Result<T> {
    serde_json::from_value(config.clone()).map_err(|e| {
        OptimError::invalid(
            format!("{class_name}.config"),
            format!("a valid `{class_name}` config"),
            e.to_string(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn sparse_to_dense_accumulates() {
        let dev = Device::Cpu;
        let like = Tensor::zeros((3, 2), candle_core::DType::F32, &dev).unwrap();
        let grad = Gradient::Sparse {
            indices: Tensor::new(&[2u32, 0, 2], &dev).unwrap(),
            values: Tensor::new(&[[1f32, 1.0], [2.0, 3.0], [0.5, 0.5]], &dev).unwrap(),
        };
        let dense: Vec<Vec<f32>> = grad.to_dense(&like).unwrap().to_vec2().unwrap();
        assert_eq!(dense, vec![vec![2.0, 3.0], vec![0.0, 0.0], vec![1.5, 1.5]]);
    }

    #[test]
    fn tagged_config_rejects_missing_class() {
        let err = TaggedConfig::from_value("optimizer_configs[0]", &serde_json::json!({"config": {}}))
            .unwrap_err();
        match err {
            OptimError::InvalidArgument { position, .. } => {
                assert_eq!(position, "optimizer_configs[0]")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn report_merge() {
        let a = StepReport::updated(2);
        let b = StepReport {
            updated: 1,
            skipped: 3,
        };
        assert_eq!(a.merge(b), StepReport { updated: 3, skipped: 3 });
    }
}
