//! CaseOptimizer: routes each variable to exactly one delegate optimizer.
//!
//! Binarized networks mix ±1 kernels with full-precision parameters (batch
//! norm, first/last layers). A `CaseOptimizer` holds `(predicate, optimizer)`
//! pairs plus an optional default and trains each variable with the single
//! optimizer whose predicate claims it:
//!
//! ```no_run
//! use lowbit_optim::{Adam, Bop, CaseOptimizer};
//!
//! let optimizer = CaseOptimizer::builder()
//!     .case(Bop::is_binary_variable, Bop::new(1e-6, 1e-3))
//!     .default_optimizer(Adam::new(0.01))
//!     .build();
//! ```
//!
//! # Routing table
//!
//! Predicates run on the first `apply_gradients` call, and the table is
//! installed only once every delegate has accepted its bucket. The result
//! (variable name → delegate index, default at index `pairs.len()`) is frozen
//! for the optimizer's lifetime and is what gets serialized; predicates are
//! never serialized and restored instances carry always-false placeholders.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value};

use lowbit_core::Variable;

use crate::error::{OptimError, Result};
use crate::optimizer::{parse_config, Gradient, Optimizer, StepReport, TaggedConfig};
use crate::registry::{deserialize_optimizer, Registry};

/// Decides whether its paired optimizer trains a variable. Must depend only
/// on the variable's identity, not its value.
pub type Predicate = Box<dyn Fn(&Variable) -> bool + Send + Sync>;

pub const DEFAULT_NAME: &str = "optimizer_case";

/// Routing table plus the variables it leaves untrained.
type Routing = (BTreeMap<String, usize>, Vec<String>);
/// One `(gradient, variable)` list per delegate, default last.
type Buckets = Vec<Vec<(Gradient, Variable)>>;

pub struct CaseOptimizer {
    name: String,
    predicates: Vec<Predicate>,
    /// Explicit delegates in pair order, then the default (if any).
    optimizers: Vec<Box<dyn Optimizer>>,
    has_default: bool,
    var_opt_mapping: Option<BTreeMap<String, usize>>,
    unclaimed: Vec<String>,
    iterations: usize,
}

// ── Builder ─────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct CaseOptimizerBuilder {
    name: Option<String>,
    pairs: Vec<(Predicate, Box<dyn Optimizer>)>,
    default: Option<Box<dyn Optimizer>>,
}

impl CaseOptimizerBuilder {
    /// Append a `(predicate, optimizer)` pair. Order fixes the delegate index.
    pub fn case<P, O>(mut self, predicate: P, optimizer: O) -> Self
    where
        P: Fn(&Variable) -> bool + Send + Sync + 'static,
        O: Optimizer + 'static,
    {
        self.pairs.push((Box::new(predicate), Box::new(optimizer)));
        self
    }

    /// Optimizer for every variable no predicate claims.
    pub fn default_optimizer<O: Optimizer + 'static>(mut self, optimizer: O) -> Self {
        self.default = Some(Box::new(optimizer));
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn build(self) -> CaseOptimizer {
        let mut optimizer = CaseOptimizer::new(self.pairs, self.default);
        if let Some(name) = self.name {
            optimizer.name = name;
        }
        optimizer
    }
}

// ── CaseOptimizer ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CaseOptimizerConfig {
    #[serde(default = "default_name")]
    name: String,
    #[serde(default)]
    optimizer_configs: Vec<Value>,
    #[serde(default)]
    default_config: Option<Value>,
    #[serde(default)]
    var_opt_mapping: Option<BTreeMap<String, usize>>,
}

fn default_name() -> String {
    DEFAULT_NAME.to_string()
}

impl CaseOptimizer {
    pub fn builder() -> CaseOptimizerBuilder {
        CaseOptimizerBuilder::default()
    }

    pub fn new(
        pairs: Vec<(Predicate, Box<dyn Optimizer>)>,
        default_optimizer: Option<Box<dyn Optimizer>>,
    ) -> Self {
        let (predicates, mut optimizers): (Vec<_>, Vec<_>) = pairs.into_iter().unzip();
        let has_default = default_optimizer.is_some();
        optimizers.extend(default_optimizer);
        Self {
            name: default_name(),
            predicates,
            optimizers,
            has_default,
            var_opt_mapping: None,
            unclaimed: Vec::new(),
            iterations: 0,
        }
    }

    /// Index of the default optimizer, equal to the number of explicit pairs.
    pub fn default_index(&self) -> Option<usize> {
        self.has_default.then_some(self.predicates.len())
    }

    /// Explicit delegates followed by the default.
    pub fn optimizers(&self) -> &[Box<dyn Optimizer>] {
        &self.optimizers
    }

    /// `None` until the first `apply_gradients` call (or a config import).
    pub fn var_opt_mapping(&self) -> Option<&BTreeMap<String, usize>> {
        self.var_opt_mapping.as_ref()
    }

    /// Variables seen while building the routing table that no optimizer
    /// trains. They stay untrained for the optimizer's lifetime.
    pub fn unclaimed_variables(&self) -> &[String] {
        &self.unclaimed
    }

    /// Rebuild from [`Optimizer::get_config`] output.
    ///
    /// Delegates are reconstructed through the registry, predicates become
    /// always-false placeholders, and the stored routing table is installed
    /// as is.
    pub fn from_config(config: &Value, custom: Option<&Registry>) -> Result<Self> {
        let cfg: CaseOptimizerConfig = parse_config("CaseOptimizer", config)?;

        let mut pairs: Vec<(Predicate, Box<dyn Optimizer>)> =
            Vec::with_capacity(cfg.optimizer_configs.len());
        for (i, value) in cfg.optimizer_configs.iter().enumerate() {
            let position = format!("optimizer_configs[{i}]");
            let optimizer = delegate_from_value(&position, value, custom)?;
            pairs.push((Box::new(|_: &Variable| false), optimizer));
        }

        let default = match cfg.default_config {
            None | Some(Value::Null) => None,
            Some(ref value) => Some(delegate_from_value("default_config", value, custom)?),
        };

        let mut optimizer = Self::new(pairs, default);
        optimizer.name = cfg.name;

        if cfg.var_opt_mapping.is_none() && !optimizer.predicates.is_empty() {
            tracing::warn!(
                name = %optimizer.name,
                "restored without a routing table; placeholder predicates claim nothing, \
                 so every variable will go to the default optimizer"
            );
        }
        if let Some(mapping) = cfg.var_opt_mapping {
            let n = optimizer.optimizers.len();
            if let Some((var, &index)) = mapping.iter().find(|&(_, &i)| i >= n) {
                return Err(OptimError::invalid(
                    format!("var_opt_mapping[{var:?}]"),
                    format!("a delegate index below {n}"),
                    index.to_string(),
                ));
            }
            optimizer.var_opt_mapping = Some(mapping);
        }
        Ok(optimizer)
    }

    /// Evaluate every predicate once per variable. Pure: the caller decides
    /// whether to install the result.
    fn build_mapping(&self, grads_and_vars: &[(Gradient, Variable)]) -> Result<Routing> {
        let mut mapping = BTreeMap::new();
        let mut unclaimed = Vec::new();

        for (_, var) in grads_and_vars {
            let claimants: Vec<usize> = self
                .predicates
                .iter()
                .enumerate()
                .filter(|(_, predicate)| predicate(var))
                .map(|(i, _)| i)
                .collect();

            let index = match (claimants.as_slice(), self.default_index()) {
                ([index], _) => Some(*index),
                ([], default) => default,
                _ => {
                    return Err(OptimError::ClaimConflict {
                        variable: var.name().to_string(),
                        claimants: claimants.clone(),
                    });
                }
            };

            match index {
                Some(index) => {
                    mapping.insert(var.name().to_string(), index);
                }
                None => unclaimed.push(var.name().to_string()),
            }
        }
        Ok((mapping, unclaimed))
    }

    /// Freeze a routing table built by [`Self::build_mapping`].
    fn install_mapping(&mut self, mapping: BTreeMap<String, usize>, unclaimed: Vec<String>) {
        for (variable, index) in &mapping {
            tracing::debug!(variable = %variable, index, "routed");
        }
        for variable in &unclaimed {
            tracing::warn!(
                variable = %variable,
                "no default optimizer provided to train variable; it will not be trained"
            );
        }
        self.var_opt_mapping = Some(mapping);
        self.unclaimed = unclaimed;
    }

    /// Split pairs into one bucket per delegate. Pairs without a route are
    /// counted, not bucketed.
    fn bucket(
        &self,
        mapping: Option<&BTreeMap<String, usize>>,
        grads_and_vars: &[(Gradient, Variable)],
    ) -> (Buckets, usize) {
        let mut buckets: Buckets = self.optimizers.iter().map(|_| Vec::new()).collect();
        let mut skipped = 0;
        for (grad, var) in grads_and_vars {
            match mapping
                .and_then(|m| m.get(var.name()))
                .and_then(|&i| buckets.get_mut(i))
            {
                Some(bucket) => bucket.push((grad.clone(), var.clone())),
                None => skipped += 1,
            }
        }
        (buckets, skipped)
    }

    /// Route `grads_and_vars` and let every delegate vet its bucket.
    fn plan(
        &self,
        grads_and_vars: &[(Gradient, Variable)],
    ) -> Result<(Option<Routing>, Buckets, usize)> {
        let built = match self.var_opt_mapping {
            Some(_) => None,
            None => Some(self.build_mapping(grads_and_vars)?),
        };
        let mapping = built
            .as_ref()
            .map(|(m, _)| m)
            .or(self.var_opt_mapping.as_ref());
        let (buckets, skipped) = self.bucket(mapping, grads_and_vars);
        for (optimizer, bucket) in self.optimizers.iter().zip(&buckets) {
            optimizer.check_gradients(bucket)?;
        }
        Ok((built, buckets, skipped))
    }
}

fn delegate_from_value(
    position: &str,
    value: &Value,
    custom: Option<&Registry>,
) -> Result<Box<dyn Optimizer>> {
    let tagged = TaggedConfig::from_value(position, value)?;
    deserialize_optimizer(&tagged, custom).map_err(|e| {
        OptimError::invalid(position, "a deserializable optimizer", e.to_string())
    })
}

impl Optimizer for CaseOptimizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn class_name(&self) -> &'static str {
        "CaseOptimizer"
    }

    fn iterations(&self) -> usize {
        self.iterations
    }

    fn check_gradients(&self, grads_and_vars: &[(Gradient, Variable)]) -> Result<()> {
        self.plan(grads_and_vars).map(|_| ())
    }

    fn apply_gradients(&mut self, grads_and_vars: &[(Gradient, Variable)]) -> Result<StepReport> {
        // Nothing is installed or written until every delegate accepted its bucket.
        let (built, buckets, skipped) = self.plan(grads_and_vars)?;
        if let Some((mapping, unclaimed)) = built {
            self.install_mapping(mapping, unclaimed);
        }

        // Every delegate runs, even on an empty bucket, so step-indexed
        // schedules stay in lockstep across delegates.
        let mut report = StepReport {
            updated: 0,
            skipped,
        };
        for (optimizer, bucket) in self.optimizers.iter_mut().zip(&buckets) {
            report = report.merge(optimizer.apply_gradients(bucket)?);
        }
        self.iterations += 1;
        Ok(report)
    }

    fn get_config(&self) -> Value {
        let explicit = &self.optimizers[..self.predicates.len()];

        let mut config = Map::new();
        config.insert("name".into(), Value::String(self.name.clone()));
        config.insert(
            "optimizer_configs".into(),
            Value::Array(explicit.iter().map(|o| o.serialize().to_value()).collect()),
        );
        if let Some(default) = self.default_index().and_then(|i| self.optimizers.get(i)) {
            config.insert("default_config".into(), default.serialize().to_value());
        }
        config.insert(
            "var_opt_mapping".into(),
            match &self.var_opt_mapping {
                Some(mapping) => Value::Object(
                    mapping
                        .iter()
                        .map(|(name, &index)| (name.clone(), Value::from(index)))
                        .collect(),
                ),
                None => Value::Null,
            },
        );
        Value::Object(config)
    }
}

impl std::fmt::Debug for CaseOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaseOptimizer")
            .field("name", &self.name)
            .field("optimizers", &self.optimizers)
            .field("default_index", &self.default_index())
            .field("var_opt_mapping", &self.var_opt_mapping)
            .finish()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
