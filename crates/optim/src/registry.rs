//! Factories keyed by class name, consulted only when importing configs.
//!
//! Built-in classes are always available. A [`Registry`] passed as
//! `custom_objects` adds user types and may shadow a built-in name.

use std::collections::HashMap;

use serde_json::Value;

use crate::adam::Adam;
use crate::bop::Bop;
use crate::case::CaseOptimizer;
use crate::error::{OptimError, Result};
use crate::optimizer::{Optimizer, TaggedConfig};
use crate::schedule::{ExponentialDecay, InverseTimeDecay, PolynomialDecay, Schedule, WarmupDecay};
use crate::sgd::Sgd;

/// Rebuilds an optimizer from its config. The registry is forwarded so
/// composite optimizers can resolve their delegates and schedules.
pub type OptimizerFactory = fn(&Value, Option<&Registry>) -> Result<Box<dyn Optimizer>>;

pub type ScheduleFactory = fn(&Value) -> Result<Box<dyn Schedule>>;

/// Custom optimizer and schedule constructors.
#[derive(Clone, Default)]
pub struct Registry {
    optimizers: HashMap<String, OptimizerFactory>,
    schedules: HashMap<String, ScheduleFactory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_optimizer(mut self, class_name: impl Into<String>, f: OptimizerFactory) -> Self {
        self.optimizers.insert(class_name.into(), f);
        self
    }

    pub fn with_schedule(mut self, class_name: impl Into<String>, f: ScheduleFactory) -> Self {
        self.schedules.insert(class_name.into(), f);
        self
    }

    fn optimizer(&self, class_name: &str) -> Option<OptimizerFactory> {
        self.optimizers.get(class_name).copied()
    }

    fn schedule(&self, class_name: &str) -> Option<ScheduleFactory> {
        self.schedules.get(class_name).copied()
    }
}

// ── Built-ins ───────────────────────────────────────────────────────────────

fn builtin_optimizer(class_name: &str) -> Option<OptimizerFactory> {
    let f: OptimizerFactory = match class_name {
        "Bop" => |c, r| Ok(Box::new(Bop::from_config(c, r)?)),
        "Adam" => |c, r| Ok(Box::new(Adam::from_config(c, r)?)),
        "SGD" => |c, r| Ok(Box::new(Sgd::from_config(c, r)?)),
        "CaseOptimizer" => |c, r| Ok(Box::new(CaseOptimizer::from_config(c, r)?)),
        _ => return None,
    };
    Some(f)
}

fn builtin_schedule(class_name: &str) -> Option<ScheduleFactory> {
    let f: ScheduleFactory = match class_name {
        "InverseTimeDecay" => |c| Ok(Box::new(InverseTimeDecay::from_config(c)?)),
        "ExponentialDecay" => |c| Ok(Box::new(ExponentialDecay::from_config(c)?)),
        "PolynomialDecay" => |c| Ok(Box::new(PolynomialDecay::from_config(c)?)),
        "WarmupDecay" => |c| Ok(Box::new(WarmupDecay::from_config(c)?)),
        _ => return None,
    };
    Some(f)
}

// ── Deserialization entry points ────────────────────────────────────────────

pub fn deserialize_optimizer(
    tagged: &TaggedConfig,
    custom_objects: Option<&Registry>,
) -> Result<Box<dyn Optimizer>> {
    let factory = custom_objects
        .and_then(|r| r.optimizer(&tagged.class_name))
        .or_else(|| builtin_optimizer(&tagged.class_name))
        .ok_or_else(|| OptimError::UnknownClass {
            kind: "optimizer",
            class_name: tagged.class_name.clone(),
        })?;
    factory(&tagged.config, custom_objects)
}

pub fn deserialize_schedule(
    tagged: &TaggedConfig,
    custom_objects: Option<&Registry>,
) -> Result<Box<dyn Schedule>> {
    let factory = custom_objects
        .and_then(|r| r.schedule(&tagged.class_name))
        .or_else(|| builtin_schedule(&tagged.class_name))
        .ok_or_else(|| OptimError::UnknownClass {
            kind: "schedule",
            class_name: tagged.class_name.clone(),
        })?;
    factory(&tagged.config)
}
