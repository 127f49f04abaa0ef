//! Step-indexed hyperparameter schedules.
//!
//! A [`Hyperparameter`] is either a constant or a [`Schedule`] evaluated at the
//! optimizer's current iteration. Constants serialize as bare numbers,
//! schedules as `{class_name, config}`; import tells them apart by shape.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{OptimError, Result};
use crate::optimizer::{parse_config, TaggedConfig};
use crate::registry::{deserialize_schedule, Registry};

// ── Schedule trait ──────────────────────────────────────────────────────────

pub trait Schedule: Send + Sync + fmt::Debug {
    /// Value at optimizer iteration `step` (0-based).
    fn value(&self, step: usize) -> f64;

    fn class_name(&self) -> &'static str;

    fn get_config(&self) -> Value;

    fn serialize(&self) -> TaggedConfig {
        TaggedConfig::new(self.class_name(), self.get_config())
    }
}

// ── Hyperparameter ──────────────────────────────────────────────────────────

/// A constant or a schedule.
#[derive(Debug)]
pub enum Hyperparameter {
    Constant(f64),
    Schedule(Box<dyn Schedule>),
}

impl Hyperparameter {
    pub fn schedule(s: impl Schedule + 'static) -> Self {
        Self::Schedule(Box::new(s))
    }

    pub fn value_at(&self, step: usize) -> f64 {
        match self {
            Self::Constant(v) => *v,
            Self::Schedule(s) => s.value(step),
        }
    }

    pub fn is_schedule(&self) -> bool {
        matches!(self, Self::Schedule(_))
    }

    /// Class name of the schedule, `None` for constants.
    pub fn schedule_class(&self) -> Option<&'static str> {
        match self {
            Self::Constant(_) => None,
            Self::Schedule(s) => Some(s.class_name()),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            // JSON has no infinities; spell them the way `f64` prints them.
            Self::Constant(v) if !v.is_finite() => Value::String(v.to_string()),
            Self::Constant(v) => json!(v),
            Self::Schedule(s) => s.serialize().to_value(),
        }
    }

    /// Inverse of [`Hyperparameter::to_value`]; `position` names the field in errors.
    pub fn from_value(position: &str, value: &Value, custom: Option<&Registry>) -> Result<Self> {
        match value {
            Value::Number(n) => n.as_f64().map(Self::Constant).ok_or_else(|| {
                OptimError::invalid(position, "a finite number", n.to_string())
            }),
            Value::String(s) => s
                .parse::<f64>()
                .ok()
                .filter(|v| !v.is_finite())
                .map(Self::Constant)
                .ok_or_else(|| {
                    OptimError::invalid(position, "a number, `inf`, `-inf` or `NaN`", s.clone())
                }),
            Value::Object(_) => {
                let tagged = TaggedConfig::from_value(position, value)?;
                Ok(Self::Schedule(deserialize_schedule(&tagged, custom)?))
            }
            other => Err(OptimError::invalid(
                position,
                "a number or a `{class_name, config}` schedule",
                other.to_string(),
            )),
        }
    }
}

impl From<f64> for Hyperparameter {
    fn from(v: f64) -> Self {
        Self::Constant(v)
    }
}

impl From<Box<dyn Schedule>> for Hyperparameter {
    fn from(s: Box<dyn Schedule>) -> Self {
        Self::Schedule(s)
    }
}

// ── InverseTimeDecay ────────────────────────────────────────────────────────

/// `initial_value / (1 + decay_rate * step / decay_steps)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InverseTimeDecay {
    pub initial_value: f64,
    pub decay_steps: f64,
    pub decay_rate: f64,
    #[serde(default)]
    pub staircase: bool,
    #[serde(default)]
    pub name: Option<String>,
}

impl InverseTimeDecay {
    pub fn new(initial_value: f64, decay_steps: f64, decay_rate: f64) -> Self {
        Self {
            initial_value,
            decay_steps,
            decay_rate,
            staircase: false,
            name: None,
        }
    }

    pub fn from_config(config: &Value) -> Result<Self> {
        parse_config("InverseTimeDecay", config)
    }
}

impl Schedule for InverseTimeDecay {
    fn value(&self, step: usize) -> f64 {
        let mut t = step as f64 / self.decay_steps;
        if self.staircase {
            t = t.floor();
        }
        self.initial_value / (1.0 + self.decay_rate * t)
    }

    fn class_name(&self) -> &'static str {
        "InverseTimeDecay"
    }

    fn get_config(&self) -> Value {
        json!({
            "initial_value": self.initial_value,
            "decay_steps": self.decay_steps,
            "decay_rate": self.decay_rate,
            "staircase": self.staircase,
            "name": self.name,
        })
    }
}

// ── ExponentialDecay ────────────────────────────────────────────────────────

/// `initial_value * decay_rate ^ (step / decay_steps)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExponentialDecay {
    pub initial_value: f64,
    pub decay_steps: f64,
    pub decay_rate: f64,
    #[serde(default)]
    pub staircase: bool,
    #[serde(default)]
    pub name: Option<String>,
}

impl ExponentialDecay {
    pub fn new(initial_value: f64, decay_steps: f64, decay_rate: f64) -> Self {
        Self {
            initial_value,
            decay_steps,
            decay_rate,
            staircase: false,
            name: None,
        }
    }

    pub fn from_config(config: &Value) -> Result<Self> {
        parse_config("ExponentialDecay", config)
    }
}

impl Schedule for ExponentialDecay {
    fn value(&self, step: usize) -> f64 {
        let mut t = step as f64 / self.decay_steps;
        if self.staircase {
            t = t.floor();
        }
        self.initial_value * self.decay_rate.powf(t)
    }

    fn class_name(&self) -> &'static str {
        "ExponentialDecay"
    }

    fn get_config(&self) -> Value {
        json!({
            "initial_value": self.initial_value,
            "decay_steps": self.decay_steps,
            "decay_rate": self.decay_rate,
            "staircase": self.staircase,
            "name": self.name,
        })
    }
}

// ── PolynomialDecay ─────────────────────────────────────────────────────────

/// Polynomial interpolation from `initial_value` to `end_value` over
/// `decay_steps`; holds `end_value` afterwards unless `cycle` restarts it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolynomialDecay {
    pub initial_value: f64,
    pub decay_steps: f64,
    #[serde(default = "default_end_value")]
    pub end_value: f64,
    #[serde(default = "default_power")]
    pub power: f64,
    #[serde(default)]
    pub cycle: bool,
    #[serde(default)]
    pub name: Option<String>,
}

fn default_end_value() -> f64 {
    1e-4
}
fn default_power() -> f64 {
    1.0
}

impl PolynomialDecay {
    pub fn new(initial_value: f64, decay_steps: f64) -> Self {
        Self {
            initial_value,
            decay_steps,
            end_value: default_end_value(),
            power: default_power(),
            cycle: false,
            name: None,
        }
    }

    pub fn from_config(config: &Value) -> Result<Self> {
        parse_config("PolynomialDecay", config)
    }
}

impl Schedule for PolynomialDecay {
    fn value(&self, step: usize) -> f64 {
        let mut step = step as f64;
        let mut decay_steps = self.decay_steps;
        if self.cycle {
            // Step 0 still belongs to the first cycle.
            let multiplier = if step == 0.0 {
                1.0
            } else {
                (step / decay_steps).ceil()
            };
            decay_steps *= multiplier;
        } else {
            step = step.min(decay_steps);
        }
        let p = step / decay_steps;
        (self.initial_value - self.end_value) * (1.0 - p).powf(self.power) + self.end_value
    }

    fn class_name(&self) -> &'static str {
        "PolynomialDecay"
    }

    fn get_config(&self) -> Value {
        json!({
            "initial_value": self.initial_value,
            "decay_steps": self.decay_steps,
            "end_value": self.end_value,
            "power": self.power,
            "cycle": self.cycle,
            "name": self.name,
        })
    }
}

// ── WarmupDecay ─────────────────────────────────────────────────────────────

/// Decay mode after warmup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decay {
    Cosine,
    Linear,
    None,
}

/// Linear warmup to `peak_value`, then cosine / linear / constant decay
/// towards `min_value` at `total_steps`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WarmupDecay {
    pub peak_value: f64,
    #[serde(default)]
    pub min_value: f64,
    #[serde(default)]
    pub warmup_steps: usize,
    pub total_steps: usize,
    #[serde(default = "default_decay")]
    pub decay: Decay,
}

fn default_decay() -> Decay {
    Decay::Cosine
}

impl WarmupDecay {
    pub fn new(
        peak_value: f64,
        min_value: f64,
        warmup_steps: usize,
        total_steps: usize,
        decay: Decay,
    ) -> Self {
        Self {
            peak_value,
            min_value,
            warmup_steps,
            total_steps,
            decay,
        }
    }

    pub fn from_config(config: &Value) -> Result<Self> {
        parse_config("WarmupDecay", config)
    }
}

impl Schedule for WarmupDecay {
    fn value(&self, step: usize) -> f64 {
        // Warmup phase: linear ramp from 0 to peak.
        if self.warmup_steps > 0 && step < self.warmup_steps {
            return self.peak_value * (step as f64 + 1.0) / self.warmup_steps as f64;
        }

        if self.total_steps == 0 || self.decay == Decay::None {
            return self.peak_value;
        }

        let step = step.min(self.total_steps);
        if step <= self.warmup_steps {
            return self.peak_value;
        }

        let decay_steps = (self.total_steps - self.warmup_steps).max(1);
        let progress = (step - self.warmup_steps) as f64 / decay_steps as f64;

        match self.decay {
            Decay::Cosine => {
                let cos = (std::f64::consts::PI * progress).cos();
                self.min_value + 0.5 * (self.peak_value - self.min_value) * (1.0 + cos)
            }
            Decay::Linear => self.peak_value - (self.peak_value - self.min_value) * progress,
            Decay::None => self.peak_value,
        }
    }

    fn class_name(&self) -> &'static str {
        "WarmupDecay"
    }

    fn get_config(&self) -> Value {
        json!({
            "peak_value": self.peak_value,
            "min_value": self.min_value,
            "warmup_steps": self.warmup_steps,
            "total_steps": self.total_steps,
            "decay": self.decay,
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverse_time_decay() {
        let s = InverseTimeDecay::new(3.0, 1.0, 0.5);
        assert!((s.value(0) - 3.0).abs() < 1e-12);
        // 3 / (1 + 0.5 * 2) = 1.5
        assert!((s.value(2) - 1.5).abs() < 1e-12);
    }

    #[test]
    fn inverse_time_staircase() {
        let mut s = InverseTimeDecay::new(1.0, 10.0, 1.0);
        s.staircase = true;
        assert_eq!(s.value(9), 1.0);
        assert_eq!(s.value(10), 0.5);
    }

    #[test]
    fn exponential_decay() {
        let s = ExponentialDecay::new(1.0, 10.0, 0.5);
        assert!((s.value(10) - 0.5).abs() < 1e-12);
        assert!((s.value(20) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn polynomial_decay_holds_end_value() {
        let s = PolynomialDecay::new(5e-4, 100.0);
        assert!((s.value(0) - 5e-4).abs() < 1e-15);
        // Halfway with power 1: midpoint between initial and end.
        assert!((s.value(50) - (5e-4 + 1e-4) / 2.0).abs() < 1e-12);
        assert!((s.value(100) - 1e-4).abs() < 1e-15);
        assert!((s.value(1000) - 1e-4).abs() < 1e-15);
    }

    #[test]
    fn polynomial_decay_cycles() {
        let mut s = PolynomialDecay::new(1.0, 10.0);
        s.end_value = 0.0;
        s.cycle = true;
        // Step 15 is in the second cycle: decay_steps = 20, p = 0.75.
        assert!((s.value(15) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn warmup_ramp() {
        let s = WarmupDecay::new(1e-3, 1e-6, 100, 1000, Decay::Cosine);
        // Step 0: (0+1)/100 * 1e-3 = 1e-5
        assert!((s.value(0) - 1e-5).abs() < 1e-9);
    }

    #[test]
    fn warmup_cosine_midpoint() {
        let s = WarmupDecay::new(1e-3, 0.0, 0, 1000, Decay::Cosine);
        // cos(π·0.5) = 0 → half the peak
        assert!((s.value(500) - 5e-4).abs() < 1e-6);
    }

    #[test]
    fn warmup_no_decay() {
        let s = WarmupDecay::new(1e-3, 1e-6, 0, 1000, Decay::None);
        assert!((s.value(500) - 1e-3).abs() < 1e-9);
    }

    #[test]
    fn hyperparameter_constant_round_trip() {
        let h = Hyperparameter::from(5e-4);
        let v = h.to_value();
        assert_eq!(v, json!(5e-4));
        let back = Hyperparameter::from_value("gamma", &v, None).unwrap();
        assert!(!back.is_schedule());
        assert_eq!(back.value_at(123), 5e-4);
    }

    #[test]
    fn hyperparameter_schedule_round_trip() {
        let h = Hyperparameter::schedule(PolynomialDecay::new(5e-4, 100.0));
        let v = h.to_value();
        assert_eq!(v["class_name"], "PolynomialDecay");
        let back = Hyperparameter::from_value("gamma", &v, None).unwrap();
        assert_eq!(back.schedule_class(), Some("PolynomialDecay"));
        assert_eq!(back.to_value(), v);
        assert_eq!(back.value_at(50), h.value_at(50));
    }

    #[test]
    fn hyperparameter_rejects_strings() {
        let err = Hyperparameter::from_value("threshold", &json!("big"), None).unwrap_err();
        assert!(matches!(err, OptimError::InvalidArgument { .. }));
        // Finite values must stay numbers.
        assert!(Hyperparameter::from_value("threshold", &json!("0.5"), None).is_err());
    }

    #[test]
    fn non_finite_constants_round_trip() {
        for x in [f64::INFINITY, f64::NEG_INFINITY] {
            let v = Hyperparameter::from(x).to_value();
            assert!(v.is_string());
            let back = Hyperparameter::from_value("threshold", &v, None).unwrap();
            assert_eq!(back.value_at(0), x);
            assert_eq!(back.to_value(), v);
        }
        let v = Hyperparameter::from(f64::NAN).to_value();
        assert_eq!(v, json!("NaN"));
        assert!(Hyperparameter::from_value("gamma", &v, None).unwrap().value_at(0).is_nan());
    }
}
