//! # lowbit-optim — Optimizers for Binarized Networks
//!
//! Training a BNN means optimizing a mix of ±1 kernels and full-precision
//! parameters. This crate provides the pieces to do both in one step:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`optimizer`] | [`Optimizer`] trait, [`Gradient`], [`StepReport`], [`TaggedConfig`] |
//! | [`bop`] | [`Bop`], the latent-free sign-flip optimizer |
//! | [`case`] | [`CaseOptimizer`], per-variable routing across delegates |
//! | [`adam`] / [`sgd`] | full-precision delegates |
//! | [`schedule`] | [`Hyperparameter`] and step-indexed [`Schedule`]s |
//! | [`registry`] | class-name → factory lookup for config import |
//!
//! Every optimizer round-trips through `get_config` / `from_config`; the
//! serialized form of a whole optimizer tree is a plain `serde_json::Value`.

pub mod adam;
pub mod bop;
pub mod case;
pub mod error;
pub mod optimizer;
pub mod registry;
pub mod schedule;
pub mod sgd;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use adam::Adam;
pub use bop::Bop;
pub use case::{CaseOptimizer, CaseOptimizerBuilder, Predicate};
pub use error::{OptimError, Result};
pub use optimizer::{Gradient, Optimizer, StepReport, TaggedConfig};
pub use registry::{deserialize_optimizer, deserialize_schedule, Registry};
pub use schedule::{
    Decay, ExponentialDecay, Hyperparameter, InverseTimeDecay, PolynomialDecay, Schedule,
    WarmupDecay,
};
pub use sgd::Sgd;
