//! # lowbit-train — Training Plumbing
//!
//! Everything between a loss tensor and an optimizer step:
//!
//! * **[`Trainer`]**: backward, optional gradient clipping, gradient /
//!   variable pairing, and one [`Optimizer::apply_gradients`] call per step.
//! * **[`SmallBnn`]**: a two-layer binarized classifier whose kernels follow
//!   the `quant_*.kernel` naming that [`Bop`] routes on.
//! * **[`synthetic_classification`]**: seeded clustered data for demos and tests.
//!
//! [`Optimizer::apply_gradients`]: lowbit_optim::Optimizer::apply_gradients
//! [`Bop`]: lowbit_optim::Bop

pub mod data;
pub mod model;
pub mod trainer;

pub use data::{batch_to_tensors, synthetic_classification, Dataset};
pub use model::{accuracy, binarize_kernels, bnn_optimizer, SmallBnn};
pub use trainer::{
    clip_grad_norm, grad_norm, grads_and_vars, load_optimizer, save_optimizer_config,
    StepMetrics, Trainer, TrainerConfig,
};
