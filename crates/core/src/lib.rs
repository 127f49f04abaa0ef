//! # lowbit-core — Variables and Binarization Primitives
//!
//! The narrow surface every optimizer in the workspace is written against:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`variable`] | [`Variable`]: a named, mutable, gradient-bearing `candle` var |
//! | [`quantize`] | binary `sign`, straight-through `ste_sign`, ±1 distribution helpers |
//!
//! ## Conventions
//!
//! 1. **Names are identity.** Routing and optimizer slots are keyed by
//!    [`Variable::name`], never by tensor value.
//! 2. **`sign(0) = +1`.** Binary tensors live in {-1, +1}; zero is mapped to
//!    the positive side so binarization never produces a third value.

pub mod quantize;
pub mod variable;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use quantize::{binary_distribution, is_binary, sign, ste_sign};
pub use variable::Variable;
