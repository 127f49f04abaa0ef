//! Named trainable variables.
//!
//! `candle_core::Var` carries no name of its own; the name lives in the
//! `VarMap` that created it. Optimizers need both (slots and routing are keyed
//! by name, updates go through the `Var`), so [`Variable`] pairs them.

use std::fmt;

use candle_core::{Result, Tensor, Var};
use candle_nn::VarMap;

/// A trainable variable: stable name + in-place mutable value.
///
/// Cloning is cheap; the underlying storage is shared, so an update through
/// any clone is visible through all of them.
#[derive(Clone)]
pub struct Variable {
    name: String,
    var: Var,
}

impl Variable {
    pub fn new(name: impl Into<String>, var: Var) -> Self {
        Self {
            name: name.into(),
            var,
        }
    }

    /// Wrap a freshly created variable holding a copy of `value`.
    pub fn from_tensor(name: impl Into<String>, value: &Tensor) -> Result<Self> {
        Ok(Self::new(name, Var::from_tensor(value)?))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_tensor(&self) -> &Tensor {
        self.var.as_tensor()
    }

    /// Replace the value in place. Shape and dtype must match.
    pub fn set(&self, value: &Tensor) -> Result<()> {
        self.var.set(value)
    }

    /// All variables of a `VarMap`, sorted by name.
    pub fn from_varmap(varmap: &VarMap) -> Vec<Self> {
        let data = match varmap.data().lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut vars: Vec<Self> = data
            .iter()
            .map(|(name, var)| Self::new(name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.name.cmp(&b.name));
        vars
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable")
            .field("name", &self.name)
            .field("shape", self.var.shape())
            .field("dtype", &self.var.dtype())
            .finish()
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.name, self.var.dims())
    }
}
