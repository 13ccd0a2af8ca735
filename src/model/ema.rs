use candle_core::{Tensor, Var};
use std::collections::HashMap;

use crate::error::{KtError, Result};

/// Exponential moving average of named tensors.
///
/// The tracker holds only shadow copies; callers write the smoothed value back
/// into their own parameters. `shadow = (1 - mu) * x + mu * shadow`.
pub struct EmaTracker {
    mu: f64,
    shadow: HashMap<String, Tensor>,
}

impl EmaTracker {
    pub fn new(mu: f64) -> Self {
        Self {
            mu,
            shadow: HashMap::new(),
        }
    }

    /// Store a detached copy of `value` as the initial shadow for `name`.
    pub fn register(&mut self, name: &str, value: &Tensor) -> Result<()> {
        if self.shadow.contains_key(name) {
            return Err(KtError::DuplicateRegistration(name.to_string()));
        }
        // own storage: the source may be a Var that is overwritten in place later
        let snapshot = value.detach().copy()?;
        self.shadow.insert(name.to_string(), snapshot);
        Ok(())
    }

    /// Blend `value` into the shadow of `name` and return the new shadow.
    pub fn update(&mut self, name: &str, value: &Tensor) -> Result<Tensor> {
        let shadow = self
            .shadow
            .get_mut(name)
            .ok_or_else(|| KtError::UnregisteredName(name.to_string()))?;
        let blended = (value.detach().affine(1.0 - self.mu, 0.0)? + shadow.affine(self.mu, 0.0)?)?;
        *shadow = blended.clone();
        Ok(blended)
    }

    /// Read-modify-write: every variable becomes the EMA of its current value.
    pub fn apply(&mut self, vars: &[(String, Var)]) -> Result<()> {
        for (name, var) in vars {
            let smoothed = self.update(name, var.as_tensor())?;
            var.set(&smoothed)?;
        }
        Ok(())
    }
}
