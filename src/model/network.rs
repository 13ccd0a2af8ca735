use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use std::collections::HashMap;
use std::path::Path;

use super::EmaTracker;

/// A module together with the parameter store it was built from.
///
/// A fixed network is rebuilt over detached constants, so backward never
/// produces gradients for it and it exposes no trainable variables.
pub struct Network<M> {
    varmap: VarMap,
    module: M,
    fixed: bool,
}

impl<M> Network<M> {
    /// Build a network with `ctor`, optionally loading safetensors weights.
    pub fn build<F>(device: &Device, weights: Option<&Path>, fixed: bool, ctor: F) -> Result<Self>
    where
        F: Fn(VarBuilder<'_>) -> Result<M>,
    {
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let module = ctor(vb)?;
        if let Some(path) = weights {
            varmap
                .load(path)
                .with_context(|| format!("load weights from {:?}", path))?;
        }
        if !fixed {
            return Ok(Self {
                varmap,
                module,
                fixed,
            });
        }
        let constants = detached_tensors(&varmap)?;
        let vb = VarBuilder::from_tensors(constants, DType::F32, device);
        let module = ctor(vb)?;
        Ok(Self {
            varmap,
            module,
            fixed,
        })
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    /// Trainable variables sorted by name; empty for a fixed network.
    pub fn trainable_vars(&self) -> Result<Vec<(String, Var)>> {
        if self.fixed {
            return Ok(Vec::new());
        }
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow!("parameter map lock poisoned"))?;
        let mut vars: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars)
    }

    /// EMA tracker with a shadow registered for every trainable variable.
    pub fn ema_tracker(&self, mu: f64) -> Result<EmaTracker> {
        let mut ema = EmaTracker::new(mu);
        for (name, var) in self.trainable_vars()? {
            ema.register(&name, var.as_tensor())?;
        }
        Ok(ema)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.varmap
            .save(path)
            .with_context(|| format!("save weights to {:?}", path))
    }
}

fn detached_tensors(varmap: &VarMap) -> Result<HashMap<String, Tensor>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow!("parameter map lock poisoned"))?;
    Ok(data
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().detach()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Classifier, TeacherEncoder};

    fn teacher(fixed: bool, weights: Option<&Path>) -> Result<Network<TeacherEncoder>> {
        Network::build(&Device::Cpu, weights, fixed, |vb| {
            TeacherEncoder::new(vb, 3, 32, 10)
        })
    }

    #[test]
    fn fixed_network_has_no_gradients() -> Result<()> {
        let net = teacher(true, None)?;
        assert!(net.trainable_vars()?.is_empty());
        let x = Var::from_tensor(&Tensor::randn(0f32, 1.0, (2, 3, 32, 32), &Device::Cpu)?)?;
        let loss = net.module().forward(x.as_tensor())?.sum_all()?;
        let grads = loss.backward()?;
        // gradient reaches the input but there is no parameter to receive one
        assert!(grads.get(x.as_tensor()).is_some());
        Ok(())
    }

    #[test]
    fn trainable_network_exposes_sorted_vars() -> Result<()> {
        let net = teacher(false, None)?;
        let vars = net.trainable_vars()?;
        assert_eq!(vars.len(), 10);
        let names: Vec<&str> = vars.iter().map(|(n, _)| n.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        Ok(())
    }

    #[test]
    fn save_then_load_round_trips_weights() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("teacher.safetensors");
        let a = teacher(false, None)?;
        a.save(&path)?;
        let b = teacher(true, Some(&path))?;
        let x = Tensor::randn(0f32, 1.0, (1, 3, 32, 32), &Device::Cpu)?;
        let ya = a.module().forward(&x)?;
        let yb = b.module().forward(&x)?;
        let diff = (ya - yb)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }
}
