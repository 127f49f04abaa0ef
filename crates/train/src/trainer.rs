//! Trainer: the bridge from a loss tensor to an optimizer step.
//!
//! The caller owns the model and computes the loss; [`Trainer::step`] runs
//! backward, optional gradient clipping, pairs each gradient with its
//! [`Variable`], and hands the batch to whatever [`Optimizer`] it was given.

use std::path::{Path, PathBuf};

use candle_core::{backprop::GradStore, Tensor};

use lowbit_core::Variable;
use lowbit_optim::{deserialize_optimizer, Gradient, Optimizer, Registry, StepReport, TaggedConfig};

// ── Config ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TrainerConfig {
    /// Global L2 clip; `0.0` disables clipping.
    pub grad_clip_max_norm: f64,
    pub log_every: usize,
    /// Compute the gradient norm every N steps (0 = never, unless clipping).
    pub debug_every: usize,
    pub output_dir: PathBuf,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            grad_clip_max_norm: 0.0,
            log_every: 10,
            debug_every: 0,
            output_dir: PathBuf::from("checkpoints"),
        }
    }
}

/// Metrics returned after each training step.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    pub step: usize,
    pub loss: f32,
    pub grad_norm: Option<f64>,
    pub report: StepReport,
}

// ── Trainer ─────────────────────────────────────────────────────────────────

pub struct Trainer {
    vars: Vec<Variable>,
    optimizer: Box<dyn Optimizer>,
    pub config: TrainerConfig,
    pub global_step: usize,
}

impl Trainer {
    pub fn new(vars: Vec<Variable>, optimizer: Box<dyn Optimizer>, config: TrainerConfig) -> Self {
        tracing::info!(
            variables = vars.len(),
            optimizer = optimizer.class_name(),
            "trainer ready"
        );
        Self {
            vars,
            optimizer,
            config,
            global_step: 0,
        }
    }

    /// Backward through `loss`, then one optimizer step over every variable
    /// that received a gradient.
    pub fn step(&mut self, loss: &Tensor) -> anyhow::Result<StepMetrics> {
        let loss_val = loss.to_scalar::<f32>()?;
        let mut grads = loss.backward()?;

        let clip = self.config.grad_clip_max_norm;
        let debug = self.config.debug_every > 0 && self.global_step % self.config.debug_every == 0;
        let norm = if clip > 0.0 {
            Some(clip_grad_norm(&mut grads, &self.vars, clip)?)
        } else if debug {
            Some(grad_norm(&grads, &self.vars)?)
        } else {
            None
        };

        let pairs = grads_and_vars(&grads, &self.vars);
        let report = self.optimizer.apply_gradients(&pairs)?;

        let step = self.global_step;
        self.global_step += 1;

        if self.config.log_every > 0 && step % self.config.log_every == 0 {
            tracing::info!(
                step,
                loss = format!("{loss_val:.4}"),
                updated = report.updated,
                skipped = report.skipped,
                "train"
            );
        }
        if let Some(norm) = norm.filter(|_| debug) {
            tracing::debug!(step, grad_norm = format!("{norm:.4}"), "gradients");
        }

        Ok(StepMetrics {
            step,
            loss: loss_val,
            grad_norm: norm,
            report,
        })
    }

    pub fn vars(&self) -> &[Variable] {
        &self.vars
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    /// Write the optimizer's `{class_name, config}` as pretty JSON under
    /// `output_dir`.
    pub fn save_optimizer_config(&self) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.config.output_dir)?;
        let path = self.config.output_dir.join("optimizer.json");
        save_optimizer_config(self.optimizer.as_ref(), &path)?;
        Ok(path)
    }
}

// ── Optimizer config files ──────────────────────────────────────────────────

pub fn save_optimizer_config(optimizer: &dyn Optimizer, path: &Path) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(&optimizer.serialize())?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Rebuild an optimizer from a file written by [`save_optimizer_config`].
///
/// Returns `None` for a `CaseOptimizer` saved before its first step: its
/// predicates were never serialized and it carries no routing table, so the
/// restored instance would send every variable to the default delegate.
pub fn load_optimizer(
    path: &Path,
    custom: Option<&Registry>,
) -> anyhow::Result<Option<Box<dyn Optimizer>>> {
    let text = std::fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&text)?;
    let tagged = TaggedConfig::from_value(&path.display().to_string(), &value)?;
    if is_unrouted_case(&tagged) {
        tracing::warn!(
            path = %path.display(),
            "optimizer config has no routing table; ignoring it"
        );
        return Ok(None);
    }
    Ok(Some(deserialize_optimizer(&tagged, custom)?))
}

fn is_unrouted_case(tagged: &TaggedConfig) -> bool {
    tagged.class_name == "CaseOptimizer"
        && tagged.config["var_opt_mapping"].is_null()
        && tagged.config["optimizer_configs"]
            .as_array()
            .is_some_and(|configs| !configs.is_empty())
}

// ── Gradient utilities ──────────────────────────────────────────────────────

/// Pair each variable with its gradient. Variables the loss does not reach
/// are left out.
pub fn grads_and_vars(grads: &GradStore, vars: &[Variable]) -> Vec<(Gradient, Variable)> {
    vars.iter()
        .filter_map(|v| {
            grads
                .get(v.as_tensor())
                .map(|g| (Gradient::Dense(g.clone()), v.clone()))
        })
        .collect()
}

/// Total L2 norm of gradients.
pub fn grad_norm(grads: &GradStore, vars: &[Variable]) -> anyhow::Result<f64> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    Ok(total.sqrt().max(1e-12))
}

/// Clip gradients so their global L2 norm ≤ `max_norm`. Returns the norm
/// before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Variable], max_norm: f64) -> anyhow::Result<f64> {
    let norm = grad_norm(grads, vars)?;
    if norm <= max_norm {
        return Ok(norm);
    }
    let scale = max_norm / norm;
    for var in vars {
        if let Some(g) = grads.remove(var.as_tensor()) {
            grads.insert(var.as_tensor(), g.affine(scale, 0.0)?);
        }
    }
    Ok(norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{loss, VarBuilder, VarMap};
    use lowbit_core::is_binary;
    use lowbit_optim::{Bop, CaseOptimizer, Sgd};

    use crate::data::{batch_to_tensors, synthetic_classification};
    use crate::model::{binarize_kernels, bnn_optimizer, SmallBnn};

    fn snapshot(vars: &[Variable]) -> Vec<Vec<f32>> {
        vars.iter()
            .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect()
    }

    #[test]
    fn bnn_trains_with_bop_and_adam() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = SmallBnn::new(vb, 10, 20, 2).unwrap();
        let vars = Variable::from_varmap(&varmap);
        binarize_kernels(&vars).unwrap();
        let before = snapshot(&vars);

        let optimizer = bnn_optimizer(1e-7, 1e-2, 1e-2);
        let mut trainer = Trainer::new(vars, Box::new(optimizer), TrainerConfig::default());

        let ds = synthetic_classification(200, 10, 2, 42);
        for _ in 0..2 {
            for (x, y) in ds.batches(16) {
                let (x, y) = batch_to_tensors(x, y, 10, &dev).unwrap();
                let l = loss::cross_entropy(&model.forward(&x).unwrap(), &y).unwrap();
                let metrics = trainer.step(&l).unwrap();
                assert!(metrics.loss.is_finite());
                assert_eq!(metrics.report.updated, 4);
                assert_eq!(metrics.report.skipped, 0);
            }
        }

        assert_eq!(trainer.global_step, 2 * 13);
        assert_eq!(trainer.optimizer().iterations(), 2 * 13);
        for var in trainer.vars().iter().filter(|v| Bop::is_binary_variable(v)) {
            assert!(is_binary(var.as_tensor()).unwrap(), "{var} lost binarity");
        }
        let after = snapshot(trainer.vars());
        for ((var, b), a) in trainer.vars().iter().zip(&before).zip(&after) {
            assert_ne!(b, a, "{var} never changed");
        }
    }

    #[test]
    fn unreached_variables_are_not_paired() {
        let dev = Device::Cpu;
        let used = Variable::from_tensor("used", &Tensor::new(&[1f32, 2.0], &dev).unwrap()).unwrap();
        let idle = Variable::from_tensor("idle", &Tensor::new(&[3f32], &dev).unwrap()).unwrap();
        let l = used.as_tensor().sqr().unwrap().sum_all().unwrap();
        let grads = l.backward().unwrap();

        let pairs = grads_and_vars(&grads, &[used.clone(), idle]);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].1.name(), "used");
        let Gradient::Dense(g) = &pairs[0].0 else {
            panic!("expected dense gradient");
        };
        assert_eq!(g.to_vec1::<f32>().unwrap(), vec![2.0, 4.0]);
    }

    #[test]
    fn clip_scales_to_max_norm() {
        let dev = Device::Cpu;
        let w = Variable::from_tensor("w", &Tensor::new(&[0f32, 0.0], &dev).unwrap()).unwrap();
        // d/dw (3 w0 + 4 w1) = [3, 4], norm 5
        let coeffs = Tensor::new(&[3f32, 4.0], &dev).unwrap();
        let l = w.as_tensor().mul(&coeffs).unwrap().sum_all().unwrap();
        let mut grads = l.backward().unwrap();
        let vars = [w.clone()];

        let norm = clip_grad_norm(&mut grads, &vars, 1.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-6);
        assert!((grad_norm(&grads, &vars).unwrap() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn optimizer_config_survives_a_file_round_trip() {
        let dev = Device::Cpu;
        let dir = tempfile::tempdir().unwrap();
        let config = TrainerConfig {
            output_dir: dir.path().join("run"),
            ..Default::default()
        };
        let k = Variable::from_tensor("quant_dense/kernel", &Tensor::new(&[1f32, -1.0], &dev).unwrap())
            .unwrap();
        let b = Variable::from_tensor("dense/bias", &Tensor::new(&[0f32], &dev).unwrap()).unwrap();
        let optimizer = bnn_optimizer(1e-6, 1e-3, 1e-2);
        let mut trainer = Trainer::new(vec![k.clone(), b.clone()], Box::new(optimizer), config);
        let l = (k.as_tensor().sum_all().unwrap() + b.as_tensor().sum_all().unwrap()).unwrap();
        trainer.step(&l).unwrap();
        let path = trainer.save_optimizer_config().unwrap();

        let restored = load_optimizer(&path, None).unwrap().unwrap();
        assert_eq!(restored.class_name(), "CaseOptimizer");
        assert_eq!(restored.serialize(), trainer.optimizer().serialize());
    }

    #[test]
    fn config_saved_before_routing_is_not_reloaded() {
        let dev = Device::Cpu;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("optimizer.json");
        save_optimizer_config(&bnn_optimizer(0.0, 1.0, 0.25), &path).unwrap();
        assert!(load_optimizer(&path, None).unwrap().is_none());

        // The fallback is a fresh router, which still sends kernels to Bop.
        let k = Variable::from_tensor("quant_dense/kernel", &Tensor::new(&[1f32], &dev).unwrap())
            .unwrap();
        let optimizer: Box<dyn Optimizer> = match load_optimizer(&path, None).unwrap() {
            Some(optimizer) => optimizer,
            None => Box::new(bnn_optimizer(0.0, 1.0, 0.25)),
        };
        let mut trainer = Trainer::new(vec![k.clone()], optimizer, TrainerConfig::default());
        trainer.step(&k.as_tensor().sum_all().unwrap()).unwrap();
        assert!(is_binary(k.as_tensor()).unwrap());
        assert_eq!(k.as_tensor().to_vec1::<f32>().unwrap(), vec![-1.0]);
    }

    #[test]
    fn plain_optimizer_config_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sgd.json");
        save_optimizer_config(&Sgd::new(0.1), &path).unwrap();
        let restored = load_optimizer(&path, None).unwrap().unwrap();
        assert_eq!(restored.class_name(), "SGD");
    }

    #[test]
    fn empty_step_still_counts() {
        let dev = Device::Cpu;
        let idle = Variable::from_tensor("idle", &Tensor::new(&[1f32], &dev).unwrap()).unwrap();
        let optimizer = CaseOptimizer::builder().default_optimizer(Sgd::new(0.1)).build();
        let mut trainer = Trainer::new(vec![idle.clone()], Box::new(optimizer), TrainerConfig::default());

        // A loss built from a constant reaches no variable.
        let l = Tensor::new(1f32, &dev).unwrap();
        let metrics = trainer.step(&l).unwrap();
        assert_eq!(metrics.report.updated, 0);
        assert_eq!(trainer.optimizer().iterations(), 1);
        assert_eq!(idle.as_tensor().to_vec1::<f32>().unwrap(), vec![1.0]);
    }
}
