//! Adam with persistable state.
//!
//! Bias correction folds into the step size the way TF1 does it:
//! `lr_t = lr * sqrt(1 - β2^t) / (1 - β1^t)` and
//! `θ -= lr_t * m / (sqrt(v) + ε)`.
//!
//! Moments live in a map keyed by parameter name so that the state can be
//! written into a checkpoint and restored bit-for-bit.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tch::Tensor;

use crate::error::{TrainError, TrainResult};

const STEP_KEY: &str = "step";

/// Adam hyper-parameters
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: invgan_core::constants::LEARNING_RATE,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

/// First and second moment estimates for one parameter
#[derive(Debug)]
pub struct Moments {
    pub m: Tensor,
    pub v: Tensor,
}

/// Adam optimizer for one network
#[derive(Debug)]
pub struct Adam {
    config: AdamConfig,
    step: u64,
    moments: BTreeMap<String, Moments>,
}

impl Adam {
    /// Zero-initialised moments for every parameter in `params`
    pub fn new(config: AdamConfig, params: &[(String, Tensor)]) -> Self {
        let moments = params
            .iter()
            .map(|(name, p)| {
                let zeros = || p.detach().zeros_like();
                (name.clone(), Moments { m: zeros(), v: zeros() })
            })
            .collect();
        Self { config, step: 0, moments }
    }

    pub fn config(&self) -> AdamConfig {
        self.config
    }

    /// Number of updates applied so far
    pub fn step_count(&self) -> u64 {
        self.step
    }

    pub fn moments(&self, name: &str) -> Option<&Moments> {
        self.moments.get(name)
    }

    /// Step size after bias correction for update number `t` (1-based)
    pub fn corrected_learning_rate(&self, t: u64) -> f64 {
        let t = t as i32;
        let c = &self.config;
        c.learning_rate * (1.0 - c.beta2.powi(t)).sqrt() / (1.0 - c.beta1.powi(t))
    }

    /// Apply one update. `grads` must follow the order of `params`.
    ///
    /// Every parameter is checked against the stored moments before any of
    /// them is touched.
    pub fn apply(&mut self, params: &[(String, Tensor)], grads: &[Tensor]) -> TrainResult<()> {
        if params.len() != grads.len() || params.len() != self.moments.len() {
            return Err(TrainError::ShapeMismatch {
                what: "optimizer parameters",
                expected: vec![self.moments.len() as i64],
                actual: vec![params.len() as i64, grads.len() as i64],
            });
        }
        for ((name, param), grad) in params.iter().zip(grads) {
            let moments = self.moments.get(name).ok_or_else(|| {
                TrainError::restore(name.as_str(), "parameter has no optimizer state")
            })?;
            if param.size() != grad.size() || param.size() != moments.m.size() {
                return Err(TrainError::ShapeMismatch {
                    what: "gradient",
                    expected: param.size(),
                    actual: grad.size(),
                });
            }
        }

        self.step += 1;
        let lr_t = self.corrected_learning_rate(self.step);
        let AdamConfig { beta1, beta2, epsilon, .. } = self.config;

        tch::no_grad(|| -> TrainResult<()> {
            for ((name, param), grad) in params.iter().zip(grads) {
                let Some(moments) = self.moments.get_mut(name) else {
                    continue;
                };
                moments.m = &moments.m * beta1 + grad * (1.0 - beta1);
                moments.v = &moments.v * beta2 + (grad * grad) * (1.0 - beta2);

                let update = &moments.m / (moments.v.sqrt() + epsilon) * lr_t;
                let mut dst = param.shallow_clone();
                dst.f_copy_(&(param - update))?;
            }
            Ok(())
        })
    }

    /// Moments as `m.<name>` / `v.<name>` plus the `step` counter
    pub fn state(&self) -> Vec<(String, Tensor)> {
        let mut state = Vec::with_capacity(2 * self.moments.len() + 1);
        for (name, moments) in &self.moments {
            state.push((format!("m.{}", name), moments.m.shallow_clone()));
            state.push((format!("v.{}", name), moments.v.shallow_clone()));
        }
        state.push((STEP_KEY.to_string(), Tensor::from(self.step as i64)));
        state
    }

    /// Replace all moments and the counter from [`Adam::state`] output
    pub fn load_state(&mut self, state: &HashMap<String, Tensor>) -> TrainResult<()> {
        let fetch = |key: String| {
            state
                .get(&key)
                .ok_or_else(|| TrainError::restore(key.as_str(), "missing optimizer tensor"))
        };

        let step = fetch(STEP_KEY.to_string())?
            .f_int64_value(&[])
            .map_err(|e| TrainError::restore(STEP_KEY, e.to_string()))?;
        let mut restored = BTreeMap::new();
        for (name, current) in &self.moments {
            let m = fetch(format!("m.{}", name))?;
            let v = fetch(format!("v.{}", name))?;
            if m.size() != current.m.size() || v.size() != current.v.size() {
                return Err(TrainError::ShapeMismatch {
                    what: "optimizer moments",
                    expected: current.m.size(),
                    actual: m.size(),
                });
            }
            let device = current.m.device();
            restored.insert(
                name.clone(),
                Moments { m: m.to_device(device).copy(), v: v.to_device(device).copy() },
            );
        }

        self.step = step.max(0) as u64;
        self.moments = restored;
        Ok(())
    }
}
