//! Training configuration.
//!
//! Defaults reproduce the hyper-parameters in [`invgan_core::constants`]. A
//! config is usually loaded from JSON, patched from CLI flags, then checked
//! with [`TrainConfig::validate`] before a session is opened.

use std::path::{Path, PathBuf};

use invgan_core::constants::{
    BATCH_SIZE, CHECKPOINTS_TO_KEEP, CHECKPOINT_EVERY, DEFAULT_SEED, DIVERGENCE_LAMBDA, EPOCHS,
    GRAD_PENALTY_FACTOR, IMAGE_SIZE, LATENT_DIM, LEARNING_RATE, NUM_EXAMPLES_TO_GENERATE,
    NUM_TEST_IMAGES, NUM_UPDATES_PER_BATCH, Z_DIM,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::network::Architecture;
use crate::optim::AdamConfig;

/// Which network's parameters the gradient penalty is differentiated against
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PenaltyTarget {
    /// Penalty is part of the critic objective; the interpolation uses a
    /// detached generated batch.
    #[default]
    Critic,
    /// Penalty is part of the generator objective only; the critic objective
    /// excludes it.
    Generator,
}

/// Full configuration of one training run
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Real images per step; shorter batches are skipped
    pub batch_size: usize,
    pub epochs: usize,
    /// Joint steps applied to each batch before advancing
    pub num_updates_per_batch: usize,

    pub z_dim: usize,
    /// Square image side, a multiple of 32
    pub image_size: usize,
    /// Base channel width `w` of all three networks
    pub base_width: usize,

    pub learning_rate: f64,
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub adam_epsilon: f64,

    /// Weight of the latent-cycle term in the inverter loss
    pub divergence_lambda: f64,
    pub gradient_penalty_weight: f64,
    pub penalty_target: PenaltyTarget,

    /// Batch-index cadence for mid-epoch checkpoints and renders
    pub checkpoint_every: usize,
    pub keep_checkpoints: usize,
    /// Leading dataset images held out for reconstruction monitoring
    pub num_test_images: usize,
    /// Fixed latent vectors rendered for generation monitoring
    pub num_examples_to_generate: usize,

    /// Shuffle the training set each epoch
    pub shuffle: bool,
    pub seed: u64,

    /// Root of every artifact the run writes
    pub workdir: PathBuf,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: BATCH_SIZE,
            epochs: EPOCHS,
            num_updates_per_batch: NUM_UPDATES_PER_BATCH,
            z_dim: Z_DIM,
            image_size: IMAGE_SIZE,
            base_width: LATENT_DIM,
            learning_rate: LEARNING_RATE,
            adam_beta1: 0.9,
            adam_beta2: 0.999,
            adam_epsilon: 1e-8,
            divergence_lambda: DIVERGENCE_LAMBDA,
            gradient_penalty_weight: GRAD_PENALTY_FACTOR,
            penalty_target: PenaltyTarget::Critic,
            checkpoint_every: CHECKPOINT_EVERY,
            keep_checkpoints: CHECKPOINTS_TO_KEEP,
            num_test_images: NUM_TEST_IMAGES,
            num_examples_to_generate: NUM_EXAMPLES_TO_GENERATE,
            shuffle: true,
            seed: DEFAULT_SEED,
            workdir: PathBuf::from("."),
        }
    }
}

impl TrainConfig {
    /// Load and validate a JSON config file
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: TrainConfig = serde_json::from_str(&contents).map_err(|source| {
            ConfigError::Parse { path: path.to_path_buf(), source }
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_json(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::FileRead {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::invalid_value("(serialization)", e.to_string()))?;
        std::fs::write(path, json).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // Batch norm needs two samples per channel for a finite running variance
        if self.batch_size < 2 {
            return Err(ConfigError::invalid_value(
                "batch_size",
                format!("{} is too small, must be >= 2", self.batch_size),
            ));
        }
        if self.num_updates_per_batch == 0 {
            return Err(ConfigError::invalid_value("num_updates_per_batch", "must be > 0"));
        }

        // Network shapes
        if self.z_dim == 0 {
            return Err(ConfigError::invalid_value("z_dim", "must be > 0"));
        }
        if self.image_size < 32 || self.image_size % 32 != 0 {
            return Err(ConfigError::invalid_value(
                "image_size",
                format!("{} is not a positive multiple of 32", self.image_size),
            ));
        }
        if self.base_width == 0 {
            return Err(ConfigError::invalid_value("base_width", "must be > 0"));
        }

        // Optimizer
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ConfigError::invalid_value("learning_rate", "must be finite and > 0"));
        }
        for (field, beta) in [("adam_beta1", self.adam_beta1), ("adam_beta2", self.adam_beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(ConfigError::invalid_value(field, "must be in [0, 1)"));
            }
        }
        if !(self.adam_epsilon.is_finite() && self.adam_epsilon > 0.0) {
            return Err(ConfigError::invalid_value("adam_epsilon", "must be finite and > 0"));
        }

        // Loss weights
        if !(self.divergence_lambda.is_finite() && self.divergence_lambda >= 0.0) {
            return Err(ConfigError::invalid_value("divergence_lambda", "must be >= 0.0"));
        }
        if !(self.gradient_penalty_weight.is_finite() && self.gradient_penalty_weight >= 0.0) {
            return Err(ConfigError::invalid_value("gradient_penalty_weight", "must be >= 0.0"));
        }

        // Cadence and retention
        if self.checkpoint_every == 0 {
            return Err(ConfigError::invalid_value("checkpoint_every", "must be > 0"));
        }
        if self.keep_checkpoints == 0 {
            return Err(ConfigError::invalid_value("keep_checkpoints", "must be > 0"));
        }

        Ok(())
    }

    pub fn architecture(&self) -> Architecture {
        Architecture {
            z_dim: self.z_dim,
            image_size: self.image_size,
            base_width: self.base_width,
        }
    }

    pub fn adam(&self) -> AdamConfig {
        AdamConfig {
            learning_rate: self.learning_rate,
            beta1: self.adam_beta1,
            beta2: self.adam_beta2,
            epsilon: self.adam_epsilon,
        }
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.workdir.join("training_checkpoints")
    }

    pub fn image_dir(&self) -> PathBuf {
        self.workdir.join("images")
    }

    pub fn model_dir(&self) -> PathBuf {
        self.workdir.join("models")
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.workdir.join("summaries").join("train").join("metrics.csv")
    }
}
