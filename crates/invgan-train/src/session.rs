//! Training session: the three networks, their optimizers and every counter
//! that must survive a restart.
//!
//! A session moves through `Initializing → Restoring → Running → SavingFinal
//! → Done`. All mutation of parameters happens in [`TrainingSession::train_step`],
//! which either applies all three updates or none of them.

use std::collections::HashMap;

use invgan_data::{CheckpointEntry, ImageBatch};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use tch::{Device, Kind, Tensor};

use crate::checkpoint::CheckpointStore;
use crate::config::{PenaltyTarget, TrainConfig};
use crate::error::{TrainError, TrainResult};
use crate::loss::{critic_loss, generator_loss, inverter_loss};
use crate::metrics::{CsvMetricsSink, MetricsSink, StepMetrics};
use crate::network::{ExportedModel, Mode, Network, Role};
use crate::optim::Adam;
use crate::penalty::gradient_penalty;
use crate::render::MonitorRenderer;

const STEP_KEY: &str = "session.step";
const EPOCH_KEY: &str = "session.epoch";

/// Lifecycle of a [`TrainingSession`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Restoring,
    Running,
    SavingFinal,
    Done,
}

/// Everything a training run owns
pub struct TrainingSession {
    config: TrainConfig,
    device: Device,
    generator: Network,
    critic: Network,
    inverter: Network,
    generator_opt: Adam,
    critic_opt: Adam,
    inverter_opt: Adam,
    step: u64,
    epoch: usize,
    state: SessionState,
    checkpoints: CheckpointStore,
    metrics: Box<dyn MetricsSink>,
    renderer: MonitorRenderer,
    fixed_noise: Tensor,
    holdout: Option<Tensor>,
    restored_from: Option<CheckpointEntry>,
}

impl TrainingSession {
    /// Open a session that logs metrics to CSV under the workdir
    pub fn open(config: TrainConfig, device: Device) -> TrainResult<Self> {
        let metrics = CsvMetricsSink::open(&config.metrics_path())?;
        Self::open_with_metrics(config, device, Box::new(metrics))
    }

    /// Build the networks from the seed, then restore the latest checkpoint
    /// if the checkpoint directory has one.
    pub fn open_with_metrics(
        config: TrainConfig,
        device: Device,
        metrics: Box<dyn MetricsSink>,
    ) -> TrainResult<Self> {
        config.validate()?;

        tracing::debug!(
            "Session {:?}: seed {} on {:?}",
            SessionState::Initializing,
            config.seed,
            device
        );

        tch::manual_seed(config.seed as i64);
        let arch = config.architecture();
        let generator = Network::new(Role::Generator, arch, device);
        let critic = Network::new(Role::Critic, arch, device);
        let inverter = Network::new(Role::Inverter, arch, device);

        let adam = config.adam();
        let generator_opt = Adam::new(adam, &generator.parameters());
        let critic_opt = Adam::new(adam, &critic.parameters());
        let inverter_opt = Adam::new(adam, &inverter.parameters());

        let mut rng = StdRng::seed_from_u64(config.seed);
        let fixed_noise =
            sample_noise(&mut rng, config.num_examples_to_generate, config.z_dim).to_device(device);

        let checkpoints = CheckpointStore::open(&config.checkpoint_dir(), config.keep_checkpoints)?;
        let renderer = MonitorRenderer::new(&config.image_dir());

        tracing::info!(
            "Networks built: generator={} critic={} inverter={} parameters",
            generator.num_parameters(),
            critic.num_parameters(),
            inverter.num_parameters()
        );

        let mut session = Self {
            config,
            device,
            generator,
            critic,
            inverter,
            generator_opt,
            critic_opt,
            inverter_opt,
            step: 0,
            epoch: 0,
            state: SessionState::Restoring,
            checkpoints,
            metrics,
            renderer,
            fixed_noise,
            holdout: None,
            restored_from: None,
        };

        match session.restore_latest()? {
            Some(entry) => tracing::info!(
                "Restored from {:?} (step {}, epoch {})",
                session.checkpoints.path_of(&entry),
                entry.step,
                entry.epoch
            ),
            None => tracing::info!("No checkpoint found, initializing from scratch."),
        }

        session.state = SessionState::Running;
        Ok(session)
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Joint updates applied so far
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Completed epochs
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn network(&self, role: Role) -> &Network {
        match role {
            Role::Generator => &self.generator,
            Role::Critic => &self.critic,
            Role::Inverter => &self.inverter,
        }
    }

    pub fn optimizer(&self, role: Role) -> &Adam {
        match role {
            Role::Generator => &self.generator_opt,
            Role::Critic => &self.critic_opt,
            Role::Inverter => &self.inverter_opt,
        }
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn renderer(&self) -> &MonitorRenderer {
        &self.renderer
    }

    /// Checkpoint the session was restored from, if any
    pub fn restored_from(&self) -> Option<&CheckpointEntry> {
        self.restored_from.as_ref()
    }

    /// Images used for reconstruction renders
    pub fn set_holdout(&mut self, images: Tensor) {
        if images.size().first().copied().unwrap_or(0) > 0 {
            self.holdout = Some(images.to_device(self.device));
        } else {
            self.holdout = None;
        }
    }

    pub fn complete_epoch(&mut self) {
        self.epoch += 1;
    }

    fn ensure_running(&self) -> TrainResult<()> {
        match self.state {
            SessionState::Running => Ok(()),
            _ => Err(TrainError::SessionClosed),
        }
    }

    /// One joint update of all three networks on `real` (`[B, S, S, 3]`).
    ///
    /// Returns `Ok(None)` without touching any state when the batch is
    /// shorter than the configured batch size.
    pub fn train_step(&mut self, real: &Tensor) -> TrainResult<Option<StepMetrics>> {
        self.ensure_running()?;

        let dims = real.size();
        let batch = self.config.batch_size as i64;
        let expected = self.config.architecture().image_dims(batch);
        if dims.len() != 4 || dims[1..] != expected[1..] {
            return Err(TrainError::ShapeMismatch { what: "real batch", expected, actual: dims });
        }
        if dims[0] != batch {
            tracing::warn!(
                "Skipping partial batch of {} images (batch size {})",
                dims[0],
                batch
            );
            return Ok(None);
        }

        let next_step = self.step + 1;
        let mut rng = StdRng::seed_from_u64(step_seed(self.config.seed, next_step));
        let noise = sample_noise(&mut rng, self.config.batch_size, self.config.z_dim).to_device(self.device);
        let alpha = sample_alpha(&mut rng, self.config.batch_size).to_device(self.device);
        let real = real.to_device(self.device).to_kind(Kind::Float);

        let generated = self.generator.forward(&noise, Mode::Train);
        let real_scores = self.critic.forward(&real, Mode::Train);
        let fake_scores = self.critic.forward(&generated, Mode::Train);
        let reconstructed_images =
            self.generator.forward(&self.inverter.forward(&real, Mode::Infer), Mode::Infer);
        let reconstructed_noise =
            self.inverter.forward(&self.generator.forward(&noise, Mode::Infer), Mode::Infer);

        let target = self.config.penalty_target;
        let penalty_input = match target {
            PenaltyTarget::Critic => generated.detach(),
            PenaltyTarget::Generator => generated.shallow_clone(),
        };
        let critic = &self.critic;
        let penalty = gradient_penalty(
            |x| critic.forward(x, Mode::Train),
            &real,
            &penalty_input,
            &alpha,
            self.config.gradient_penalty_weight,
        )?;

        let gen_loss = generator_loss(&fake_scores, &penalty);
        let disc_loss = critic_loss(&real_scores, &fake_scores);
        let inv_loss = inverter_loss(
            &noise,
            &reconstructed_noise,
            &real,
            &reconstructed_images,
            self.config.divergence_lambda,
        );

        let metrics = StepMetrics {
            step: next_step,
            gen_loss: gen_loss.double_value(&[]),
            disc_loss: disc_loss.double_value(&[]),
            inv_loss: inv_loss.double_value(&[]),
            gradient_penalty: penalty.double_value(&[]),
        };
        if !metrics.is_finite() {
            return Err(TrainError::NonFiniteLoss {
                step: next_step,
                generator: metrics.gen_loss,
                critic: metrics.disc_loss,
                inverter: metrics.inv_loss,
            });
        }

        let critic_objective = match target {
            PenaltyTarget::Critic => &disc_loss + &penalty,
            PenaltyTarget::Generator => disc_loss.shallow_clone(),
        };
        let gen_grads = self.generator.gradient(&gen_loss)?;
        let critic_grads = self.critic.gradient(&critic_objective)?;
        let inv_grads = self.inverter.gradient(&inv_loss)?;

        self.generator_opt.apply(&self.generator.parameters(), &gen_grads)?;
        self.critic_opt.apply(&self.critic.parameters(), &critic_grads)?;
        self.inverter_opt.apply(&self.inverter.parameters(), &inv_grads)?;
        self.step = next_step;

        tracing::debug!(
            "step {}: gen={:.4} disc={:.4} inv={:.4} gp={:.4}",
            metrics.step,
            metrics.gen_loss,
            metrics.disc_loss,
            metrics.inv_loss,
            metrics.gradient_penalty
        );
        self.metrics.record(&metrics)?;
        Ok(Some(metrics))
    }

    /// [`TrainingSession::train_step`] on a loaded batch
    pub fn train_batch(&mut self, batch: &ImageBatch) -> TrainResult<Option<StepMetrics>> {
        let images = batch_to_tensor(batch, self.device);
        self.train_step(&images)
    }

    /// Generator output for `noise` with frozen statistics and no graph
    pub fn generate(&self, noise: &Tensor) -> TrainResult<Tensor> {
        let noise = noise.to_device(self.device);
        tch::no_grad(|| self.generator.forward_checked(&noise, Mode::Infer))
    }

    /// `G(I(images))` with frozen statistics and no graph
    pub fn reconstruct(&self, images: &Tensor) -> TrainResult<Tensor> {
        let images = images.to_device(self.device);
        tch::no_grad(|| {
            let latent = self.inverter.forward_checked(&images, Mode::Infer)?;
            Ok(self.generator.forward(&latent, Mode::Infer))
        })
    }

    /// Render the fixed-noise samples and, with a holdout set, reconstructions
    pub fn render(&self, epoch: usize) -> TrainResult<()> {
        let samples = self.generate(&self.fixed_noise)?;
        self.renderer.save_samples(&samples, epoch)?;
        if let Some(holdout) = &self.holdout {
            let reconstructions = self.reconstruct(holdout)?;
            self.renderer.save_pairs(holdout, &reconstructions, epoch)?;
        }
        Ok(())
    }

    /// Every tensor a checkpoint holds, with stable names
    pub fn snapshot(&self) -> Vec<(String, Tensor)> {
        let mut tensors = Vec::new();
        for role in Role::ALL {
            for (name, t) in self.network(role).state() {
                tensors.push((format!("{}.var.{}", role, name), t));
            }
            for (name, t) in self.optimizer(role).state() {
                tensors.push((format!("{}.adam.{}", role, name), t));
            }
        }
        tensors.push((STEP_KEY.to_string(), Tensor::from(self.step as i64)));
        tensors.push((EPOCH_KEY.to_string(), Tensor::from(self.epoch as i64)));
        tensors
    }

    pub fn save_checkpoint(&mut self) -> TrainResult<CheckpointEntry> {
        let snapshot = self.snapshot();
        self.checkpoints.save(&snapshot, self.step, self.epoch)
    }

    /// Load the newest checkpoint into this session. A missing or corrupt
    /// archive referenced by the manifest is an error, never a fresh start.
    pub fn restore_latest(&mut self) -> TrainResult<Option<CheckpointEntry>> {
        let Some((entry, tensors)) = self.checkpoints.load_latest(self.device)? else {
            return Ok(None);
        };
        let path = self.checkpoints.path_of(&entry);
        self.apply_snapshot(tensors)
            .map_err(|e| TrainError::restore(&path, e.to_string()))?;
        self.restored_from = Some(entry.clone());
        Ok(Some(entry))
    }

    fn apply_snapshot(&mut self, tensors: HashMap<String, Tensor>) -> TrainResult<()> {
        let counter = |key: &str| -> TrainResult<i64> {
            tensors
                .get(key)
                .ok_or_else(|| TrainError::restore(key, "missing counter"))?
                .f_int64_value(&[])
                .map_err(|e| TrainError::restore(key, e.to_string()))
        };
        let step = counter(STEP_KEY)?;
        let epoch = counter(EPOCH_KEY)?;

        for role in Role::ALL {
            let vars = strip_prefix(&tensors, &format!("{}.var.", role));
            let adam = strip_prefix(&tensors, &format!("{}.adam.", role));
            match role {
                Role::Generator => {
                    self.generator.load_state(&vars)?;
                    self.generator_opt.load_state(&adam)?;
                }
                Role::Critic => {
                    self.critic.load_state(&vars)?;
                    self.critic_opt.load_state(&adam)?;
                }
                Role::Inverter => {
                    self.inverter.load_state(&vars)?;
                    self.inverter_opt.load_state(&adam)?;
                }
            }
        }

        self.step = step.max(0) as u64;
        self.epoch = epoch.max(0) as usize;
        Ok(())
    }

    /// Write topology and weights of all three networks to the model dir
    pub fn export_models(&self) -> TrainResult<Vec<ExportedModel>> {
        let dir = self.config.model_dir();
        let exported = Role::ALL
            .into_iter()
            .map(|role| self.network(role).export(&dir))
            .collect::<TrainResult<Vec<_>>>()?;
        tracing::debug!("Exported {} models to {:?}", exported.len(), dir);
        Ok(exported)
    }

    /// Final render keyed by the configured epoch count, final export, flush
    pub fn finalize(&mut self) -> TrainResult<()> {
        self.ensure_running()?;
        self.state = SessionState::SavingFinal;
        self.render(self.config.epochs)?;
        self.export_models()?;
        self.metrics.flush()?;
        self.state = SessionState::Done;
        Ok(())
    }

    /// Flush metrics and release the session
    pub fn close(mut self) -> TrainResult<()> {
        self.metrics.flush()?;
        self.state = SessionState::Done;
        tracing::info!("Session closed at step {} (epoch {})", self.step, self.epoch);
        Ok(())
    }
}

/// Per-step seed: distinct, reproducible draws for every update index
fn step_seed(seed: u64, step: u64) -> u64 {
    seed.rotate_left(17) ^ step.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

fn strip_prefix(tensors: &HashMap<String, Tensor>, prefix: &str) -> HashMap<String, Tensor> {
    tensors
        .iter()
        .filter_map(|(k, t)| k.strip_prefix(prefix).map(|rest| (rest.to_string(), t.shallow_clone())))
        .collect()
}

/// `[n, z_dim]` standard normal draws
pub fn sample_noise(rng: &mut StdRng, n: usize, z_dim: usize) -> Tensor {
    let values: Vec<f32> = (0..n * z_dim).map(|_| rng.sample(StandardNormal)).collect();
    Tensor::from_slice(&values).view([n as i64, z_dim as i64])
}

/// `[n, 1, 1, 1]` mixing coefficients in `[0, 1)`
pub fn sample_alpha(rng: &mut StdRng, n: usize) -> Tensor {
    let values: Vec<f32> = (0..n).map(|_| rng.random::<f32>()).collect();
    Tensor::from_slice(&values).view([n as i64, 1, 1, 1])
}

/// Move a host batch onto `device` as `[N, S, S, 3]`
pub fn batch_to_tensor(batch: &ImageBatch, device: Device) -> Tensor {
    let dims: Vec<i64> = batch.dims().iter().map(|&d| d as i64).collect();
    Tensor::from_slice(batch.data()).view(dims.as_slice()).to_device(device)
}
