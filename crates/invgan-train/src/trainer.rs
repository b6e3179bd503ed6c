//! Epoch loop with checkpoint and monitoring cadence

use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use invgan_data::{split_holdout, DataLoader, ImageSource};

use crate::config::TrainConfig;
use crate::device::TorchDevice;
use crate::error::TrainResult;
use crate::metrics::StepMetrics;
use crate::session::{batch_to_tensor, TrainingSession};

/// What a call to [`Trainer::run`] did
#[derive(Clone, Debug, Default)]
pub struct TrainSummary {
    pub epochs_run: usize,
    pub steps_applied: u64,
    pub skipped_batches: usize,
    pub failed_checkpoints: usize,
    pub last: Option<StepMetrics>,
    pub elapsed: Duration,
}

/// Drives a session over a loader until the configured epoch count
pub struct Trainer<'a> {
    session: &'a mut TrainingSession,
    loader: &'a DataLoader,
    show_progress: bool,
    summary: TrainSummary,
}

impl<'a> Trainer<'a> {
    pub fn new(session: &'a mut TrainingSession, loader: &'a DataLoader) -> Self {
        Self { session, loader, show_progress: true, summary: TrainSummary::default() }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Progress so far, also valid after [`Trainer::run`] returned an error
    pub fn summary(&self) -> &TrainSummary {
        &self.summary
    }

    /// Train from the session's completed epoch up to `config.epochs`.
    ///
    /// Batch indices divisible by `checkpoint_every` save a checkpoint (a
    /// failure is logged and retried at the next trigger) and render keyed by
    /// `epoch + 1`. Every epoch ends with a mandatory checkpoint, a model
    /// export and a render.
    pub fn run(&mut self) -> TrainResult<TrainSummary> {
        let config = self.session.config().clone();
        let start = Instant::now();
        self.summary = TrainSummary::default();
        let result = self.run_epochs(&config);
        self.summary.elapsed = start.elapsed();
        result.map(|()| self.summary.clone())
    }

    fn run_epochs(&mut self, config: &TrainConfig) -> TrainResult<()> {
        if self.session.epoch() >= config.epochs {
            tracing::info!(
                "Already trained for {} of {} epochs, nothing to do",
                self.session.epoch(),
                config.epochs
            );
        }

        for epoch in self.session.epoch()..config.epochs {
            let epoch_start = Instant::now();
            let pb = self.progress_bar(epoch, config);

            for (i, batch) in self.loader.epoch(epoch).enumerate() {
                let batch = batch?;
                let images = batch_to_tensor(&batch, self.session.device());

                for _ in 0..config.num_updates_per_batch {
                    match self.session.train_step(&images)? {
                        Some(metrics) => {
                            pb.set_message(format!(
                                "gen={:.4} disc={:.4} inv={:.4}",
                                metrics.gen_loss, metrics.disc_loss, metrics.inv_loss
                            ));
                            self.summary.steps_applied += 1;
                            self.summary.last = Some(metrics);
                        }
                        None => {
                            self.summary.skipped_batches += 1;
                            break;
                        }
                    }
                }

                if i % config.checkpoint_every == 0 {
                    if let Err(e) = self.session.save_checkpoint() {
                        self.summary.failed_checkpoints += 1;
                        tracing::warn!("Checkpoint save failed, retrying at next trigger: {}", e);
                    }
                    if let Err(e) = self.session.render(epoch + 1) {
                        tracing::warn!("Monitoring render failed: {}", e);
                    }
                }
                pb.inc(1);
            }
            pb.finish_and_clear();

            self.session.complete_epoch();
            let entry = self.session.save_checkpoint()?;
            self.session.export_models()?;
            self.session.render(epoch + 1)?;
            self.summary.epochs_run += 1;

            tracing::info!(
                "Time for epoch {} is {:.2} sec (step {}, checkpoint {})",
                epoch + 1,
                epoch_start.elapsed().as_secs_f64(),
                self.session.step(),
                entry.file_name
            );
        }

        Ok(())
    }

    fn progress_bar(&self, epoch: usize, config: &TrainConfig) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(self.loader.num_batches() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed}] [{bar:30}] {pos}/{len} {prefix} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        pb.set_prefix(format!("epoch {}/{}", epoch + 1, config.epochs));
        pb
    }
}

/// Full run: open (and restore) a session, export the networks, train, then
/// write the final render and export.
///
/// The first `num_test_images` images of `source` are held out for
/// reconstruction renders; the rest are trained on.
pub fn train(
    config: TrainConfig,
    device: TorchDevice,
    source: Arc<dyn ImageSource>,
) -> TrainResult<TrainSummary> {
    let device = device.resolve()?;
    tracing::info!(
        "Training on {:?} from `{}` ({} images, batch size {})",
        device,
        source.name(),
        source.len(),
        config.batch_size
    );

    let mut session = TrainingSession::open(config.clone(), device)?;

    let (holdout, train_set) = split_holdout(source, config.num_test_images);
    if !holdout.is_empty() {
        let holdout_loader = DataLoader::new(Arc::new(holdout), config.num_test_images)?;
        session.set_holdout(batch_to_tensor(&holdout_loader.load_all()?, device));
    }

    let mut loader = DataLoader::new(Arc::new(train_set), config.batch_size)?;
    if config.shuffle {
        loader = loader.with_shuffle(config.seed);
    }
    if loader.len() < config.batch_size {
        tracing::warn!(
            "Training set has {} images, fewer than one batch of {}; every batch will be skipped",
            loader.len(),
            config.batch_size
        );
    }

    session.export_models()?;
    if session.epoch() < config.epochs {
        session.render(session.epoch() + 1)?;
    }
    let summary = Trainer::new(&mut session, &loader).run()?;
    session.finalize()?;
    session.close()?;

    tracing::info!(
        "Training complete: {} steps in {:.1}s. Output: {:?}",
        summary.steps_applied,
        summary.elapsed.as_secs_f64(),
        config.workdir
    );
    Ok(summary)
}
