//! End-to-end behaviour of the training session on tiny CPU networks

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use invgan_core::ImageShape;
use invgan_data::{ConstantImages, DataLoader, DataResult, ImageSource};
use invgan_train::{
    train, MemoryMetricsSink, NullMetricsSink, PenaltyTarget, Role, TorchDevice, TrainConfig,
    TrainError, Trainer, TrainingSession,
};
use tch::{Device, Kind, Tensor};

fn tiny_config(workdir: &Path) -> TrainConfig {
    TrainConfig {
        batch_size: 2,
        epochs: 1,
        num_updates_per_batch: 1,
        z_dim: 8,
        image_size: 32,
        base_width: 2,
        num_test_images: 0,
        num_examples_to_generate: 4,
        shuffle: false,
        workdir: workdir.to_path_buf(),
        ..Default::default()
    }
}

fn constant_batch(n: i64, value: f64) -> Tensor {
    Tensor::full([n, 32, 32, 3], value, (Kind::Float, Device::Cpu))
}

/// Deep copy of every checkpointed tensor
fn snapshot(session: &TrainingSession) -> HashMap<String, Tensor> {
    session.snapshot().into_iter().map(|(name, t)| (name, t.detach().copy())).collect()
}

fn assert_snapshots_equal(a: &HashMap<String, Tensor>, b: &HashMap<String, Tensor>) {
    assert_eq!(a.len(), b.len());
    for (name, t) in a {
        let other = b.get(name).unwrap_or_else(|| panic!("missing {}", name));
        assert!(t.equal(other), "tensor {} differs", name);
    }
}

fn loader(len: usize, batch_size: usize) -> DataLoader {
    let source: Arc<dyn ImageSource> = Arc::new(ConstantImages::new(len, 32, 0.5).unwrap());
    DataLoader::new(source, batch_size).unwrap()
}

#[test]
fn single_step_updates_every_parameter_of_all_networks() {
    let dir = tempfile::tempdir().unwrap();
    let sink = MemoryMetricsSink::new();
    let mut session =
        TrainingSession::open_with_metrics(tiny_config(dir.path()), Device::Cpu, Box::new(sink.clone()))
            .unwrap();

    let before = snapshot(&session);
    let metrics = session.train_step(&constant_batch(2, 0.5)).unwrap().unwrap();

    assert!(metrics.gen_loss.is_finite());
    assert!(metrics.disc_loss.is_finite());
    assert!(metrics.inv_loss.is_finite());
    assert_eq!(metrics.step, 1);
    assert_eq!(session.step(), 1);
    assert_eq!(sink.records(), vec![metrics]);

    for role in Role::ALL {
        let params = session.network(role).parameters();
        assert!(!params.is_empty());
        for (name, param) in params {
            let key = format!("{}.var.{}", role, name);
            assert!(!before[&key].equal(&param), "{} did not change", key);
        }
        assert_eq!(session.optimizer(role).step_count(), 1);
    }
}

#[test]
fn generator_penalty_routing_also_updates_everything() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrainConfig { penalty_target: PenaltyTarget::Generator, ..tiny_config(dir.path()) };
    let mut session =
        TrainingSession::open_with_metrics(config, Device::Cpu, Box::new(NullMetricsSink)).unwrap();

    let metrics = session.train_step(&constant_batch(2, -0.25)).unwrap().unwrap();
    assert!(metrics.gradient_penalty.is_finite());
    assert!(metrics.gen_loss >= metrics.gradient_penalty);
}

#[test]
fn partial_batch_is_skipped_without_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let sink = MemoryMetricsSink::new();
    let mut session =
        TrainingSession::open_with_metrics(tiny_config(dir.path()), Device::Cpu, Box::new(sink.clone()))
            .unwrap();

    let before = snapshot(&session);
    let outcome = session.train_step(&constant_batch(1, 0.5)).unwrap();

    assert!(outcome.is_none());
    assert_eq!(session.step(), 0);
    assert!(sink.records().is_empty());
    assert_snapshots_equal(&before, &snapshot(&session));
}

#[test]
fn non_finite_loss_aborts_before_any_update() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = TrainingSession::open_with_metrics(
        tiny_config(dir.path()),
        Device::Cpu,
        Box::new(NullMetricsSink),
    )
    .unwrap();

    let before = snapshot(&session);
    let result = session.train_step(&constant_batch(2, f64::NAN));
    assert!(matches!(result, Err(TrainError::NonFiniteLoss { step: 1, .. })));
    assert_eq!(session.step(), 0);

    for role in Role::ALL {
        assert_eq!(session.optimizer(role).step_count(), 0);
        for (name, param) in session.network(role).parameters() {
            assert!(before[&format!("{}.var.{}", role, name)].equal(&param));
        }
    }
}

#[test]
fn only_two_checkpoints_survive_many_saves() {
    let dir = tempfile::tempdir().unwrap();
    let config = tiny_config(dir.path());
    let checkpoint_dir = config.checkpoint_dir();
    let mut session =
        TrainingSession::open_with_metrics(config, Device::Cpu, Box::new(NullMetricsSink)).unwrap();

    for _ in 0..5 {
        session.train_step(&constant_batch(2, 0.5)).unwrap();
        session.save_checkpoint().unwrap();
    }

    let archives = std::fs::read_dir(&checkpoint_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("ot"))
        .count();
    assert_eq!(archives, 2);
    assert_eq!(session.checkpoints().manifest().len(), 2);
    assert_eq!(session.checkpoints().latest().unwrap().step, 5);
}

#[test]
fn resume_restores_bit_identical_state() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrainConfig { num_updates_per_batch: 2, ..tiny_config(dir.path()) };
    let data = loader(2, 2);

    let trained = {
        let mut session =
            TrainingSession::open_with_metrics(config.clone(), Device::Cpu, Box::new(NullMetricsSink))
                .unwrap();
        let summary = Trainer::new(&mut session, &data).with_progress(false).run().unwrap();
        assert_eq!(summary.epochs_run, 1);
        assert_eq!(summary.steps_applied, 2);
        snapshot(&session)
    };

    let mut resumed =
        TrainingSession::open_with_metrics(config, Device::Cpu, Box::new(NullMetricsSink)).unwrap();
    assert!(resumed.restored_from().is_some());
    assert_eq!(resumed.step(), 2);
    assert_eq!(resumed.epoch(), 1);
    assert_snapshots_equal(&trained, &snapshot(&resumed));

    // Already at the configured epoch count: nothing more happens
    let summary = Trainer::new(&mut resumed, &data).with_progress(false).run().unwrap();
    assert_eq!(summary.epochs_run, 0);
    assert_eq!(summary.steps_applied, 0);
    assert_snapshots_equal(&trained, &snapshot(&resumed));
}

#[test]
fn resumed_run_matches_uninterrupted_run() {
    let data = loader(2, 2);

    let straight_dir = tempfile::tempdir().unwrap();
    let straight = {
        let config = TrainConfig { epochs: 2, ..tiny_config(straight_dir.path()) };
        let mut session =
            TrainingSession::open_with_metrics(config, Device::Cpu, Box::new(NullMetricsSink)).unwrap();
        Trainer::new(&mut session, &data).with_progress(false).run().unwrap();
        snapshot(&session)
    };

    let split_dir = tempfile::tempdir().unwrap();
    {
        let config = TrainConfig { epochs: 1, ..tiny_config(split_dir.path()) };
        let mut session =
            TrainingSession::open_with_metrics(config, Device::Cpu, Box::new(NullMetricsSink)).unwrap();
        Trainer::new(&mut session, &data).with_progress(false).run().unwrap();
    }
    let config = TrainConfig { epochs: 2, ..tiny_config(split_dir.path()) };
    let mut session =
        TrainingSession::open_with_metrics(config, Device::Cpu, Box::new(NullMetricsSink)).unwrap();
    Trainer::new(&mut session, &data).with_progress(false).run().unwrap();
    let resumed = snapshot(&session);

    assert_eq!(straight.len(), resumed.len());
    for (name, t) in &straight {
        assert!(
            t.to_kind(Kind::Double).allclose(&resumed[name].to_kind(Kind::Double), 1e-5, 1e-6, false),
            "tensor {} diverged after resume",
            name
        );
    }
}

#[test]
fn corrupt_checkpoint_is_fatal_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let config = tiny_config(dir.path());
    {
        let mut session =
            TrainingSession::open_with_metrics(config.clone(), Device::Cpu, Box::new(NullMetricsSink))
                .unwrap();
        session.save_checkpoint().unwrap();
        let latest = session.checkpoints().latest().unwrap().clone();
        std::fs::write(session.checkpoints().path_of(&latest), b"not a checkpoint").unwrap();
    }

    let result = TrainingSession::open_with_metrics(config, Device::Cpu, Box::new(NullMetricsSink));
    assert!(matches!(result, Err(TrainError::Restore { .. })));
}

#[test]
fn checkpoint_from_other_architecture_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut session = TrainingSession::open_with_metrics(
            tiny_config(dir.path()),
            Device::Cpu,
            Box::new(NullMetricsSink),
        )
        .unwrap();
        session.save_checkpoint().unwrap();
    }

    let wider = TrainConfig { base_width: 3, ..tiny_config(dir.path()) };
    let result = TrainingSession::open_with_metrics(wider, Device::Cpu, Box::new(NullMetricsSink));
    assert!(matches!(result, Err(TrainError::Restore { .. })));
}

#[test]
fn full_run_writes_all_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrainConfig { num_test_images: 2, epochs: 2, ..tiny_config(dir.path()) };
    let source: Arc<dyn ImageSource> = Arc::new(ConstantImages::new(6, 32, 1.0).unwrap());

    let summary = train(config.clone(), TorchDevice::Cpu, source).unwrap();
    assert_eq!(summary.epochs_run, 2);
    assert_eq!(summary.steps_applied, 4);
    assert_eq!(summary.skipped_batches, 0);

    let images = config.image_dir();
    for epoch in 1..=2 {
        assert!(images.join(format!("sample_at_epoch_{:04}.png", epoch)).exists());
        assert!(images.join(format!("reconstruction_at_epoch_{:04}.png", epoch)).exists());
    }

    for role in Role::ALL {
        assert!(config.model_dir().join(format!("{}.safetensors", role)).exists());
        assert!(config.model_dir().join(format!("{}.json", role)).exists());
    }

    let metrics = std::fs::read_to_string(config.metrics_path()).unwrap();
    assert_eq!(metrics.lines().count(), 1 + 4);
    assert!(config.checkpoint_dir().join("checkpoints.json").exists());
}

#[test]
fn trailing_partial_batch_is_counted_as_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrainConfig { num_updates_per_batch: 3, ..tiny_config(dir.path()) };
    let data = loader(3, 2);
    let mut session =
        TrainingSession::open_with_metrics(config, Device::Cpu, Box::new(NullMetricsSink)).unwrap();

    let summary = Trainer::new(&mut session, &data).with_progress(false).run().unwrap();
    assert_eq!(summary.steps_applied, 3);
    assert_eq!(summary.skipped_batches, 1);
}

#[test]
fn checkpoint_failures_are_soft_mid_epoch_and_fatal_at_epoch_end() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrainConfig { checkpoint_every: 1, ..tiny_config(dir.path()) };
    let checkpoint_dir = config.checkpoint_dir();
    let data = loader(4, 2);
    let mut session =
        TrainingSession::open_with_metrics(config, Device::Cpu, Box::new(NullMetricsSink)).unwrap();

    // A plain file where the checkpoint directory was makes every save fail
    std::fs::remove_dir_all(&checkpoint_dir).unwrap();
    std::fs::write(&checkpoint_dir, b"").unwrap();

    let mut trainer = Trainer::new(&mut session, &data).with_progress(false);
    let result = trainer.run();
    assert!(matches!(result, Err(TrainError::Checkpoint { .. })));

    let summary = trainer.summary().clone();
    assert_eq!(summary.failed_checkpoints, 2);
    assert_eq!(summary.steps_applied, 2);
    assert_eq!(summary.epochs_run, 0);
    assert_eq!(session.step(), 2);
}

/// Real images that turn every loss non-finite
struct NanImages {
    len: usize,
    shape: ImageShape,
}

impl ImageSource for NanImages {
    fn len(&self) -> usize {
        self.len
    }

    fn shape(&self) -> ImageShape {
        self.shape
    }

    fn load(&self, _index: usize) -> DataResult<Vec<f32>> {
        Ok(vec![f32::NAN; self.shape.len()])
    }

    fn name(&self) -> &str {
        "nan"
    }
}

#[test]
fn untrained_samples_are_rendered_before_the_first_step() {
    let dir = tempfile::tempdir().unwrap();
    let config = tiny_config(dir.path());
    let source: Arc<dyn ImageSource> =
        Arc::new(NanImages { len: 2, shape: ImageShape::square(32) });

    let result = train(config.clone(), TorchDevice::Cpu, source);
    assert!(matches!(result, Err(TrainError::NonFiniteLoss { step: 1, .. })));
    assert!(config.image_dir().join("sample_at_epoch_0001.png").exists());
    assert!(!config.checkpoint_dir().join("checkpoints.json").exists());
}
