//! WGAN-GP training of a generator, a critic and an inverter on libtorch.
//!
//! The [`session::TrainingSession`] owns all mutable state of a run; the
//! [`trainer`] module drives it over a [`invgan_data::DataLoader`] with
//! periodic checkpoints and monitoring renders.

pub mod checkpoint;
pub mod config;
pub mod device;
pub mod error;
pub mod loss;
pub mod metrics;
pub mod network;
pub mod optim;
pub mod penalty;
pub mod render;
pub mod session;
pub mod trainer;

pub use checkpoint::CheckpointStore;
pub use config::{PenaltyTarget, TrainConfig};
pub use device::TorchDevice;
pub use error::{ConfigError, TrainError, TrainResult};
pub use metrics::{CsvMetricsSink, MemoryMetricsSink, MetricsSink, NullMetricsSink, StepMetrics};
pub use network::{Architecture, Mode, Network, NetworkDescription, Role};
pub use optim::{Adam, AdamConfig};
pub use penalty::gradient_penalty;
pub use render::{save_grid, MonitorRenderer};
pub use session::{sample_noise, SessionState, TrainingSession};
pub use trainer::{train, TrainSummary, Trainer};
