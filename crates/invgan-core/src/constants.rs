/// Side length of the square RGB images the networks consume and produce
pub const IMAGE_SIZE: usize = 128;

/// Colour channels per pixel
pub const CHANNELS: usize = 3;

/// Dimension of the latent (noise) vector fed to the generator
pub const Z_DIM: usize = 128;

/// Base layer width shared by all three networks
pub const LATENT_DIM: usize = 64;

/// Real images per training batch
pub const BATCH_SIZE: usize = 1024;

/// Joint updates applied to the same batch before advancing
pub const NUM_UPDATES_PER_BATCH: usize = 4;

/// Weight of the latent-cycle term in the inverter loss
pub const DIVERGENCE_LAMBDA: f64 = 0.1;

/// Weight of the critic gradient penalty
pub const GRAD_PENALTY_FACTOR: f64 = 10.0;

/// Adam learning rate used by all three optimizers
pub const LEARNING_RATE: f64 = 1e-4;

/// Checkpoints retained on disk
pub const CHECKPOINTS_TO_KEEP: usize = 2;

/// Batch-index cadence of mid-epoch checkpoint saves and renders
pub const CHECKPOINT_EVERY: usize = 4;

/// Leading dataset samples held out for reconstruction monitoring
pub const NUM_TEST_IMAGES: usize = 8;

/// Fixed latent vectors rendered for generation monitoring
pub const NUM_EXAMPLES_TO_GENERATE: usize = 16;

/// Training epochs
pub const EPOCHS: usize = 50;

/// Default seed for every random draw in a run
pub const DEFAULT_SEED: u64 = 42;

/// Elements in one image tensor
pub const fn image_len(size: usize) -> usize {
    size * size * CHANNELS
}
