pub mod error;
pub mod loader;
pub mod manifest;
pub mod source;

pub use error::{DataError, DataResult};
pub use loader::{Batches, DataLoader, ImageBatch};
pub use manifest::{CheckpointEntry, CheckpointManifest};
pub use source::{split_holdout, ConstantImages, ImageFolder, ImageSource, Subset};
