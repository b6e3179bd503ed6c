//! Batching over an [`ImageSource`].
//!
//! The loader is restartable: [`DataLoader::epoch`] returns a fresh iterator
//! every time. The trailing batch is yielded even when it is shorter than the
//! batch size; rejecting it is the training step's job.

use std::sync::Arc;

use invgan_core::ImageShape;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::error::{DataError, DataResult};
use crate::source::ImageSource;

/// A batch of images stored contiguously as `[N, H, W, C]`
#[derive(Clone, Debug)]
pub struct ImageBatch {
    data: Vec<f32>,
    len: usize,
    shape: ImageShape,
}

impl ImageBatch {
    /// Concatenate individually loaded images into one batch
    pub fn from_images(images: Vec<Vec<f32>>, shape: ImageShape) -> DataResult<Self> {
        let len = images.len();
        let mut data = Vec::with_capacity(len * shape.len());
        for (i, image) in images.into_iter().enumerate() {
            if image.len() != shape.len() {
                return Err(DataError::invalid_value(
                    "image",
                    format!("image {} has {} values, expected {}", i, image.len(), shape.len()),
                ));
            }
            data.extend(image);
        }
        Ok(Self { data, len, shape })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn shape(&self) -> ImageShape {
        self.shape
    }

    /// `[N, H, W, C]`
    pub fn dims(&self) -> [usize; 4] {
        self.shape.batch_dims(self.len)
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

/// Batched, optionally shuffled view over an image source
pub struct DataLoader {
    source: Arc<dyn ImageSource>,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
}

impl DataLoader {
    pub fn new(source: Arc<dyn ImageSource>, batch_size: usize) -> DataResult<Self> {
        if batch_size == 0 {
            return Err(DataError::invalid_value("batch_size", "must be > 0"));
        }
        Ok(Self { source, batch_size, shuffle: false, seed: 0 })
    }

    /// Shuffle sample order each epoch, deterministically from `seed` and the epoch index
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle = true;
        self.seed = seed;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn len(&self) -> usize {
        self.source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }

    pub fn shape(&self) -> ImageShape {
        self.source.shape()
    }

    /// Batches per epoch, counting a trailing partial batch
    pub fn num_batches(&self) -> usize {
        self.source.len().div_ceil(self.batch_size)
    }

    /// Iterate one epoch of batches
    pub fn epoch(&self, epoch: usize) -> Batches<'_> {
        let mut indices: Vec<usize> = (0..self.source.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed ^ (epoch as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
            indices.shuffle(&mut rng);
        }
        Batches { loader: self, indices, cursor: 0 }
    }

    /// Load the entire source as a single batch
    pub fn load_all(&self) -> DataResult<ImageBatch> {
        let indices: Vec<usize> = (0..self.source.len()).collect();
        self.load_indices(&indices)
    }

    fn load_indices(&self, indices: &[usize]) -> DataResult<ImageBatch> {
        let images = indices
            .par_iter()
            .map(|&i| self.source.load(i))
            .collect::<DataResult<Vec<_>>>()?;
        ImageBatch::from_images(images, self.source.shape())
    }
}

/// Iterator returned by [`DataLoader::epoch`]
pub struct Batches<'a> {
    loader: &'a DataLoader,
    indices: Vec<usize>,
    cursor: usize,
}

impl Iterator for Batches<'_> {
    type Item = DataResult<ImageBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.indices.len() {
            return None;
        }
        let end = (self.cursor + self.loader.batch_size).min(self.indices.len());
        let batch = self.loader.load_indices(&self.indices[self.cursor..end]);
        self.cursor = end;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.indices.len() - self.cursor).div_ceil(self.loader.batch_size);
        (remaining, Some(remaining))
    }
}
