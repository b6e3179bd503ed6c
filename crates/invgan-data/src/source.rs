//! Image sources the trainer pulls real samples from.
//!
//! Every source yields images as interleaved `[H, W, C]` `f32` buffers in
//! `[-1, 1]`. Sources are finite and random-access, which makes them
//! restartable: an epoch is just another pass over `0..len()`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::imageops::FilterType;
use invgan_core::pixels::bytes_to_signed;
use invgan_core::ImageShape;

use crate::error::{DataError, DataResult};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Random-access collection of real images
pub trait ImageSource: Send + Sync {
    /// Total number of images
    fn len(&self) -> usize;

    /// Shape every loaded image has
    fn shape(&self) -> ImageShape;

    /// Load image `index` as an interleaved buffer in `[-1, 1]`
    fn load(&self, index: usize) -> DataResult<Vec<f32>>;

    /// Human-readable name for logging
    fn name(&self) -> &str;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Directory of PNG/JPEG files, resized to a square target on load
pub struct ImageFolder {
    root: PathBuf,
    files: Vec<PathBuf>,
    shape: ImageShape,
    name: String,
}

impl ImageFolder {
    /// Scan `root` (non-recursively) for image files, sorted by file name
    pub fn open(root: &Path, size: usize) -> DataResult<Self> {
        if !root.is_dir() {
            return Err(DataError::NotFound { path: root.to_path_buf() });
        }

        let mut files = Vec::new();
        let entries = std::fs::read_dir(root).map_err(|e| DataError::io(root, e))?;
        for entry in entries {
            let path = entry.map_err(|e| DataError::io(root, e))?.path();
            let is_image = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if path.is_file() && is_image {
                files.push(path);
            }
        }

        if files.is_empty() {
            return Err(DataError::Empty { path: root.to_path_buf() });
        }
        files.sort();

        tracing::info!("Found {} images in {:?}", files.len(), root);

        Ok(Self {
            root: root.to_path_buf(),
            files,
            shape: ImageShape::square(size),
            name: root.display().to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }
}

impl ImageSource for ImageFolder {
    fn len(&self) -> usize {
        self.files.len()
    }

    fn shape(&self) -> ImageShape {
        self.shape
    }

    fn load(&self, index: usize) -> DataResult<Vec<f32>> {
        let path = self
            .files
            .get(index)
            .ok_or(DataError::IndexOutOfBounds { index, len: self.files.len() })?;

        let decoded = image::open(path)
            .map_err(|source| DataError::Decode { path: path.clone(), source })?
            .to_rgb8();

        let size = self.shape.size as u32;
        let rgb = if decoded.dimensions() == (size, size) {
            decoded
        } else {
            image::imageops::resize(&decoded, size, size, FilterType::Triangle)
        };

        Ok(bytes_to_signed(rgb.as_raw()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Synthetic source of identical constant-colour images
#[derive(Clone, Debug)]
pub struct ConstantImages {
    len: usize,
    shape: ImageShape,
    value: f32,
}

impl ConstantImages {
    pub fn new(len: usize, size: usize, value: f32) -> DataResult<Self> {
        if !(-1.0..=1.0).contains(&value) {
            return Err(DataError::invalid_value(
                "value",
                format!("{} is outside [-1, 1]", value),
            ));
        }
        Ok(Self { len, shape: ImageShape::square(size), value })
    }

    pub fn value(&self) -> f32 {
        self.value
    }
}

impl ImageSource for ConstantImages {
    fn len(&self) -> usize {
        self.len
    }

    fn shape(&self) -> ImageShape {
        self.shape
    }

    fn load(&self, index: usize) -> DataResult<Vec<f32>> {
        if index >= self.len {
            return Err(DataError::IndexOutOfBounds { index, len: self.len });
        }
        Ok(vec![self.value; self.shape.len()])
    }

    fn name(&self) -> &str {
        "constant"
    }
}

/// Contiguous window `[start, start + len)` of another source
pub struct Subset {
    inner: Arc<dyn ImageSource>,
    start: usize,
    len: usize,
    name: String,
}

impl Subset {
    /// The first `n` images of `inner` (fewer if it is shorter)
    pub fn take(inner: Arc<dyn ImageSource>, n: usize) -> Self {
        let len = n.min(inner.len());
        let name = format!("{}[..{}]", inner.name(), len);
        Self { inner, start: 0, len, name }
    }

    /// Everything after the first `n` images of `inner`
    pub fn skip(inner: Arc<dyn ImageSource>, n: usize) -> Self {
        let start = n.min(inner.len());
        let len = inner.len() - start;
        let name = format!("{}[{}..]", inner.name(), start);
        Self { inner, start, len, name }
    }
}

impl ImageSource for Subset {
    fn len(&self) -> usize {
        self.len
    }

    fn shape(&self) -> ImageShape {
        self.inner.shape()
    }

    fn load(&self, index: usize) -> DataResult<Vec<f32>> {
        if index >= self.len {
            return Err(DataError::IndexOutOfBounds { index, len: self.len });
        }
        self.inner.load(self.start + index)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Split off the first `n` images for monitoring; the rest is for training
pub fn split_holdout(source: Arc<dyn ImageSource>, n: usize) -> (Subset, Subset) {
    (Subset::take(source.clone(), n), Subset::skip(source, n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_constant_images_rejects_out_of_range_value() {
        assert!(ConstantImages::new(2, 8, 1.5).is_err());
        assert!(ConstantImages::new(2, 8, -1.0).is_ok());
    }

    #[test]
    fn test_constant_images_load() {
        let src = ConstantImages::new(3, 4, 0.5).unwrap();
        let img = src.load(2).unwrap();
        assert_eq!(img.len(), 4 * 4 * 3);
        assert!(img.iter().all(|&v| v == 0.5));
        assert!(matches!(src.load(3), Err(DataError::IndexOutOfBounds { index: 3, len: 3 })));
    }

    #[test]
    fn test_split_holdout_partitions_source() {
        let src: Arc<dyn ImageSource> = Arc::new(ConstantImages::new(10, 4, 0.0).unwrap());
        let (test, train) = split_holdout(src, 8);
        assert_eq!(test.len(), 8);
        assert_eq!(train.len(), 2);
        assert!(train.load(1).is_ok());
        assert!(train.load(2).is_err());
    }

    #[test]
    fn test_split_holdout_larger_than_source() {
        let src: Arc<dyn ImageSource> = Arc::new(ConstantImages::new(3, 4, 0.0).unwrap());
        let (test, train) = split_holdout(src, 8);
        assert_eq!(test.len(), 3);
        assert!(train.is_empty());
    }

    #[test]
    fn test_image_folder_loads_and_resizes() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::from_pixel(16, 16, Rgb([255, 0, 255]))
            .save(dir.path().join("b.png"))
            .unwrap();
        RgbImage::from_pixel(8, 8, Rgb([0, 0, 0]))
            .save(dir.path().join("a.png"))
            .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not an image").unwrap();

        let folder = ImageFolder::open(dir.path(), 8).unwrap();
        assert_eq!(folder.len(), 2);
        assert!(folder.files()[0].ends_with("a.png"));

        let black = folder.load(0).unwrap();
        assert!(black.iter().all(|&v| v == -1.0));

        let magenta = folder.load(1).unwrap();
        assert_eq!(magenta.len(), 8 * 8 * 3);
        assert_relative_eq!(magenta[0], 1.0);
        assert_relative_eq!(magenta[1], -1.0);
        assert_relative_eq!(magenta[2], 1.0);
    }

    #[test]
    fn test_image_folder_empty_dir_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ImageFolder::open(dir.path(), 8),
            Err(DataError::Empty { .. })
        ));
    }
}
