//! Monitoring renderer: tiles image batches into PNG grids

use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use invgan_core::pixels::signed_to_bytes;
use tch::{Device, Kind, Tensor};

use crate::error::{TrainError, TrainResult};

/// Tiles per grid row
pub const TILES_PER_ROW: usize = 4;

/// Writes generated samples and reconstructions under one directory
pub struct MonitorRenderer {
    dir: PathBuf,
    tiles_per_row: usize,
}

impl MonitorRenderer {
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf(), tiles_per_row: TILES_PER_ROW }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn sample_path(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("sample_at_epoch_{:04}.png", epoch))
    }

    pub fn reconstruction_path(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("reconstruction_at_epoch_{:04}.png", epoch))
    }

    /// Render a `[N, H, W, 3]` batch to `sample_at_epoch_{epoch}.png`
    pub fn save_samples(&self, images: &Tensor, epoch: usize) -> TrainResult<PathBuf> {
        let path = self.sample_path(epoch);
        save_grid(images, &path, self.tiles_per_row)?;
        Ok(path)
    }

    /// Render `(original, reconstruction)` pairs side by side to
    /// `reconstruction_at_epoch_{epoch}.png`
    pub fn save_pairs(
        &self,
        originals: &Tensor,
        reconstructions: &Tensor,
        epoch: usize,
    ) -> TrainResult<PathBuf> {
        if originals.size() != reconstructions.size() {
            return Err(TrainError::ShapeMismatch {
                what: "reconstructions",
                expected: originals.size(),
                actual: reconstructions.size(),
            });
        }
        let interleaved = Tensor::stack(&[originals, reconstructions], 1).flatten(0, 1);
        let path = self.reconstruction_path(epoch);
        save_grid(&interleaved, &path, self.tiles_per_row)?;
        Ok(path)
    }
}

/// Tile a `[N, S, S, 3]` batch into a PNG at `path`
pub fn save_grid(images: &Tensor, path: &Path, per_row: usize) -> TrainResult<()> {
    let (n, size, data) = tensor_to_images(images)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    tile(&data, n, size, per_row).save(path)?;
    tracing::debug!("Wrote {:?}", path);
    Ok(())
}

/// Flatten a `[N, S, S, 3]` tensor to host memory
fn tensor_to_images(images: &Tensor) -> TrainResult<(usize, usize, Vec<f32>)> {
    let dims = images.size();
    match dims.as_slice() {
        &[n, h, w, 3] if h == w => {
            let data = Vec::<f32>::try_from(
                images.detach().to_device(Device::Cpu).to_kind(Kind::Float).contiguous().view([-1]),
            )?;
            Ok((n as usize, h as usize, data))
        }
        _ => Err(TrainError::ShapeMismatch {
            what: "rendered images",
            expected: vec![-1, -1, -1, 3],
            actual: dims,
        }),
    }
}

/// Lay `n` square images out in rows of `per_row`, mapping `[-1, 1]` to bytes
pub fn tile(data: &[f32], n: usize, size: usize, per_row: usize) -> RgbImage {
    let cols = n.clamp(1, per_row.max(1));
    let rows = n.div_ceil(cols).max(1);
    let mut grid = RgbImage::new((cols * size) as u32, (rows * size) as u32);
    let image_len = size * size * 3;

    for (i, image) in data.chunks_exact(image_len).take(n).enumerate() {
        let x0 = (i % cols) * size;
        let y0 = (i / cols) * size;
        for (p, px) in signed_to_bytes(image).chunks_exact(3).enumerate() {
            let x = (x0 + p % size) as u32;
            let y = (y0 + p / size) as u32;
            grid.put_pixel(x, y, Rgb([px[0], px[1], px[2]]));
        }
    }
    grid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_white_batch_decodes_to_255() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = MonitorRenderer::new(dir.path());
        let images = Tensor::ones([16, 8, 8, 3], (Kind::Float, Device::Cpu));

        let path = renderer.save_samples(&images, 3).unwrap();
        assert!(path.ends_with("sample_at_epoch_0003.png"));

        let decoded = image::open(&path).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (32, 32));
        assert!(decoded.pixels().all(|p| p.0 == [255, 255, 255]));
    }

    #[test]
    fn pairs_are_placed_side_by_side() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = MonitorRenderer::new(dir.path());
        let originals = Tensor::ones([2, 4, 4, 3], (Kind::Float, Device::Cpu));
        let reconstructions = -Tensor::ones([2, 4, 4, 3], (Kind::Float, Device::Cpu));

        let path = renderer.save_pairs(&originals, &reconstructions, 1).unwrap();
        let decoded = image::open(&path).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (16, 4));
        assert_eq!(decoded.get_pixel(0, 0).0, [255, 255, 255]);
        assert_eq!(decoded.get_pixel(4, 0).0, [0, 0, 0]);
        assert_eq!(decoded.get_pixel(8, 0).0, [255, 255, 255]);
        assert_eq!(decoded.get_pixel(12, 0).0, [0, 0, 0]);
    }

    #[test]
    fn mismatched_pairs_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = MonitorRenderer::new(dir.path());
        let a = Tensor::ones([2, 4, 4, 3], (Kind::Float, Device::Cpu));
        let b = Tensor::ones([1, 4, 4, 3], (Kind::Float, Device::Cpu));
        assert!(renderer.save_pairs(&a, &b, 0).is_err());
    }

    #[test]
    fn tile_grid_layout() {
        // 5 images: two rows of four, black padding in the unused cells
        let data = vec![1.0f32; 5 * 2 * 2 * 3];
        let grid = tile(&data, 5, 2, 4);
        assert_eq!(grid.dimensions(), (8, 4));
        assert_eq!(grid.get_pixel(0, 2).0, [255, 255, 255]);
        assert_eq!(grid.get_pixel(2, 2).0, [0, 0, 0]);
    }
}
