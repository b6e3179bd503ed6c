//! Conversions between 8-bit pixels and the signed unit range the networks use.
//!
//! Images enter training as `u8` RGB, are mapped to `[-1, 1]`, and are mapped
//! back with `u8((x + 1) / 2 * 255)` for monitoring output.

use serde::{Deserialize, Serialize};

use crate::constants::{CHANNELS, IMAGE_SIZE};

/// Shape of a single image tensor in height-width-channel order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageShape {
    pub size: usize,
    pub channels: usize,
}

impl ImageShape {
    pub fn square(size: usize) -> Self {
        Self { size, channels: CHANNELS }
    }

    /// Number of scalar values in one image
    pub fn len(&self) -> usize {
        self.size * self.size * self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dimensions of a batch of `n` images, `[n, H, W, C]`
    pub fn batch_dims(&self, n: usize) -> [usize; 4] {
        [n, self.size, self.size, self.channels]
    }
}

impl Default for ImageShape {
    fn default() -> Self {
        Self::square(IMAGE_SIZE)
    }
}

/// Map an 8-bit channel value into `[-1, 1]`
#[inline]
pub fn byte_to_signed(byte: u8) -> f32 {
    byte as f32 / 127.5 - 1.0
}

/// Map a value in `[-1, 1]` to an 8-bit channel.
///
/// Truncates toward zero after scaling; out-of-range inputs saturate.
#[inline]
pub fn signed_to_byte(value: f32) -> u8 {
    let scaled = (value + 1.0) / 2.0 * 255.0;
    if scaled.is_nan() {
        return 0;
    }
    scaled.clamp(0.0, 255.0) as u8
}

/// Convert a whole interleaved RGB buffer into the signed unit range
pub fn bytes_to_signed(bytes: &[u8]) -> Vec<f32> {
    bytes.iter().copied().map(byte_to_signed).collect()
}

/// Convert a signed unit range buffer into interleaved 8-bit RGB
pub fn signed_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().copied().map(signed_to_byte).collect()
}
