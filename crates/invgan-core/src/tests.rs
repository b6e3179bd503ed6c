use approx::assert_relative_eq;

use crate::constants::*;
use crate::pixels::*;

#[test]
fn test_pixel_extremes_map_to_unit_range() {
    assert_relative_eq!(byte_to_signed(0), -1.0);
    assert_relative_eq!(byte_to_signed(255), 1.0);
}

#[test]
fn test_white_and_black_render_exactly() {
    assert_eq!(signed_to_byte(1.0), 255);
    assert_eq!(signed_to_byte(-1.0), 0);
}

#[test]
fn test_out_of_range_values_saturate() {
    assert_eq!(signed_to_byte(3.0), 255);
    assert_eq!(signed_to_byte(-7.5), 0);
    assert_eq!(signed_to_byte(f32::NAN), 0);
}

#[test]
fn test_byte_roundtrip_is_lossless() {
    // Truncation after scaling must not drift any byte downward by more than one step
    for b in 0..=255u8 {
        let back = signed_to_byte(byte_to_signed(b));
        assert!(b.abs_diff(back) <= 1, "byte {} came back as {}", b, back);
    }
}

#[test]
fn test_buffer_conversion_preserves_length() {
    let bytes = vec![0u8, 128, 255, 64, 32, 16];
    let signed = bytes_to_signed(&bytes);
    assert_eq!(signed.len(), bytes.len());
    assert_eq!(signed_to_bytes(&signed).len(), bytes.len());
}

#[test]
fn test_default_shape_matches_constants() {
    let shape = ImageShape::default();
    assert_eq!(shape.size, IMAGE_SIZE);
    assert_eq!(shape.channels, CHANNELS);
    assert_eq!(shape.len(), image_len(IMAGE_SIZE));
    assert_eq!(shape.batch_dims(4), [4, 128, 128, 3]);
}
