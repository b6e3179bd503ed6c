pub mod constants;
pub mod pixels;

pub use pixels::{byte_to_signed, signed_to_byte, ImageShape};

#[cfg(test)]
mod tests;
