//! Frame decoding and pixel conversion
//!
//! FFmpeg decoders are only built with the `ffmpeg` feature; the conversion
//! helpers are always available for the preview path.

pub mod convert;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

pub use convert::{to_rgb24, yuv420p_to_rgb24};
