//! Encoders for publishing decoded frames
//!
//! A published track carries compressed samples. When the pipeline decodes,
//! the track writer runs every frame through a [`SampleEncoder`] first. The
//! FFmpeg encoders are only built with the `ffmpeg` feature.

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

use crate::pipeline::types::{Frame, MediaKind, Packet};

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("no {0} encoder is available")]
    Unavailable(MediaKind),

    #[error("cannot encode a {got} frame with the {expected} encoder")]
    WrongKind { expected: MediaKind, got: MediaKind },

    #[error("encoder failure: {0}")]
    Codec(String),
}

/// Turns decoded frames into compressed packets.
///
/// One encoder per track. A frame may complete zero or more packets.
pub trait SampleEncoder: Send {
    fn kind(&self) -> MediaKind;

    fn encode(&mut self, frame: &Frame) -> Result<Vec<Packet>, EncodeError>;
}

/// Whether this build can encode decoded frames
pub fn available() -> bool {
    cfg!(feature = "ffmpeg")
}

/// Encoder for a published track of `kind`: H.264 for video, Opus for audio
#[cfg(feature = "ffmpeg")]
pub fn for_kind(kind: MediaKind) -> Result<Box<dyn SampleEncoder>, EncodeError> {
    Ok(match kind {
        MediaKind::Video => Box::new(ffmpeg::H264Encoder::new()),
        MediaKind::Audio => Box::new(ffmpeg::OpusEncoder::new()?),
    })
}

#[cfg(not(feature = "ffmpeg"))]
pub fn for_kind(kind: MediaKind) -> Result<Box<dyn SampleEncoder>, EncodeError> {
    Err(EncodeError::Unavailable(kind))
}
