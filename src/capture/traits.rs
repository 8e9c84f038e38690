//! Traits for media sources

use super::region::CaptureRegion;
use crate::pipeline::types::{Media, MediaKind, StreamDescriptor};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The source is not ready to produce data yet; retry shortly
    #[error("resource temporarily unavailable")]
    Again,

    #[error("end of stream")]
    EndOfStream,

    #[error("source does not support seeking")]
    NotSeekable,

    #[error("failed to open source: {0}")]
    Open(String),

    #[error("decode error: {0}")]
    Decode(String),
}

/// How the source should present its data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceOptions {
    /// Decode into frames; `false` yields the compressed packets as read
    pub decode: bool,
    /// Attach the audio stream if the source has one
    pub audio: bool,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            decode: true,
            audio: true,
        }
    }
}

/// A blocking producer of frames or packets.
///
/// Owned and driven by exactly one decode thread. `next` must return within
/// [`SOURCE_POLL_INTERVAL`](crate::assets::SOURCE_POLL_INTERVAL), answering
/// [`SourceError::Again`] when nothing is ready, so the caller can observe quit
/// requests.
pub trait MediaSource: Send {
    fn name(&self) -> &str;

    /// At most one audio and one video stream
    fn streams(&self) -> &[StreamDescriptor];

    fn next(&mut self) -> Result<Media, SourceError>;

    /// Live devices produce at real-time rate and cannot seek
    fn is_live(&self) -> bool;

    fn can_seek(&self) -> bool;

    fn seek_to_start(&mut self) -> Result<(), SourceError>;

    /// Release the underlying handle. Idempotent.
    fn close(&mut self);

    fn has_stream(&self, kind: MediaKind) -> bool {
        self.streams().iter().any(|s| s.kind == kind)
    }
}

pub type SourceFactory = Box<
    dyn Fn(&CaptureRegion, &SourceOptions) -> Result<Box<dyn MediaSource>, SourceError>
        + Send
        + Sync,
>;
