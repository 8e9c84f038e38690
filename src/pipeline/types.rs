//! Core types for the pipeline system

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Rational time base of a stream: one tick lasts `num / den` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeBase {
    pub num: i32,
    pub den: i32,
}

impl TimeBase {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// Convert a tick count into seconds
    pub fn seconds(&self, ticks: i64) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        ticks as f64 * self.num as f64 / self.den as f64
    }

    /// Convert a tick count into a duration, clamping negatives to zero
    pub fn duration(&self, ticks: i64) -> Duration {
        Duration::from_secs_f64(self.seconds(ticks).max(0.0))
    }
}

impl std::fmt::Display for TimeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Kind of media data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Video frame data
    Video,
    /// Audio sample data
    Audio,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => write!(f, "video"),
            MediaKind::Audio => write!(f, "audio"),
        }
    }
}

impl std::str::FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "video" => Ok(MediaKind::Video),
            "audio" => Ok(MediaKind::Audio),
            other => Err(format!("unknown media kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed 8-bit RGB, 3 bytes per pixel
    Rgb24,
    /// Planar YUV 4:2:0: Y (w*h) then U and V (w/2 * h/2), no padding
    Yuv420p,
}

/// Decoded picture
#[derive(Clone)]
pub struct VideoFrame {
    pub pts: Option<i64>,
    pub time_base: TimeBase,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Bytes,
}

/// Decoded audio, packed signed 16-bit samples
#[derive(Clone)]
pub struct AudioFrame {
    pub pts: Option<i64>,
    pub time_base: TimeBase,
    pub sample_rate: u32,
    pub channels: u16,
    /// Interleaved samples, `sample_count() * channels` entries
    pub samples: Vec<i16>,
}

impl AudioFrame {
    /// Number of samples per channel
    pub fn sample_count(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }
}

/// A decoded audio or video sample set.
///
/// Tagged by kind so the distributor can route without inspecting payloads.
#[derive(Clone)]
pub enum Frame {
    Video(VideoFrame),
    Audio(AudioFrame),
}

impl Frame {
    pub fn kind(&self) -> MediaKind {
        match self {
            Frame::Video(_) => MediaKind::Video,
            Frame::Audio(_) => MediaKind::Audio,
        }
    }

    pub fn pts(&self) -> Option<i64> {
        match self {
            Frame::Video(f) => f.pts,
            Frame::Audio(f) => f.pts,
        }
    }

    pub fn time_base(&self) -> TimeBase {
        match self {
            Frame::Video(f) => f.time_base,
            Frame::Audio(f) => f.time_base,
        }
    }

    fn set_pts(&mut self, pts: i64) {
        match self {
            Frame::Video(f) => f.pts = Some(pts),
            Frame::Audio(f) => f.pts = Some(pts),
        }
    }
}

/// Undecoded compressed unit, produced when the pipeline runs without decoding
#[derive(Clone)]
pub struct Packet {
    pub kind: MediaKind,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub time_base: TimeBase,
    pub is_keyframe: bool,
    pub data: Bytes,
}

/// Unit produced by a media source
#[derive(Clone)]
pub enum Media {
    Frame(Frame),
    Packet(Packet),
}

impl Media {
    pub fn kind(&self) -> MediaKind {
        match self {
            Media::Frame(frame) => frame.kind(),
            Media::Packet(packet) => packet.kind,
        }
    }

    pub fn pts(&self) -> Option<i64> {
        match self {
            Media::Frame(frame) => frame.pts(),
            Media::Packet(packet) => packet.pts,
        }
    }

    pub fn time_base(&self) -> TimeBase {
        match self {
            Media::Frame(frame) => frame.time_base(),
            Media::Packet(packet) => packet.time_base,
        }
    }

    /// Presentation time in seconds, if defined
    pub fn seconds(&self) -> Option<f64> {
        self.pts().map(|pts| self.time_base().seconds(pts))
    }

    /// Move the timeline of this item by `-offset` ticks.
    /// Decode timestamps of packets move together with the presentation timestamp.
    pub(crate) fn shift(&mut self, offset: i64) {
        match self {
            Media::Frame(frame) => {
                if let Some(pts) = frame.pts() {
                    frame.set_pts(pts - offset);
                }
            }
            Media::Packet(packet) => {
                packet.pts = packet.pts.map(|pts| pts - offset);
                packet.dts = packet.dts.map(|dts| dts - offset);
            }
        }
    }

    /// Size of the payload in bytes
    pub fn size(&self) -> usize {
        match self {
            Media::Frame(Frame::Video(f)) => f.data.len(),
            Media::Frame(Frame::Audio(f)) => f.samples.len() * 2,
            Media::Packet(p) => p.data.len(),
        }
    }
}

impl std::fmt::Debug for Media {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("Media");
        debug
            .field("kind", &self.kind())
            .field("pts", &self.pts())
            .field("time_base", &self.time_base())
            .field("size", &self.size());

        match self {
            Media::Frame(Frame::Video(v)) => {
                debug.field("width", &v.width).field("height", &v.height);
            }
            Media::Frame(Frame::Audio(a)) => {
                debug
                    .field("sample_rate", &a.sample_rate)
                    .field("channels", &a.channels)
                    .field("samples", &a.sample_count());
            }
            Media::Packet(p) => {
                debug.field("keyframe", &p.is_keyframe);
            }
        }

        debug.finish()
    }
}

/// Item travelling through a track queue
#[derive(Debug, Clone)]
pub enum QueueItem {
    Media(Media),
    EndOfStream,
}

/// Identifies one of the streams of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub index: usize,
    pub kind: MediaKind,
    pub time_base: TimeBase,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_base_conversion() {
        let tb = TimeBase::new(1, 90_000);
        assert_eq!(tb.seconds(90_000), 1.0);
        assert_eq!(tb.duration(45_000), Duration::from_millis(500));
        assert_eq!(tb.duration(-10), Duration::ZERO);
        assert_eq!(TimeBase::new(1, 0).seconds(10), 0.0);
    }

    #[test]
    fn test_shift_moves_packet_dts() {
        let mut media = Media::Packet(Packet {
            kind: MediaKind::Video,
            pts: Some(3000),
            dts: Some(2000),
            time_base: TimeBase::new(1, 90_000),
            is_keyframe: true,
            data: Bytes::from_static(&[0, 0, 0, 1, 0x65]),
        });
        media.shift(2000);

        match media {
            Media::Packet(p) => {
                assert_eq!(p.pts, Some(1000));
                assert_eq!(p.dts, Some(0));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_media_kind_parse() {
        assert_eq!("Video".parse::<MediaKind>(), Ok(MediaKind::Video));
        assert_eq!("audio".parse::<MediaKind>(), Ok(MediaKind::Audio));
        assert!("subtitle".parse::<MediaKind>().is_err());
    }
}
