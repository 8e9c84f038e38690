//! Deterministic test source: moving colour bars and a sine tone.
//!
//! Stands in for a capture device when no FFmpeg backend is available, and
//! drives every pipeline test. Fault injection hooks reproduce the failure
//! modes of real devices.

use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::assets::{SOURCE_POLL_INTERVAL, VIDEO_TIME_BASE_DEN};
use crate::capture::region::CaptureRegion;
use crate::capture::traits::{MediaSource, SourceError, SourceFactory, SourceOptions};
use crate::pipeline::types::{
    AudioFrame, Frame, Media, MediaKind, Packet, PixelFormat, StreamDescriptor, TimeBase,
    VideoFrame,
};

const AUDIO_RATE: u32 = 44_100;
const AUDIO_FRAME_SAMPLES: u64 = 1024;
const PACKET_AUDIO_RATE: u32 = 48_000;
const PACKET_AUDIO_SAMPLES: u64 = 960;
const TONE_HZ: f64 = 440.0;

// the pattern is laid out on a virtual 1920-wide desktop and cropped by the region
const BAR_WIDTH: i64 = 240;
const BAND_HEIGHT: i64 = 64;

const BARS: [[u8; 3]; 8] = [
    [255, 255, 255],
    [255, 255, 0],
    [0, 255, 255],
    [0, 255, 0],
    [255, 0, 255],
    [255, 0, 0],
    [0, 0, 255],
    [16, 16, 16],
];

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    /// Top-left corner of the captured area on the virtual desktop
    pub offset_x: i32,
    pub offset_y: i32,
    pub framerate: u32,
    /// `None` produces forever
    pub duration: Option<Duration>,
    pub audio: bool,
    /// Pace output to wall-clock time like a capture device (not seekable)
    pub live: bool,
    /// Emit compressed-looking packets instead of frames
    pub encoded: bool,
    /// Timestamp of the first video frame, in 1/90000 ticks. Devices rarely start at zero.
    pub pts_origin: i64,
    /// Every Nth video frame carries no timestamp
    pub drop_pts_every: Option<u64>,
    /// Every Nth read answers "try again"
    pub transient_every: Option<u64>,
    /// Fail with a decode error once this many items were produced
    pub fail_after: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            offset_x: 0,
            offset_y: 0,
            framerate: 30,
            duration: None,
            audio: true,
            live: true,
            encoded: false,
            pts_origin: 9_000_000,
            drop_pts_every: None,
            transient_every: None,
            fail_after: None,
        }
    }
}

impl SyntheticConfig {
    /// A finite, seekable clip that behaves like a media file
    pub fn clip(duration: Duration) -> Self {
        Self {
            duration: Some(duration),
            live: false,
            ..Default::default()
        }
    }

    fn apply(&self, region: &CaptureRegion, options: &SourceOptions) -> Self {
        Self {
            width: region.width.max(1) as u32,
            height: region.height.max(1) as u32,
            offset_x: region.offset_x,
            offset_y: region.offset_y,
            framerate: region.framerate.max(1),
            audio: self.audio && options.audio,
            encoded: self.encoded || !options.decode,
            ..self.clone()
        }
    }
}

pub struct SyntheticSource {
    cfg: SyntheticConfig,
    name: String,
    streams: Vec<StreamDescriptor>,
    video_index: u64,
    audio_samples: u64,
    reads: u64,
    produced: u64,
    started: Option<Instant>,
    closed: Arc<AtomicBool>,
}

impl SyntheticSource {
    pub fn new(cfg: SyntheticConfig) -> Self {
        let mut streams = vec![StreamDescriptor {
            index: 0,
            kind: MediaKind::Video,
            time_base: Self::video_time_base(),
        }];
        if cfg.audio {
            streams.push(StreamDescriptor {
                index: 1,
                kind: MediaKind::Audio,
                time_base: Self::audio_time_base(&cfg),
            });
        }

        Self {
            name: format!("testsrc {}x{}@{}", cfg.width, cfg.height, cfg.framerate),
            cfg,
            streams,
            video_index: 0,
            audio_samples: 0,
            reads: 0,
            produced: 0,
            started: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Factory producing sources from `template`, sized by the requested region
    pub fn factory(template: SyntheticConfig) -> SourceFactory {
        Box::new(move |region, options| {
            Ok(Box::new(SyntheticSource::new(template.apply(region, options))) as Box<dyn MediaSource>)
        })
    }

    /// Flag raised once the source has been closed
    pub fn close_observer(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }

    fn video_time_base() -> TimeBase {
        TimeBase::new(1, VIDEO_TIME_BASE_DEN)
    }

    fn audio_time_base(cfg: &SyntheticConfig) -> TimeBase {
        TimeBase::new(1, Self::audio_rate(cfg) as i32)
    }

    fn audio_rate(cfg: &SyntheticConfig) -> u32 {
        if cfg.encoded { PACKET_AUDIO_RATE } else { AUDIO_RATE }
    }

    fn audio_frame_samples(&self) -> u64 {
        if self.cfg.encoded {
            PACKET_AUDIO_SAMPLES
        } else {
            AUDIO_FRAME_SAMPLES
        }
    }

    fn video_time(&self) -> f64 {
        self.video_index as f64 / self.cfg.framerate as f64
    }

    fn audio_time(&self) -> f64 {
        self.audio_samples as f64 / Self::audio_rate(&self.cfg) as f64
    }

    /// Hold a live source until `t` seconds after it started.
    /// Answers `Again` rather than blocking longer than one poll interval.
    fn wait_live(&mut self, t: f64) -> Result<(), SourceError> {
        let started = *self.started.get_or_insert_with(Instant::now);
        let due = started + Duration::from_secs_f64(t);
        let now = Instant::now();
        if due <= now {
            return Ok(());
        }
        let remaining = due - now;
        if remaining > SOURCE_POLL_INTERVAL {
            std::thread::sleep(SOURCE_POLL_INTERVAL);
            return Err(SourceError::Again);
        }
        std::thread::sleep(remaining);
        Ok(())
    }

    fn next_video(&mut self) -> Media {
        let index = self.video_index;
        self.video_index += 1;

        let ticks_per_frame = VIDEO_TIME_BASE_DEN as i64 / self.cfg.framerate as i64;
        let missing = self
            .cfg
            .drop_pts_every
            .is_some_and(|n| n > 0 && (index + 1) % n == 0);
        let pts = (!missing).then(|| self.cfg.pts_origin + index as i64 * ticks_per_frame);

        if self.cfg.encoded {
            let keyframe = index % self.cfg.framerate as u64 == 0;
            let mut data = vec![0u8, 0, 0, 1, if keyframe { 0x65 } else { 0x41 }];
            data.extend_from_slice(&index.to_be_bytes());
            return Media::Packet(Packet {
                kind: MediaKind::Video,
                pts,
                dts: pts,
                time_base: Self::video_time_base(),
                is_keyframe: keyframe,
                data: Bytes::from(data),
            });
        }

        Media::Frame(Frame::Video(VideoFrame {
            pts,
            time_base: Self::video_time_base(),
            width: self.cfg.width,
            height: self.cfg.height,
            format: PixelFormat::Rgb24,
            data: Bytes::from(self.draw_bars(index)),
        }))
    }

    /// Scrolling bars over alternating light and dark bands, sampled at the
    /// region's position on the virtual desktop
    fn draw_bars(&self, index: u64) -> Vec<u8> {
        let (w, h) = (self.cfg.width as usize, self.cfg.height as usize);
        let (ox, oy) = (self.cfg.offset_x as i64, self.cfg.offset_y as i64);
        let shift = index as i64 * 4;

        let mut image = Vec::with_capacity(w * h * 3);
        for y in 0..h as i64 {
            let dark = (y + oy).div_euclid(BAND_HEIGHT).rem_euclid(2) == 1;
            for x in 0..w as i64 {
                let bar = (x + ox + shift).div_euclid(BAR_WIDTH).rem_euclid(BARS.len() as i64);
                let [r, g, b] = BARS[bar as usize];
                if dark {
                    image.extend_from_slice(&[r / 2, g / 2, b / 2]);
                } else {
                    image.extend_from_slice(&[r, g, b]);
                }
            }
        }
        image
    }

    fn next_audio(&mut self) -> Media {
        let start = self.audio_samples;
        let count = self.audio_frame_samples();
        self.audio_samples += count;
        let rate = Self::audio_rate(&self.cfg);

        if self.cfg.encoded {
            let mut data = vec![0xFCu8];
            data.extend_from_slice(&start.to_be_bytes());
            return Media::Packet(Packet {
                kind: MediaKind::Audio,
                pts: Some(start as i64),
                dts: Some(start as i64),
                time_base: Self::audio_time_base(&self.cfg),
                is_keyframe: true,
                data: Bytes::from(data),
            });
        }

        let samples = (start..start + count)
            .map(|n| {
                let t = n as f64 / rate as f64;
                ((t * TONE_HZ * std::f64::consts::TAU).sin() * 8000.0) as i16
            })
            .collect();

        Media::Frame(Frame::Audio(AudioFrame {
            pts: Some(start as i64),
            time_base: Self::audio_time_base(&self.cfg),
            sample_rate: rate,
            channels: 1,
            samples,
        }))
    }
}

impl MediaSource for SyntheticSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    fn next(&mut self) -> Result<Media, SourceError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SourceError::Decode(String::from("source closed")));
        }

        self.reads += 1;
        if self
            .cfg
            .transient_every
            .is_some_and(|n| n > 0 && self.reads % n == 0)
        {
            return Err(SourceError::Again);
        }
        if self.cfg.fail_after.is_some_and(|n| self.produced >= n) {
            return Err(SourceError::Decode(String::from("injected device failure")));
        }

        let video_next = !self.cfg.audio || self.video_time() <= self.audio_time();
        let t = if video_next {
            self.video_time()
        } else {
            self.audio_time()
        };

        if let Some(duration) = self.cfg.duration
            && t >= duration.as_secs_f64()
        {
            return Err(SourceError::EndOfStream);
        }
        if self.cfg.live {
            self.wait_live(t)?;
        }

        self.produced += 1;
        Ok(if video_next {
            self.next_video()
        } else {
            self.next_audio()
        })
    }

    fn is_live(&self) -> bool {
        self.cfg.live
    }

    fn can_seek(&self) -> bool {
        !self.cfg.live
    }

    fn seek_to_start(&mut self) -> Result<(), SourceError> {
        if self.cfg.live {
            return Err(SourceError::NotSeekable);
        }
        self.video_index = 0;
        self.audio_samples = 0;
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            log::info!("{}: closed", self.name);
        }
    }
}
