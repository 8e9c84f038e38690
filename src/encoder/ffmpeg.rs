use ac_ffmpeg::codec::Encoder;
use ac_ffmpeg::codec::audio::{self, AudioEncoder, AudioFrameMut, ChannelLayout};
use ac_ffmpeg::codec::video::{self, VideoEncoder, VideoFrameMut, VideoFrameScaler};
use ac_ffmpeg::time::{TimeBase as FfTimeBase, Timestamp};

use super::{EncodeError, SampleEncoder};
use crate::assets::{
    AUDIO_CHANNELS, AUDIO_PTIME, AUDIO_SAMPLE_RATE, AUDIO_SAMPLES_PER_FRAME, VIDEO_TIME_BASE_DEN,
};
use crate::decoder::ffmpeg::packet_from;
use crate::pipeline::types::{AudioFrame, Frame, MediaKind, Packet, PixelFormat, VideoFrame};

/// Hardware encoders first, libx264 last. All tuned for low latency, no B-frames.
const ENCODER_CHAIN: &[(&str, &[(&str, &str)])] = &[
    (
        "h264_nvenc",
        &[
            ("preset", "p2"),
            ("tune", "ll"),
            ("zerolatency", "1"),
            ("rc", "vbr"),
            ("b", "3000000"),
            ("maxrate", "5000000"),
            ("g", "60"),
            ("delay", "0"),
        ],
    ),
    (
        "h264_qsv",
        &[
            ("preset", "fast"),
            ("g", "60"),
            ("b", "3000000"),
            ("maxrate", "4500000"),
            ("async_depth", "1"),
        ],
    ),
    (
        "h264_amf",
        &[
            ("usage", "lowlatency"),
            ("quality", "balanced"),
            ("b", "3000000"),
            ("maxrate", "4500000"),
            ("g", "60"),
        ],
    ),
    (
        "libx264",
        &[
            ("profile", "baseline"),
            ("preset", "veryfast"),
            ("tune", "zerolatency"),
            ("crf", "23"),
            ("maxrate", "4000000"),
            ("bufsize", "8000000"),
            ("keyint", "60"),
            ("bframes", "0"),
        ],
    ),
];

impl From<ac_ffmpeg::Error> for EncodeError {
    fn from(e: ac_ffmpeg::Error) -> Self {
        EncodeError::Codec(e.to_string())
    }
}

fn even(n: u32) -> usize {
    (n + n % 2) as usize
}

/// Copy packed rows into a plane whose rows may be padded
fn fill_plane(dst: &mut [u8], src: &[u8], row: usize, rows: usize) {
    if rows == 0 || row == 0 {
        return;
    }
    let line_size = dst.len() / rows;
    for (dst_row, src_row) in dst.chunks_mut(line_size).zip(src.chunks(row)).take(rows) {
        let n = row.min(dst_row.len()).min(src_row.len());
        dst_row[..n].copy_from_slice(&src_row[..n]);
    }
}

/// An opened encoder together with the scaler feeding it
struct ActiveVideo {
    encoder: VideoEncoder,
    scaler: VideoFrameScaler,
    source: (u32, u32, PixelFormat),
    time_base: FfTimeBase,
}

impl ActiveVideo {
    fn open(frame: &VideoFrame) -> Result<Self, EncodeError> {
        let (w, h) = (even(frame.width), even(frame.height));
        let time_base = FfTimeBase::new(1, VIDEO_TIME_BASE_DEN);
        let yuv420p = video::frame::get_pixel_format("yuv420p");

        let encoder = Self::open_encoder(w, h, time_base, yuv420p)?;
        let scaler = VideoFrameScaler::builder()
            .source_pixel_format(video::frame::get_pixel_format(pixel_format_name(frame.format)))
            .source_width(frame.width as usize)
            .source_height(frame.height as usize)
            .target_pixel_format(yuv420p)
            .target_width(w)
            .target_height(h)
            .build()?;

        Ok(Self {
            encoder,
            scaler,
            source: (frame.width, frame.height, frame.format),
            time_base,
        })
    }

    fn open_encoder(
        w: usize,
        h: usize,
        time_base: FfTimeBase,
        pixel_format: video::frame::PixelFormat,
    ) -> Result<VideoEncoder, EncodeError> {
        for (codec, options) in ENCODER_CHAIN {
            let mut builder = match VideoEncoder::builder(codec) {
                Ok(b) => b,
                Err(e) => {
                    log::debug!("Encoder {} not available, skipping: {}", codec, e);
                    continue;
                }
            };
            builder = builder
                .pixel_format(pixel_format)
                .width(w)
                .height(h)
                .time_base(time_base);
            for (k, v) in *options {
                builder = builder.set_option(k, v);
            }
            match builder.build() {
                Ok(encoder) => {
                    log::info!("H264Encoder: using {} at {}x{}", codec, w, h);
                    return Ok(encoder);
                }
                Err(e) => log::debug!("Encoder {} failed to initialize: {}", codec, e),
            }
        }
        Err(EncodeError::Unavailable(MediaKind::Video))
    }

    fn matches(&self, frame: &VideoFrame) -> bool {
        self.source == (frame.width, frame.height, frame.format)
    }
}

fn pixel_format_name(format: PixelFormat) -> &'static str {
    match format {
        PixelFormat::Rgb24 => "rgb24",
        PixelFormat::Yuv420p => "yuv420p",
    }
}

/// H.264 encoder for the video track. Reopened whenever the frame size changes.
#[derive(Default)]
pub struct H264Encoder {
    active: Option<ActiveVideo>,
    next_pts: i64,
}

unsafe impl Send for H264Encoder {}

impl H264Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn source_frame(frame: &VideoFrame, time_base: FfTimeBase, pts: i64) -> video::VideoFrame {
        let (w, h) = (frame.width as usize, frame.height as usize);
        let mut out = VideoFrameMut::black(
            video::frame::get_pixel_format(pixel_format_name(frame.format)),
            w,
            h,
        )
        .with_time_base(time_base)
        .with_pts(Timestamp::new(pts, time_base));

        {
            let mut planes = out.planes_mut();
            match frame.format {
                PixelFormat::Rgb24 => fill_plane(planes[0].data_mut(), &frame.data, w * 3, h),
                PixelFormat::Yuv420p => {
                    let (cw, ch) = (w / 2, h / 2);
                    let (y, chroma) = frame.data.split_at((w * h).min(frame.data.len()));
                    let (u, v) = chroma.split_at((cw * ch).min(chroma.len()));
                    fill_plane(planes[0].data_mut(), y, w, h);
                    fill_plane(planes[1].data_mut(), u, cw, ch);
                    fill_plane(planes[2].data_mut(), v, cw, ch);
                }
            }
        }
        out.freeze()
    }
}

impl SampleEncoder for H264Encoder {
    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }

    fn encode(&mut self, frame: &Frame) -> Result<Vec<Packet>, EncodeError> {
        let Frame::Video(frame) = frame else {
            return Err(EncodeError::WrongKind {
                expected: MediaKind::Video,
                got: frame.kind(),
            });
        };

        if !self.active.as_ref().is_some_and(|a| a.matches(frame)) {
            self.active = Some(ActiveVideo::open(frame)?);
        }
        let Some(active) = self.active.as_mut() else {
            return Err(EncodeError::Unavailable(MediaKind::Video));
        };

        let pts = frame
            .pts
            .map(|p| (frame.time_base.seconds(p) * VIDEO_TIME_BASE_DEN as f64).round() as i64)
            .unwrap_or(self.next_pts);
        self.next_pts = pts + 1;

        let source = Self::source_frame(frame, active.time_base, pts);
        let scaled = active.scaler.scale(&source)?;
        active.encoder.push(scaled)?;

        let mut out = Vec::new();
        while let Some(packet) = active.encoder.take()? {
            out.push(packet_from(&packet, MediaKind::Video));
        }
        Ok(out)
    }
}

/// Opus encoder for the audio track. Expects normalized 48 kHz stereo.
pub struct OpusEncoder {
    encoder: AudioEncoder,
    frame_size: usize,
    pending: Vec<i16>,
    pending_pts: Option<i64>,
}

unsafe impl Send for OpusEncoder {}

impl OpusEncoder {
    pub fn new() -> Result<Self, EncodeError> {
        let layout = ChannelLayout::from_channels(u32::from(AUDIO_CHANNELS))
            .ok_or_else(|| EncodeError::Codec(String::from("stereo channel layout unavailable")))?;
        let encoder = AudioEncoder::builder("libopus")?
            .sample_rate(AUDIO_SAMPLE_RATE)
            .channel_layout(layout)
            .sample_format(audio::frame::get_sample_format("s16"))
            .set_option("frame_duration", &AUDIO_PTIME.as_millis().to_string())
            .build()?;
        let frame_size = encoder.samples_per_frame().unwrap_or(AUDIO_SAMPLES_PER_FRAME);

        Ok(Self {
            encoder,
            frame_size,
            pending: Vec::new(),
            pending_pts: None,
        })
    }

    fn push_frame(&mut self, pts: i64, out: &mut Vec<Packet>) -> Result<(), EncodeError> {
        let needed = self.frame_size * AUDIO_CHANNELS as usize;
        let time_base = FfTimeBase::new(1, AUDIO_SAMPLE_RATE as i32);

        let params = self.encoder.codec_parameters();
        let mut frame = AudioFrameMut::silence(
            params.channel_layout(),
            params.sample_format(),
            params.sample_rate(),
            self.frame_size,
        )
        .with_time_base(time_base)
        .with_pts(Timestamp::new(pts, time_base));

        {
            let plane = &mut frame.planes_mut()[0];
            let data = plane.data_mut();
            for (dst, sample) in data.chunks_exact_mut(2).zip(self.pending.drain(..needed)) {
                dst.copy_from_slice(&sample.to_ne_bytes());
            }
        }

        self.encoder.push(frame.freeze())?;
        while let Some(packet) = self.encoder.take()? {
            out.push(packet_from(&packet, MediaKind::Audio));
        }
        Ok(())
    }

    fn check_format(frame: &AudioFrame) -> Result<(), EncodeError> {
        if frame.sample_rate != AUDIO_SAMPLE_RATE || frame.channels != AUDIO_CHANNELS {
            return Err(EncodeError::Codec(format!(
                "expected {} Hz x{} audio, got {} Hz x{}",
                AUDIO_SAMPLE_RATE, AUDIO_CHANNELS, frame.sample_rate, frame.channels
            )));
        }
        Ok(())
    }
}

impl SampleEncoder for OpusEncoder {
    fn kind(&self) -> MediaKind {
        MediaKind::Audio
    }

    fn encode(&mut self, frame: &Frame) -> Result<Vec<Packet>, EncodeError> {
        let Frame::Audio(frame) = frame else {
            return Err(EncodeError::WrongKind {
                expected: MediaKind::Audio,
                got: frame.kind(),
            });
        };
        Self::check_format(frame)?;

        if self.pending.is_empty() {
            self.pending_pts = frame.pts.map(|p| {
                (frame.time_base.seconds(p) * AUDIO_SAMPLE_RATE as f64).round() as i64
            });
        }
        self.pending.extend_from_slice(&frame.samples);

        let needed = self.frame_size * AUDIO_CHANNELS as usize;
        let mut out = Vec::new();
        while self.pending.len() >= needed {
            let pts = self.pending_pts.unwrap_or(0);
            self.push_frame(pts, &mut out)?;
            self.pending_pts = Some(pts + self.frame_size as i64);
        }
        Ok(out)
    }
}
