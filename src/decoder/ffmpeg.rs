use ac_ffmpeg::codec::audio::{
    self, AudioDecoder, AudioFrame as FfAudioFrame, AudioResampler, ChannelLayout,
};
use ac_ffmpeg::codec::video::{self, VideoDecoder, VideoFrame as FfVideoFrame, VideoFrameScaler};
use ac_ffmpeg::codec::Decoder;
use ac_ffmpeg::format::stream::Stream;
use ac_ffmpeg::packet::Packet as FfPacket;
use bytes::Bytes;

use super::convert::extract_plane;
use crate::pipeline::types::{
    AudioFrame, Frame, MediaKind, Packet, PixelFormat, TimeBase, VideoFrame,
};

fn time_base_of(tb: ac_ffmpeg::time::TimeBase) -> TimeBase {
    TimeBase::new(tb.num() as i32, tb.den() as i32)
}

fn pts_of(ts: ac_ffmpeg::time::Timestamp) -> Option<i64> {
    (!ts.is_null()).then(|| ts.timestamp())
}

/// Copy an undecoded packet into the pipeline representation
pub fn packet_from(packet: &FfPacket, kind: MediaKind) -> Packet {
    Packet {
        kind,
        pts: pts_of(packet.pts()),
        dts: pts_of(packet.dts()),
        time_base: time_base_of(packet.time_base()),
        is_keyframe: packet.is_key(),
        data: Bytes::copy_from_slice(packet.data()),
    }
}

/// Video decoder with conversion to packed RGB24
pub struct VideoStreamDecoder {
    decoder: VideoDecoder,
    scaler: Option<VideoFrameScaler>,
    /// Reusable buffer for packed RGB output
    packed_buffer: Vec<u8>,
}

unsafe impl Send for VideoStreamDecoder {}

impl VideoStreamDecoder {
    pub fn from_stream(stream: &Stream) -> Result<Self, ac_ffmpeg::Error> {
        let decoder = VideoDecoder::from_stream(stream)?.build()?;
        Ok(Self {
            decoder,
            scaler: None,
            packed_buffer: Vec::new(),
        })
    }

    /// Push one packet and collect every frame it completed
    pub fn decode(&mut self, packet: FfPacket) -> Result<Vec<Frame>, ac_ffmpeg::Error> {
        self.decoder.push(packet)?;
        self.drain()
    }

    pub fn flush(&mut self) -> Result<Vec<Frame>, ac_ffmpeg::Error> {
        self.decoder.flush()?;
        self.drain()
    }

    fn drain(&mut self) -> Result<Vec<Frame>, ac_ffmpeg::Error> {
        let mut out = Vec::new();
        while let Some(frame) = self.decoder.take()? {
            out.push(Frame::Video(self.convert(&frame)?));
        }
        Ok(out)
    }

    fn convert(&mut self, frame: &FfVideoFrame) -> Result<VideoFrame, ac_ffmpeg::Error> {
        let (w, h) = (frame.width(), frame.height());
        let rgb24 = video::frame::get_pixel_format("rgb24");

        if self.scaler.is_none() {
            self.scaler = Some(
                VideoFrameScaler::builder()
                    .source_pixel_format(frame.pixel_format())
                    .source_width(w)
                    .source_height(h)
                    .target_pixel_format(rgb24)
                    .target_width(w)
                    .target_height(h)
                    .build()?,
            );
        }
        let scaler = self
            .scaler
            .as_mut()
            .ok_or_else(|| ac_ffmpeg::Error::new("scaler unavailable"))?;
        let scaled = scaler.scale(frame)?;

        let planes = scaled.planes();
        let row = w * 3;
        self.packed_buffer.resize(row * h, 0);
        extract_plane(
            &mut self.packed_buffer,
            planes[0].data(),
            planes[0].line_size(),
            row,
            h,
        );

        Ok(VideoFrame {
            pts: pts_of(frame.pts()),
            time_base: time_base_of(frame.time_base()),
            width: w as u32,
            height: h as u32,
            format: PixelFormat::Rgb24,
            data: Bytes::copy_from_slice(&self.packed_buffer),
        })
    }
}

/// Audio decoder with conversion to packed s16 stereo at the native rate
pub struct AudioStreamDecoder {
    decoder: AudioDecoder,
    resampler: Option<AudioResampler>,
}

unsafe impl Send for AudioStreamDecoder {}

impl AudioStreamDecoder {
    pub fn from_stream(stream: &Stream) -> Result<Self, ac_ffmpeg::Error> {
        let decoder = AudioDecoder::from_stream(stream)?.build()?;
        Ok(Self {
            decoder,
            resampler: None,
        })
    }

    pub fn decode(&mut self, packet: FfPacket) -> Result<Vec<Frame>, ac_ffmpeg::Error> {
        self.decoder.push(packet)?;
        self.drain()
    }

    pub fn flush(&mut self) -> Result<Vec<Frame>, ac_ffmpeg::Error> {
        self.decoder.flush()?;
        self.drain()
    }

    fn drain(&mut self) -> Result<Vec<Frame>, ac_ffmpeg::Error> {
        let mut out = Vec::new();
        while let Some(frame) = self.decoder.take()? {
            let pts = pts_of(frame.pts());
            let time_base = time_base_of(frame.time_base());
            let resampler = self.resampler_for(&frame)?;
            resampler.push(frame)?;
            while let Some(converted) = resampler.take()? {
                out.push(Frame::Audio(Self::convert(&converted, pts, time_base)));
            }
        }
        Ok(out)
    }

    fn resampler_for(&mut self, frame: &FfAudioFrame) -> Result<&mut AudioResampler, ac_ffmpeg::Error> {
        if self.resampler.is_none() {
            let stereo = ChannelLayout::from_channels(2)
                .ok_or_else(|| ac_ffmpeg::Error::new("stereo channel layout unavailable"))?;
            self.resampler = Some(
                AudioResampler::builder()
                    .source_channel_layout(frame.channel_layout().to_owned())
                    .source_sample_format(frame.sample_format())
                    .source_sample_rate(frame.sample_rate())
                    .target_channel_layout(stereo)
                    .target_sample_format(audio::frame::get_sample_format("s16"))
                    .target_sample_rate(frame.sample_rate())
                    .build()?,
            );
        }
        self.resampler
            .as_mut()
            .ok_or_else(|| ac_ffmpeg::Error::new("resampler unavailable"))
    }

    fn convert(frame: &FfAudioFrame, pts: Option<i64>, time_base: TimeBase) -> AudioFrame {
        let count = frame.samples() * 2;
        let planes = frame.planes();
        let samples = planes
            .first()
            .map(|p| {
                p.data()
                    .chunks_exact(2)
                    .take(count)
                    .map(|b| i16::from_ne_bytes([b[0], b[1]]))
                    .collect()
            })
            .unwrap_or_default();

        AudioFrame {
            pts,
            time_base,
            sample_rate: frame.sample_rate(),
            channels: 2,
            samples,
        }
    }
}
