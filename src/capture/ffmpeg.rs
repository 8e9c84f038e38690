//! FFmpeg-backed media source
//!
//! Reads a media file (seekable, paced by the pipeline), a live stream from
//! standard input, or the desktop through a spawned grabber process (see
//! [`device`](crate::capture::device)). Demuxing goes through custom IO, so the
//! capture region's geometry and frame rate are handed to the demuxer as
//! options for raw formats.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::process::{Child, ChildStdout};

use ac_ffmpeg::format::demuxer::{Demuxer, DemuxerWithStreamInfo, InputFormat, SeekTarget};
use ac_ffmpeg::format::io::IO;
use ac_ffmpeg::time::Timestamp;

use crate::capture::device::{DeviceInput, Platform};
use crate::capture::region::CaptureRegion;
use crate::capture::traits::{MediaSource, SourceError, SourceOptions};
use crate::decoder::ffmpeg::{AudioStreamDecoder, VideoStreamDecoder, packet_from};
use crate::pipeline::types::{Frame, Media, MediaKind, StreamDescriptor, TimeBase};

/// Id selecting standard input
pub const STDIN_ID: &str = "-";

enum Input {
    File(File),
    Stdin(io::Stdin),
    Grabber(ChildStdout),
}

impl Read for Input {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Input::File(f) => f.read(buf),
            Input::Stdin(s) => s.read(buf),
            Input::Grabber(g) => g.read(buf),
        }
    }
}

impl Seek for Input {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            Input::File(f) => f.seek(pos),
            Input::Stdin(_) | Input::Grabber(_) => {
                Err(io::Error::from(io::ErrorKind::Unsupported))
            }
        }
    }
}

/// Grabber process feeding the demuxer. Killed and reaped on drop.
struct Grabber(Child);

impl Drop for Grabber {
    fn drop(&mut self) {
        if let Err(e) = self.0.kill() {
            log::debug!("FfmpegSource: grabber already gone: {}", e);
        }
        match self.0.wait() {
            Ok(status) => log::info!("FfmpegSource: grabber exited ({})", status),
            Err(e) => log::warn!("FfmpegSource: cannot reap grabber: {}", e),
        }
    }
}

struct Track {
    index: usize,
    kind: MediaKind,
    video: Option<VideoStreamDecoder>,
    audio: Option<AudioStreamDecoder>,
}

pub struct FfmpegSource {
    name: String,
    demuxer: Option<DemuxerWithStreamInfo<Input>>,
    streams: Vec<StreamDescriptor>,
    tracks: Vec<Track>,
    pending: VecDeque<Media>,
    live: bool,
    flushed: bool,
    grabber: Option<Grabber>,
}

unsafe impl Send for FfmpegSource {}

fn ff_err(e: ac_ffmpeg::Error) -> SourceError {
    if e.to_io_error().map(|io| io.kind()) == Some(io::ErrorKind::WouldBlock) {
        return SourceError::Again;
    }
    SourceError::Decode(e.to_string())
}

fn open_err(e: impl std::fmt::Display) -> SourceError {
    SourceError::Open(e.to_string())
}

impl FfmpegSource {
    /// Open `region.device_or_desktop_id`: the desktop, a file or `-`, the
    /// latter two optionally prefixed with an input format name (`nut:-`,
    /// `rawvideo:/tmp/grab.yuv`).
    pub fn open(region: &CaptureRegion, options: &SourceOptions) -> Result<Self, SourceError> {
        if let Some(device) = DeviceInput::for_region(region, Platform::current()) {
            return Self::open_device(region, options, &device);
        }

        let (format, location) = match region.device_or_desktop_id.split_once(':') {
            Some((fmt, rest)) if !fmt.is_empty() && !fmt.contains(['/', '\\', '.']) => {
                (Some(fmt), rest)
            }
            _ => (None, region.device_or_desktop_id.as_str()),
        };

        let live = location == STDIN_ID;
        let io = if live {
            IO::from_read_stream(Input::Stdin(io::stdin()))
        } else {
            IO::from_seekable_read_stream(Input::File(File::open(location).map_err(open_err)?))
        };
        Self::open_io(region, options, io, format, live, None)
    }

    /// Spawn the desktop grabber and demux its NUT output
    fn open_device(
        region: &CaptureRegion,
        options: &SourceOptions,
        device: &DeviceInput,
    ) -> Result<Self, SourceError> {
        let mut child = device
            .grabber_command()
            .spawn()
            .map_err(|e| open_err(format!("cannot start {} grabber: {}", device.format, e)))?;
        let stdout = child.stdout.take();
        let grabber = Grabber(child);
        let stdout = stdout.ok_or_else(|| open_err("grabber has no stdout"))?;
        log::info!(
            "FfmpegSource: grabbing {} via {} ({})",
            region,
            device.format,
            device.input
        );

        let io = IO::from_read_stream(Input::Grabber(stdout));
        Self::open_io(region, options, io, Some("nut"), true, Some(grabber))
    }

    fn open_io(
        region: &CaptureRegion,
        options: &SourceOptions,
        io: IO<Input>,
        format: Option<&str>,
        live: bool,
        grabber: Option<Grabber>,
    ) -> Result<Self, SourceError> {

        let mut builder = Demuxer::builder()
            .set_option("video_size", format!("{}x{}", region.width, region.height))
            .set_option("framerate", region.framerate.to_string());
        if let Some(name) = format {
            let input_format = InputFormat::find_input_format(name)
                .ok_or_else(|| open_err(format!("unknown input format '{}'", name)))?;
            builder = builder.input_format(Some(input_format));
        }

        let demuxer = builder
            .build(io)
            .map_err(open_err)?
            .find_stream_info(None)
            .map_err(|(_, e)| open_err(e))?;

        let mut streams = Vec::new();
        let mut tracks = Vec::new();
        for (index, stream) in demuxer.streams().iter().enumerate() {
            let params = stream.codec_parameters();
            let kind = if params.is_video_codec() {
                MediaKind::Video
            } else if params.is_audio_codec() && options.audio {
                MediaKind::Audio
            } else {
                continue;
            };
            if streams.iter().any(|s: &StreamDescriptor| s.kind == kind) {
                continue;
            }

            let tb = stream.time_base();
            streams.push(StreamDescriptor {
                index,
                kind,
                time_base: TimeBase::new(tb.num() as i32, tb.den() as i32),
            });

            let (video, audio) = match (options.decode, kind) {
                (false, _) => (None, None),
                (true, MediaKind::Video) => {
                    (Some(VideoStreamDecoder::from_stream(stream).map_err(open_err)?), None)
                }
                (true, MediaKind::Audio) => {
                    (None, Some(AudioStreamDecoder::from_stream(stream).map_err(open_err)?))
                }
            };
            tracks.push(Track {
                index,
                kind,
                video,
                audio,
            });
        }

        log::info!(
            "FfmpegSource: opened {} ({} streams, live: {})",
            region.device_or_desktop_id,
            streams.len(),
            live
        );

        Ok(Self {
            name: region.device_or_desktop_id.clone(),
            demuxer: Some(demuxer),
            streams,
            tracks,
            pending: VecDeque::new(),
            live,
            flushed: false,
            grabber,
        })
    }

    fn push_frames(&mut self, frames: Vec<Frame>) {
        self.pending.extend(frames.into_iter().map(Media::Frame));
    }

    fn flush_decoders(&mut self) -> Result<(), SourceError> {
        let mut frames = Vec::new();
        for track in &mut self.tracks {
            if let Some(decoder) = track.video.as_mut() {
                frames.extend(decoder.flush().map_err(ff_err)?);
            }
            if let Some(decoder) = track.audio.as_mut() {
                frames.extend(decoder.flush().map_err(ff_err)?);
            }
        }
        self.push_frames(frames);
        self.flushed = true;
        Ok(())
    }
}

impl MediaSource for FfmpegSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    fn next(&mut self) -> Result<Media, SourceError> {
        loop {
            if let Some(media) = self.pending.pop_front() {
                return Ok(media);
            }
            if self.flushed {
                return Err(SourceError::EndOfStream);
            }

            let demuxer = self
                .demuxer
                .as_mut()
                .ok_or_else(|| SourceError::Decode(String::from("source closed")))?;

            let Some(packet) = demuxer.take().map_err(ff_err)? else {
                self.flush_decoders()?;
                continue;
            };

            let Some(track) = self
                .tracks
                .iter_mut()
                .find(|t| t.index == packet.stream_index())
            else {
                continue;
            };

            let frames = match (track.video.as_mut(), track.audio.as_mut()) {
                (Some(decoder), _) => decoder.decode(packet).map_err(ff_err)?,
                (_, Some(decoder)) => decoder.decode(packet).map_err(ff_err)?,
                (None, None) => {
                    return Ok(Media::Packet(packet_from(&packet, track.kind)));
                }
            };
            self.push_frames(frames);
        }
    }

    fn is_live(&self) -> bool {
        self.live
    }

    fn can_seek(&self) -> bool {
        !self.live
    }

    fn seek_to_start(&mut self) -> Result<(), SourceError> {
        if self.live {
            return Err(SourceError::NotSeekable);
        }
        let demuxer = self
            .demuxer
            .as_mut()
            .ok_or_else(|| SourceError::Decode(String::from("source closed")))?;
        demuxer
            .seek_to_timestamp(Timestamp::from_secs(0), SeekTarget::From)
            .map_err(ff_err)?;

        // flushed decoders do not accept new input
        let streams = demuxer.streams();
        for track in &mut self.tracks {
            let stream = &streams[track.index];
            if track.video.is_some() {
                track.video = Some(VideoStreamDecoder::from_stream(stream).map_err(ff_err)?);
            }
            if track.audio.is_some() {
                track.audio = Some(AudioStreamDecoder::from_stream(stream).map_err(ff_err)?);
            }
        }
        self.pending.clear();
        self.flushed = false;
        Ok(())
    }

    fn close(&mut self) {
        if self.demuxer.take().is_some() {
            self.tracks.clear();
            self.pending.clear();
            log::info!("FfmpegSource: closed {}", self.name);
        }
        // after the demuxer, so nothing reads from a dead pipe
        self.grabber.take();
    }
}
