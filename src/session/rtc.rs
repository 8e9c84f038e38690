//! WebRTC sample writer for published tracks
//!
//! Connector implementations add [`RtcTrackWriter::track`] to their peer
//! connection and spawn [`RtcTrackWriter::run`] on the scheduler to pump a
//! track queue into it. Decoded frames are sent only through an attached
//! [`SampleEncoder`]; without one they are skipped.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::assets::{AUDIO_CHANNELS, AUDIO_PTIME, AUDIO_SAMPLE_RATE, FRAME_RATE};
use crate::encoder::{EncodeError, SampleEncoder};
use crate::pipeline::queue::TrackConsumer;
use crate::pipeline::types::{Media, MediaKind, Packet};

/// Counters reported when a writer stops
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriterStats {
    pub samples: u64,
    pub skipped: u64,
    pub failures: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error(transparent)]
    Rtc(#[from] webrtc::Error),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// What became of one queued item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Written as this many samples (an encoder may buffer and emit none)
    Sent(usize),
    /// A decoded frame with no encoder attached
    Skipped,
}

pub struct RtcTrackWriter {
    kind: MediaKind,
    track: Arc<TrackLocalStaticSample>,
    encoder: Option<Box<dyn SampleEncoder>>,
    last_pts: Option<i64>,
}

impl RtcTrackWriter {
    pub fn new(kind: MediaKind, stream_id: &str) -> Self {
        let capability = match kind {
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                clock_rate: 90_000,
                ..Default::default()
            },
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: AUDIO_SAMPLE_RATE,
                channels: AUDIO_CHANNELS,
                ..Default::default()
            },
        };

        let track = Arc::new(TrackLocalStaticSample::new(
            capability,
            kind.to_string(),
            stream_id.to_owned(),
        ));

        Self {
            kind,
            track,
            encoder: None,
            last_pts: None,
        }
    }

    /// Encode decoded frames before writing them
    pub fn with_encoder(mut self, encoder: Box<dyn SampleEncoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    fn default_duration(&self) -> Duration {
        match self.kind {
            MediaKind::Video => Duration::from_secs(1) / FRAME_RATE,
            MediaKind::Audio => AUDIO_PTIME,
        }
    }

    /// Duration of `packet` from the delta to the previous timestamp
    fn duration_of(&mut self, packet: &Packet) -> Duration {
        let duration = match (self.last_pts, packet.pts) {
            (Some(last), Some(pts)) if pts > last => packet.time_base.duration(pts - last),
            _ => self.default_duration(),
        };
        if packet.pts.is_some() {
            self.last_pts = packet.pts;
        }
        duration
    }

    /// Write one item, encoding it first when it is a decoded frame
    pub async fn write(&mut self, media: &Media) -> Result<WriteOutcome, WriteError> {
        match media {
            Media::Packet(packet) => {
                self.write_packet(packet).await?;
                Ok(WriteOutcome::Sent(1))
            }
            Media::Frame(frame) => {
                let Some(encoder) = self.encoder.as_mut() else {
                    return Ok(WriteOutcome::Skipped);
                };
                let packets = encoder.encode(frame)?;
                for packet in &packets {
                    self.write_packet(packet).await?;
                }
                Ok(WriteOutcome::Sent(packets.len()))
            }
        }
    }

    async fn write_packet(&mut self, packet: &Packet) -> Result<(), webrtc::Error> {
        let sample = webrtc::media::Sample {
            data: packet.data.clone(),
            duration: self.duration_of(packet),
            ..Default::default()
        };
        self.track.write_sample(&sample).await
    }

    /// Pump `consumer` into the track until the queue ends or `cancel` fires
    pub async fn run(mut self, mut consumer: TrackConsumer, cancel: CancellationToken) -> WriterStats {
        let mut stats = WriterStats::default();

        loop {
            let media = tokio::select! {
                _ = cancel.cancelled() => break,
                item = consumer.recv() => match item {
                    Ok(media) => media,
                    Err(_) => break,
                },
            };

            match self.write(&media).await {
                Ok(WriteOutcome::Sent(n)) => stats.samples += n as u64,
                Ok(WriteOutcome::Skipped) => stats.skipped += 1,
                Err(e) => {
                    stats.failures += 1;
                    log::warn!("RtcTrackWriter: failed to write {} sample: {}", self.kind, e);
                }
            }
        }

        log::info!(
            "RtcTrackWriter: {} track stopped after {} samples ({} skipped, {} failed)",
            self.kind,
            stats.samples,
            stats.skipped,
            stats.failures
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::queue::track_queue;
    use crate::pipeline::types::{AudioFrame, Frame, QueueItem, TimeBase};
    use bytes::Bytes;
    use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
    use webrtc::track::track_local::TrackLocal;

    fn packet(pts: i64) -> Media {
        Media::Packet(Packet {
            kind: MediaKind::Audio,
            pts: Some(pts),
            dts: Some(pts),
            time_base: TimeBase::new(1, 48_000),
            is_keyframe: true,
            data: Bytes::from_static(&[0xFC, 0xFF, 0xFE]),
        })
    }

    #[test]
    fn test_track_capability_by_kind() {
        let video = RtcTrackWriter::new(MediaKind::Video, "kandar");
        assert_eq!(video.track().codec().mime_type, MIME_TYPE_H264);
        assert_eq!(video.track().kind(), RTPCodecType::Video);

        let audio = RtcTrackWriter::new(MediaKind::Audio, "kandar");
        assert_eq!(audio.track().codec().mime_type, MIME_TYPE_OPUS);
        assert_eq!(audio.track().stream_id(), "kandar");
    }

    #[test]
    fn test_duration_from_pts_delta() {
        let mut writer = RtcTrackWriter::new(MediaKind::Audio, "kandar");
        let Media::Packet(first) = packet(0) else { unreachable!() };
        let Media::Packet(second) = packet(1920) else { unreachable!() };

        assert_eq!(writer.duration_of(&first), AUDIO_PTIME);
        let delta = writer.duration_of(&second).as_secs_f64();
        assert!((delta - 0.040).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_run_stops_on_end_of_stream() {
        let writer = RtcTrackWriter::new(MediaKind::Audio, "kandar");
        let (tx, rx) = track_queue(1, MediaKind::Audio);

        tx.send(QueueItem::Media(packet(0)));
        tx.send(QueueItem::Media(packet(960)));
        tx.send(QueueItem::Media(Media::Frame(Frame::Audio(AudioFrame {
            pts: Some(1920),
            time_base: TimeBase::new(1, 48_000),
            sample_rate: 48_000,
            channels: 2,
            samples: vec![0; 1920],
        }))));
        tx.end();

        // no peer bound: samples are accepted and dropped
        let stats = writer.run(rx, CancellationToken::new()).await;
        assert_eq!(
            stats,
            WriterStats {
                samples: 2,
                skipped: 1,
                failures: 0
            }
        );
    }

    /// Emits one packet per two frames, echoing the frame timestamp
    struct PairingEncoder {
        held: usize,
    }

    impl SampleEncoder for PairingEncoder {
        fn kind(&self) -> MediaKind {
            MediaKind::Audio
        }

        fn encode(&mut self, frame: &Frame) -> Result<Vec<Packet>, EncodeError> {
            if frame.kind() != MediaKind::Audio {
                return Err(EncodeError::WrongKind {
                    expected: MediaKind::Audio,
                    got: frame.kind(),
                });
            }
            self.held += 1;
            if self.held < 2 {
                return Ok(Vec::new());
            }
            self.held = 0;
            let Media::Packet(packet) = packet(frame.pts().unwrap_or(0)) else {
                unreachable!()
            };
            Ok(vec![packet])
        }
    }

    fn audio_frame(pts: i64) -> Media {
        Media::Frame(Frame::Audio(AudioFrame {
            pts: Some(pts),
            time_base: TimeBase::new(1, 48_000),
            sample_rate: 48_000,
            channels: 2,
            samples: vec![0; 1920],
        }))
    }

    #[tokio::test]
    async fn test_decoded_frames_sent_through_encoder() {
        let mut writer = RtcTrackWriter::new(MediaKind::Audio, "kandar")
            .with_encoder(Box::new(PairingEncoder { held: 0 }));

        assert_eq!(writer.write(&audio_frame(0)).await.unwrap(), WriteOutcome::Sent(0));
        assert_eq!(writer.write(&audio_frame(960)).await.unwrap(), WriteOutcome::Sent(1));
        assert_eq!(writer.write(&packet(1920)).await.unwrap(), WriteOutcome::Sent(1));

        let (tx, rx) = track_queue(1, MediaKind::Audio);
        for pts in [0, 960, 1920, 2880] {
            tx.send(QueueItem::Media(audio_frame(pts)));
        }
        tx.end();
        let writer = RtcTrackWriter::new(MediaKind::Audio, "kandar")
            .with_encoder(Box::new(PairingEncoder { held: 0 }));
        let stats = writer.run(rx, CancellationToken::new()).await;
        assert_eq!(
            stats,
            WriterStats {
                samples: 2,
                skipped: 0,
                failures: 0
            }
        );
    }

    #[tokio::test]
    async fn test_encoder_errors_counted() {
        let mut writer = RtcTrackWriter::new(MediaKind::Audio, "kandar")
            .with_encoder(Box::new(PairingEncoder { held: 0 }));
        let video = Media::Frame(Frame::Video(crate::pipeline::types::VideoFrame {
            pts: Some(0),
            time_base: TimeBase::new(1, 90_000),
            width: 2,
            height: 2,
            format: crate::pipeline::types::PixelFormat::Rgb24,
            data: Bytes::from(vec![0; 12]),
        }));
        assert!(matches!(
            writer.write(&video).await,
            Err(WriteError::Encode(EncodeError::WrongKind { .. }))
        ));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let writer = RtcTrackWriter::new(MediaKind::Video, "kandar");
        let (_tx, rx) = track_queue(1, MediaKind::Video);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let stats = writer.run(rx, cancel).await;
        assert_eq!(stats.samples, 0);
    }
}
