//! Fan-out of decoded items to the preview sink and the track queues

use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::decoder::to_rgb24;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::pacer::Timeline;
use crate::pipeline::queue::{ConsumerId, TrackSender};
use crate::pipeline::scheduler::SchedulerHandle;
use crate::pipeline::types::{Frame, Media, MediaKind, QueueItem};

/// Receiver of rendered RGB24 pictures, called on the decode thread.
/// Implementations must not block.
pub trait PreviewSink: Send + Sync {
    fn render(&self, pixels: &[u8], width: u32, height: u32);
}

impl<F> PreviewSink for F
where
    F: Fn(&[u8], u32, u32) + Send + Sync,
{
    fn render(&self, pixels: &[u8], width: u32, height: u32) {
        self(pixels, width, height)
    }
}

/// Producer halves of the attached track queues
#[derive(Default)]
pub struct TrackRegistry {
    senders: HashMap<ConsumerId, TrackSender>,
}

pub type SharedTracks = Arc<Mutex<TrackRegistry>>;

impl TrackRegistry {
    pub fn shared() -> SharedTracks {
        Arc::new(Mutex::new(Self::default()))
    }

    pub fn insert(&mut self, sender: TrackSender) {
        self.senders.insert(sender.id(), sender);
    }

    pub fn remove(&mut self, id: ConsumerId) -> Option<TrackSender> {
        self.senders.remove(&id)
    }

    pub fn matching(&self, kind: MediaKind) -> Vec<TrackSender> {
        self.senders
            .values()
            .filter(|s| s.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<TrackSender> {
        self.senders.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

pub(crate) fn lock_tracks(tracks: &SharedTracks) -> MutexGuard<'_, TrackRegistry> {
    tracks.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Post an end-of-stream marker to each of `senders`, behind anything already queued
pub(crate) fn end_tracks(scheduler: &SchedulerHandle, senders: Vec<TrackSender>) {
    if senders.is_empty() {
        return;
    }
    let posted = scheduler.call_soon(move |_| {
        for sender in &senders {
            sender.end();
        }
    });
    if posted.is_err() {
        debug!("FrameDistributor: scheduler gone, queues close on drop");
    }
}

pub struct FrameDistributor {
    tracks: SharedTracks,
    scheduler: SchedulerHandle,
    preview: Option<Arc<dyn PreviewSink>>,
    health: Arc<PipelineHealth>,
    video_timeline: Timeline,
    audio_timeline: Timeline,
}

impl FrameDistributor {
    pub fn new(
        tracks: SharedTracks,
        scheduler: SchedulerHandle,
        preview: Option<Arc<dyn PreviewSink>>,
        health: Arc<PipelineHealth>,
    ) -> Self {
        Self {
            tracks,
            scheduler,
            preview,
            health,
            video_timeline: Timeline::new(),
            audio_timeline: Timeline::new(),
        }
    }

    /// Drop or rebase `media`. Returns `None` for video without a usable timestamp.
    pub fn prepare(&mut self, mut media: Media) -> Option<Media> {
        let encoded = matches!(media, Media::Packet(_));
        match media.kind() {
            MediaKind::Video => {
                if media.pts().is_none() {
                    warn!("FrameDistributor: dropping video frame without timestamp");
                    self.health.record_video_dropped();
                    return None;
                }
                if !self.video_timeline.rebase(&mut media) {
                    debug!("FrameDistributor: dropping video frame before timeline start");
                    self.health.record_video_dropped();
                    return None;
                }
            }
            // encoded audio bypasses the normalizer
            MediaKind::Audio if encoded => {
                if !self.audio_timeline.rebase(&mut media) {
                    debug!("FrameDistributor: dropping audio packet without usable timestamp");
                    return None;
                }
            }
            MediaKind::Audio => {}
        }
        Some(media)
    }

    /// Hand a prepared item to the preview (video frames) and the matching queues
    pub fn deliver(&self, media: Media) {
        if let (Some(preview), Media::Frame(Frame::Video(frame))) = (&self.preview, &media) {
            match to_rgb24(frame) {
                Some(rgb) => preview.render(&rgb.data, rgb.width, rgb.height),
                None => warn!(
                    "FrameDistributor: malformed {}x{} frame not previewed",
                    frame.width, frame.height
                ),
            }
        }
        self.health.record_forwarded(&media);

        let senders = lock_tracks(&self.tracks).matching(media.kind());
        if senders.is_empty() {
            return;
        }
        let posted = self.scheduler.call_soon(move |_| {
            for sender in &senders {
                sender.send(QueueItem::Media(media.clone()));
            }
        });
        if posted.is_err() {
            debug!("FrameDistributor: scheduler gone, item not queued");
        }
    }

    pub fn dispatch(&mut self, media: Media) {
        if let Some(media) = self.prepare(media) {
            self.deliver(media);
        }
    }

    /// The source was seeked back to its start
    pub fn on_loop(&mut self) {
        self.video_timeline.on_loop();
        self.audio_timeline.on_loop();
    }

    /// Terminate every attached queue
    pub fn end_all(&self) {
        end_tracks(&self.scheduler, lock_tracks(&self.tracks).all());
    }
}
