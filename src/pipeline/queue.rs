//! Per-consumer track queues
//!
//! The decode thread owns the sending half (through the distributor) and
//! hands items over by posting closures onto the scheduler; the receiving half
//! is consumed by exactly one task.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::pipeline::types::{Media, MediaKind, QueueItem};

pub type ConsumerId = u64;

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("track ended")]
    Ended,
}

/// Producer half of a track queue
#[derive(Clone)]
pub struct TrackSender {
    id: ConsumerId,
    kind: MediaKind,
    tx: mpsc::UnboundedSender<QueueItem>,
}

impl TrackSender {
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Enqueue an item; `false` once the consumer is gone
    pub fn send(&self, item: QueueItem) -> bool {
        self.tx.send(item).is_ok()
    }

    pub fn end(&self) -> bool {
        self.send(QueueItem::EndOfStream)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct Pacing {
    start: Option<Instant>,
}

/// Consumer half of a track queue
pub struct TrackConsumer {
    id: ConsumerId,
    kind: MediaKind,
    rx: mpsc::UnboundedReceiver<QueueItem>,
    ended: bool,
    pacing: Option<Pacing>,
}

/// Create a connected queue for one consumer
pub fn track_queue(id: ConsumerId, kind: MediaKind) -> (TrackSender, TrackConsumer) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        TrackSender { id, kind, tx },
        TrackConsumer {
            id,
            kind,
            rx,
            ended: false,
            pacing: None,
        },
    )
}

impl TrackConsumer {
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Release items at their presentation time relative to the first item
    pub fn with_pacing(mut self) -> Self {
        self.pacing = Some(Pacing { start: None });
        self
    }

    /// Next item in decode order. Returns [`QueueError::Ended`] after the
    /// end-of-stream marker and on every later call.
    pub async fn recv(&mut self) -> Result<Media, QueueError> {
        if self.ended {
            return Err(QueueError::Ended);
        }

        let media = match self.rx.recv().await {
            Some(QueueItem::Media(media)) => media,
            Some(QueueItem::EndOfStream) | None => {
                self.ended = true;
                self.rx.close();
                return Err(QueueError::Ended);
            }
        };

        if let Some(pacing) = self.pacing.as_mut()
            && let Some(t) = media.seconds()
        {
            let offset = Duration::from_secs_f64(t.max(0.0));
            let now = Instant::now();
            match pacing.start {
                None => pacing.start = Some(now.checked_sub(offset).unwrap_or(now)),
                Some(start) => tokio::time::sleep_until(start + offset).await,
            }
        }

        Ok(media)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{AudioFrame, Frame, TimeBase};

    fn audio(pts: i64) -> QueueItem {
        QueueItem::Media(Media::Frame(Frame::Audio(AudioFrame {
            pts: Some(pts),
            time_base: TimeBase::new(1, 48_000),
            sample_rate: 48_000,
            channels: 2,
            samples: vec![0; 1920],
        })))
    }

    #[tokio::test]
    async fn test_fifo_then_ended() {
        let (tx, mut rx) = track_queue(1, MediaKind::Audio);
        assert!(tx.send(audio(0)));
        assert!(tx.send(audio(960)));
        assert!(tx.end());

        assert_eq!(rx.recv().await.unwrap().pts(), Some(0));
        assert_eq!(rx.recv().await.unwrap().pts(), Some(960));
        assert_eq!(rx.recv().await.unwrap_err(), QueueError::Ended);
        assert!(rx.is_ended());
        assert_eq!(rx.recv().await.unwrap_err(), QueueError::Ended);
    }

    #[tokio::test]
    async fn test_items_after_sentinel_are_ignored() {
        let (tx, mut rx) = track_queue(1, MediaKind::Audio);
        tx.end();
        assert_eq!(rx.recv().await.unwrap_err(), QueueError::Ended);
        assert!(!tx.send(audio(0)));
        assert_eq!(rx.recv().await.unwrap_err(), QueueError::Ended);
    }

    #[tokio::test]
    async fn test_dropped_sender_ends_queue() {
        let (tx, mut rx) = track_queue(2, MediaKind::Video);
        drop(tx);
        assert_eq!(rx.recv().await.unwrap_err(), QueueError::Ended);
    }

    #[tokio::test]
    async fn test_dropped_consumer_closes_sender() {
        let (tx, rx) = track_queue(3, MediaKind::Video);
        drop(rx);
        assert!(tx.is_closed());
        assert!(!tx.end());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_follows_timestamps() {
        let (tx, rx) = track_queue(1, MediaKind::Audio);
        let mut rx = rx.with_pacing();
        // 0 s, 0.5 s, 1 s
        for pts in [0, 24_000, 48_000] {
            tx.send(audio(pts));
        }

        let start = Instant::now();
        rx.recv().await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(10));
        rx.recv().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(500));
        rx.recv().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(1));
    }
}
