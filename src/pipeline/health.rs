//! Health counters for the capture pipeline

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Health metrics for a pipeline
///
/// Counters are shared between the decode worker, the scheduler and the
/// owning lifecycle. All fields use relaxed atomics; they are statistics, not
/// synchronization.
pub struct PipelineHealth {
    /// Video frames produced by the source (dropped + forwarded)
    pub video_decoded: AtomicU64,

    /// Video frames discarded because they carried no timestamp
    pub video_dropped: AtomicU64,

    /// Video frames handed to the sinks
    pub video_forwarded: AtomicU64,

    /// Raw audio frames read from the source
    pub audio_in: AtomicU64,

    /// Normalized audio frames handed to the sinks
    pub audio_out: AtomicU64,

    /// Undecoded packets handed to the sinks
    pub packets_forwarded: AtomicU64,

    /// Reads that returned "try again"
    pub transient_retries: AtomicU64,

    /// Seeks back to the start of the source
    pub loops: AtomicU64,

    /// Decode runs that ended on a fatal source error
    pub fatal_errors: AtomicU64,

    /// Decode worker threads ever spawned
    pub worker_spawns: AtomicU64,

    /// Scheduler threads ever spawned
    pub scheduler_spawns: AtomicU64,

    /// Unix microseconds of the last forwarded item
    pub last_frame_time: AtomicU64,
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

impl PipelineHealth {
    pub fn new() -> Self {
        Self {
            video_decoded: AtomicU64::new(0),
            video_dropped: AtomicU64::new(0),
            video_forwarded: AtomicU64::new(0),
            audio_in: AtomicU64::new(0),
            audio_out: AtomicU64::new(0),
            packets_forwarded: AtomicU64::new(0),
            transient_retries: AtomicU64::new(0),
            loops: AtomicU64::new(0),
            fatal_errors: AtomicU64::new(0),
            worker_spawns: AtomicU64::new(0),
            scheduler_spawns: AtomicU64::new(0),
            last_frame_time: AtomicU64::new(now_micros()),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_video_decoded(&self) {
        Self::bump(&self.video_decoded);
    }

    pub fn record_video_dropped(&self) {
        Self::bump(&self.video_dropped);
    }

    pub fn record_forwarded(&self, media: &super::types::Media) {
        use super::types::{Frame, Media};

        match media {
            Media::Frame(Frame::Video(_)) => Self::bump(&self.video_forwarded),
            Media::Frame(Frame::Audio(_)) => Self::bump(&self.audio_out),
            Media::Packet(_) => Self::bump(&self.packets_forwarded),
        }
        self.last_frame_time.store(now_micros(), Ordering::Relaxed);
    }

    pub fn record_audio_in(&self) {
        Self::bump(&self.audio_in);
    }

    pub fn record_retry(&self) {
        Self::bump(&self.transient_retries);
    }

    pub fn record_loop(&self) {
        Self::bump(&self.loops);
    }

    pub fn record_fatal(&self) {
        Self::bump(&self.fatal_errors);
    }

    pub fn record_worker_spawn(&self) {
        Self::bump(&self.worker_spawns);
        // restart the stall clock for the new run
        self.last_frame_time.store(now_micros(), Ordering::Relaxed);
    }

    pub fn record_scheduler_spawn(&self) {
        Self::bump(&self.scheduler_spawns);
    }

    pub fn video_forwarded(&self) -> u64 {
        self.video_forwarded.load(Ordering::Relaxed)
    }

    pub fn worker_spawns(&self) -> u64 {
        self.worker_spawns.load(Ordering::Relaxed)
    }

    pub fn scheduler_spawns(&self) -> u64 {
        self.scheduler_spawns.load(Ordering::Relaxed)
    }

    pub fn loops(&self) -> u64 {
        self.loops.load(Ordering::Relaxed)
    }

    /// Check if the pipeline has stalled (nothing forwarded for given duration)
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        let last = self.last_frame_time.load(Ordering::Relaxed);
        now_micros().saturating_sub(last) > threshold.as_micros() as u64
    }

    /// Get a summary of health metrics
    pub fn summary(&self) -> HealthSummary {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        HealthSummary {
            video_decoded: load(&self.video_decoded),
            video_dropped: load(&self.video_dropped),
            video_forwarded: load(&self.video_forwarded),
            audio_in: load(&self.audio_in),
            audio_out: load(&self.audio_out),
            packets_forwarded: load(&self.packets_forwarded),
            transient_retries: load(&self.transient_retries),
            loops: load(&self.loops),
            fatal_errors: load(&self.fatal_errors),
        }
    }
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSummary {
    pub video_decoded: u64,
    pub video_dropped: u64,
    pub video_forwarded: u64,
    pub audio_in: u64,
    pub audio_out: u64,
    pub packets_forwarded: u64,
    pub transient_retries: u64,
    pub loops: u64,
    pub fatal_errors: u64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: video {}/{} forwarded ({} dropped), audio {} in / {} out, {} packets, {} retries, {} loops, {} fatal",
            self.video_forwarded,
            self.video_decoded,
            self.video_dropped,
            self.audio_in,
            self.audio_out,
            self.packets_forwarded,
            self.transient_retries,
            self.loops,
            self.fatal_errors
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{Frame, Media, PixelFormat, TimeBase, VideoFrame};
    use bytes::Bytes;

    fn video() -> Media {
        Media::Frame(Frame::Video(VideoFrame {
            pts: Some(0),
            time_base: TimeBase::new(1, 30),
            width: 2,
            height: 2,
            format: PixelFormat::Rgb24,
            data: Bytes::from(vec![0u8; 12]),
        }))
    }

    #[test]
    fn test_health_metrics() {
        let health = PipelineHealth::new();

        health.record_video_decoded();
        health.record_video_decoded();
        health.record_video_dropped();
        health.record_forwarded(&video());

        let summary = health.summary();
        assert_eq!(summary.video_decoded, 2);
        assert_eq!(summary.video_dropped, 1);
        assert_eq!(summary.video_forwarded, 1);
        assert!(summary.to_string().contains("1/2 forwarded"));
    }

    #[test]
    fn test_stall_detection() {
        let health = PipelineHealth::new();
        assert!(!health.is_stalled(Duration::from_secs(1)));

        health.record_forwarded(&video());
        std::thread::sleep(Duration::from_millis(150));

        assert!(health.is_stalled(Duration::from_millis(100)));
    }
}
