//! Decode worker thread
//!
//! The only producer of the pipeline. Reads the source in a blocking loop,
//! normalizes audio, gates delivery through the pacer and hands everything to
//! the distributor. Quit is observed once per iteration and inside every sleep.

use log::{error, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crate::assets::RETRY_BACKOFF;
use crate::capture::{MediaSource, SourceError};
use crate::pipeline::distributor::FrameDistributor;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::normalizer::AudioNormalizer;
use crate::pipeline::pacer::PlaybackPacer;
use crate::pipeline::types::{Frame, Media, MediaKind};
use crate::utils::sos::SignalOfStop;

/// Why the decode loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Quit was signalled
    Quit,
    /// The source ran out and looping was off
    EndOfStream,
    /// The source failed
    Failed(SourceError),
}

pub struct DecodeWorker {
    source: Box<dyn MediaSource>,
    distributor: FrameDistributor,
    normalizer: AudioNormalizer,
    pacer: PlaybackPacer,
    quit: SignalOfStop,
    health: Arc<PipelineHealth>,
    ended: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
}

impl DecodeWorker {
    pub fn new(
        source: Box<dyn MediaSource>,
        distributor: FrameDistributor,
        pacer: PlaybackPacer,
        quit: SignalOfStop,
        health: Arc<PipelineHealth>,
    ) -> Self {
        Self {
            source,
            distributor,
            normalizer: AudioNormalizer::new(),
            pacer,
            quit,
            health,
            ended: Arc::new(AtomicBool::new(false)),
            failed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Raised when the loop has exited and the source is closed
    pub fn ended_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.ended)
    }

    /// Raised together with `ended` when the loop stopped on a source failure
    pub fn failed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.failed)
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<WorkerExit>> {
        let health = Arc::clone(&self.health);
        let handle = std::thread::Builder::new()
            .name(String::from("kandar-decode"))
            .spawn(move || self.run())?;
        health.record_worker_spawn();
        Ok(handle)
    }

    pub fn run(mut self) -> WorkerExit {
        info!(
            "DecodeWorker: reading {} (throttle: {}, loop: {})",
            self.source.name(),
            self.pacer.is_throttling(),
            self.pacer.loop_enabled()
        );

        let exit = self.read_loop();
        match &exit {
            WorkerExit::Quit => info!("DecodeWorker: quit requested"),
            WorkerExit::EndOfStream => info!("DecodeWorker: end of stream"),
            WorkerExit::Failed(e) => error!("DecodeWorker: source failed: {}", e),
        }

        self.distributor.end_all();
        self.source.close();
        if matches!(exit, WorkerExit::Failed(_)) {
            self.failed.store(true, Ordering::Release);
        }
        self.ended.store(true, Ordering::Release);
        info!("DecodeWorker: {}", self.health.summary());
        exit
    }

    fn read_loop(&mut self) -> WorkerExit {
        loop {
            if self.quit.cancelled() {
                return WorkerExit::Quit;
            }

            match self.source.next() {
                Ok(media) => {
                    if !self.handle(media) {
                        return WorkerExit::Quit;
                    }
                }
                Err(SourceError::Again) => {
                    self.health.record_retry();
                    if self.quit.sleep(RETRY_BACKOFF) {
                        return WorkerExit::Quit;
                    }
                }
                Err(SourceError::EndOfStream) => {
                    if !self.pacer.should_loop(self.source.as_ref()) {
                        return WorkerExit::EndOfStream;
                    }
                    if let Err(e) = self.source.seek_to_start() {
                        self.health.record_fatal();
                        return WorkerExit::Failed(e);
                    }
                    self.health.record_loop();
                    self.distributor.on_loop();
                    info!("DecodeWorker: looping {}", self.source.name());
                }
                Err(e) => {
                    self.health.record_fatal();
                    return WorkerExit::Failed(e);
                }
            }
        }
    }

    /// Process one source item; `false` if quit arrived while pacing
    fn handle(&mut self, media: Media) -> bool {
        if let Media::Frame(Frame::Audio(frame)) = &media {
            self.health.record_audio_in();
            for out in self.normalizer.push(frame) {
                if !self.gate_and_deliver(Media::Frame(Frame::Audio(out))) {
                    return false;
                }
            }
            return true;
        }

        if media.kind() == MediaKind::Video {
            self.health.record_video_decoded();
        }
        match self.distributor.prepare(media) {
            Some(media) => self.gate_and_deliver(media),
            None => true,
        }
    }

    fn gate_and_deliver(&mut self, media: Media) -> bool {
        if !self.pacer.wait(media.seconds(), &self.quit) {
            return false;
        }
        self.distributor.deliver(media);
        true
    }
}

impl Drop for DecodeWorker {
    fn drop(&mut self) {
        if !self.ended.load(Ordering::Acquire) {
            warn!("DecodeWorker: dropped without running, closing source");
            self.source.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{SyntheticConfig, SyntheticSource};
    use crate::pipeline::distributor::{TrackRegistry, lock_tracks};
    use crate::pipeline::queue::{TrackConsumer, track_queue};
    use crate::pipeline::scheduler::Scheduler;
    use std::time::{Duration, Instant};

    struct Harness {
        scheduler: Scheduler,
        health: Arc<PipelineHealth>,
        quit: SignalOfStop,
        video: TrackConsumer,
        audio: TrackConsumer,
        closed: Arc<AtomicBool>,
        worker: DecodeWorker,
    }

    fn harness(cfg: SyntheticConfig, throttle: bool, loop_enabled: bool) -> Harness {
        let health = Arc::new(PipelineHealth::new());
        let scheduler = Scheduler::spawn(health.clone()).unwrap();
        let tracks = TrackRegistry::shared();

        let (video_tx, video) = track_queue(1, MediaKind::Video);
        let (audio_tx, audio) = track_queue(2, MediaKind::Audio);
        lock_tracks(&tracks).insert(video_tx);
        lock_tracks(&tracks).insert(audio_tx);

        let source = SyntheticSource::new(cfg);
        let closed = source.close_observer();
        let distributor = FrameDistributor::new(tracks, scheduler.handle(), None, health.clone());
        let quit = SignalOfStop::new();
        let worker = DecodeWorker::new(
            Box::new(source),
            distributor,
            PlaybackPacer::new(throttle, loop_enabled),
            quit.clone(),
            health.clone(),
        );

        Harness {
            scheduler,
            health,
            quit,
            video,
            audio,
            closed,
            worker,
        }
    }

    fn clip(secs: f64) -> SyntheticConfig {
        SyntheticConfig {
            width: 4,
            height: 4,
            framerate: 10,
            ..SyntheticConfig::clip(Duration::from_secs_f64(secs))
        }
    }

    async fn drain(consumer: &mut TrackConsumer) -> Vec<Media> {
        let mut items = Vec::new();
        while let Ok(media) = consumer.recv().await {
            items.push(media);
        }
        items
    }

    #[tokio::test]
    async fn test_clip_plays_to_end() {
        let mut h = harness(clip(1.0), false, false);
        let failed = h.worker.failed_flag();
        assert_eq!(h.worker.run(), WorkerExit::EndOfStream);
        assert!(h.closed.load(Ordering::Acquire));
        assert!(!failed.load(Ordering::Acquire));

        let video = drain(&mut h.video).await;
        assert_eq!(video.len(), 10);
        assert_eq!(video[0].pts(), Some(0));
        assert!(video.windows(2).all(|w| w[0].pts() < w[1].pts()));

        let audio = drain(&mut h.audio).await;
        for (i, media) in audio.iter().enumerate() {
            match media {
                Media::Frame(Frame::Audio(a)) => {
                    assert_eq!((a.sample_rate, a.channels, a.sample_count()), (48_000, 2, 960));
                    assert_eq!(a.pts, Some(i as i64 * 960));
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        // 1 s of 44.1 kHz input, minus the partial tail
        assert!(audio.len() >= 49);
        h.scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let cfg = SyntheticConfig {
            transient_every: Some(3),
            drop_pts_every: Some(4),
            audio: false,
            ..clip(1.0)
        };
        let mut h = harness(cfg, false, false);
        assert_eq!(h.worker.run(), WorkerExit::EndOfStream);

        let video = drain(&mut h.video).await;
        let summary = h.health.summary();
        assert!(summary.transient_retries > 0);
        assert_eq!(summary.video_decoded, 10);
        assert_eq!(summary.video_dropped + summary.video_forwarded, summary.video_decoded);
        assert_eq!(video.len() as u64, summary.video_forwarded);
        assert!(video.iter().all(|m| m.pts().is_some_and(|p| p >= 0)));
    }

    #[tokio::test]
    async fn test_fatal_error_ends_all_tracks() {
        let cfg = SyntheticConfig {
            fail_after: Some(5),
            ..clip(10.0)
        };
        let mut h = harness(cfg, false, false);
        let ended = h.worker.ended_flag();
        let failed = h.worker.failed_flag();

        assert!(matches!(h.worker.run(), WorkerExit::Failed(SourceError::Decode(_))));
        assert!(ended.load(Ordering::Acquire));
        assert!(failed.load(Ordering::Acquire));
        assert!(h.closed.load(Ordering::Acquire));
        assert_eq!(h.health.summary().fatal_errors, 1);

        drain(&mut h.video).await;
        drain(&mut h.audio).await;
        assert!(h.video.is_ended() && h.audio.is_ended());
    }

    #[test]
    fn test_quit_stops_live_source_quickly() {
        let h = harness(SyntheticConfig::default(), false, false);
        let quit = h.quit.clone();
        let handle = h.worker.spawn().unwrap();
        assert_eq!(h.health.worker_spawns(), 1);

        std::thread::sleep(Duration::from_millis(200));
        let asked = Instant::now();
        quit.cancel();
        assert_eq!(handle.join().unwrap(), WorkerExit::Quit);
        assert!(asked.elapsed() < Duration::from_millis(500));
        assert!(h.closed.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_loop_keeps_timeline_increasing() {
        let cfg = SyntheticConfig {
            audio: false,
            ..clip(0.5)
        };
        let h = harness(cfg, false, true);
        let (quit, mut video, health) = (h.quit.clone(), h.video, h.health.clone());
        let handle = h.worker.spawn().unwrap();

        let mut pts = Vec::new();
        while pts.len() < 20 {
            pts.push(video.recv().await.unwrap().pts().unwrap());
        }
        quit.cancel();
        assert_eq!(handle.join().unwrap(), WorkerExit::Quit);

        assert!(health.loops() >= 3);
        assert!(pts.windows(2).all(|w| w[0] < w[1]));
        // one frame interval across the seam
        assert_eq!(pts[5] - pts[4], 9000);
        drop(h.scheduler);
    }
}
