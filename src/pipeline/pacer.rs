//! Playback pacing and timeline rebasing
//!
//! [`PlaybackPacer`] keeps decoding of non-live sources at most one second
//! ahead of wall-clock time and decides whether end-of-stream loops.
//! [`Timeline`] moves a stream's timestamps so its visible timeline starts at
//! zero and keeps increasing across loops.

use std::time::{Duration, Instant};

use crate::assets::{READ_AHEAD, SOURCE_POLL_INTERVAL};
use crate::capture::MediaSource;
use crate::pipeline::types::Media;
use crate::utils::sos::SignalOfStop;

/// How long to hold an item with presentation time `t` seconds, given the
/// time elapsed since playback started.
pub fn read_ahead_delay(t: f64, elapsed: Duration, read_ahead: Duration) -> Duration {
    let ahead = t - elapsed.as_secs_f64() - read_ahead.as_secs_f64();
    if ahead > 0.0 {
        Duration::from_secs_f64(ahead)
    } else {
        Duration::ZERO
    }
}

pub struct PlaybackPacer {
    throttle: bool,
    loop_enabled: bool,
    read_ahead: Duration,
    started: Option<Instant>,
}

impl PlaybackPacer {
    pub fn new(throttle: bool, loop_enabled: bool) -> Self {
        Self {
            throttle,
            loop_enabled,
            read_ahead: READ_AHEAD,
            started: None,
        }
    }

    /// Live capture devices already produce at real-time rate
    pub fn should_throttle(source: &dyn MediaSource) -> bool {
        !source.is_live()
    }

    pub fn is_throttling(&self) -> bool {
        self.throttle
    }

    pub fn loop_enabled(&self) -> bool {
        self.loop_enabled
    }

    /// Whether a terminal end-of-stream from `source` should seek back to zero
    pub fn should_loop(&self, source: &dyn MediaSource) -> bool {
        self.loop_enabled && source.can_seek()
    }

    /// Delay owed before delivering an item at `t` seconds. The first call
    /// starts the playback clock.
    pub fn delay_for(&mut self, t: f64, now: Instant) -> Duration {
        if !self.throttle {
            return Duration::ZERO;
        }
        let started = *self.started.get_or_insert(now);
        read_ahead_delay(t, now.saturating_duration_since(started), self.read_ahead)
    }

    /// Block the decode thread until the item at `t` may be delivered.
    /// Sleeps in slices so quit is observed; returns `false` if quit was signalled.
    pub fn wait(&mut self, t: Option<f64>, quit: &SignalOfStop) -> bool {
        let Some(t) = t else {
            return !quit.cancelled();
        };

        loop {
            let delay = self.delay_for(t, Instant::now());
            if delay.is_zero() {
                return !quit.cancelled();
            }
            if quit.sleep(delay.min(SOURCE_POLL_INTERVAL)) {
                return false;
            }
        }
    }
}

/// Per-run baseline for one stream kind
#[derive(Debug, Default)]
pub struct Timeline {
    first_pts: Option<i64>,
    last_out: Option<i64>,
    last_step: i64,
    resync: bool,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebase `media` in place. Returns `false` when it cannot be placed on the
    /// timeline (no timestamp, or earlier than the baseline).
    pub fn rebase(&mut self, media: &mut Media) -> bool {
        let Some(pts) = media.pts() else {
            return false;
        };

        if self.resync {
            // continue one frame after the last delivered item
            let next = self.last_out.map_or(0, |last| last + self.last_step.max(1));
            self.first_pts = Some(pts - next);
            self.resync = false;
        }
        let first = *self.first_pts.get_or_insert(pts);

        let out = pts - first;
        if out < 0 {
            return false;
        }
        if let Some(last) = self.last_out
            && out > last
        {
            self.last_step = out - last;
        }
        self.last_out = Some(out);
        media.shift(first);
        true
    }

    /// The source was seeked back to its start: re-anchor on the next item
    pub fn on_loop(&mut self) {
        if self.last_out.is_some() {
            self.resync = true;
        }
    }

    pub fn last_pts(&self) -> Option<i64> {
        self.last_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{Frame, PixelFormat, TimeBase, VideoFrame};
    use bytes::Bytes;

    fn video(pts: Option<i64>) -> Media {
        Media::Frame(Frame::Video(VideoFrame {
            pts,
            time_base: TimeBase::new(1, 90_000),
            width: 1,
            height: 1,
            format: PixelFormat::Rgb24,
            data: Bytes::from_static(&[0, 0, 0]),
        }))
    }

    #[test]
    fn test_read_ahead_delay() {
        let ra = Duration::from_secs(1);
        assert_eq!(read_ahead_delay(0.5, Duration::ZERO, ra), Duration::ZERO);
        assert_eq!(read_ahead_delay(1.0, Duration::ZERO, ra), Duration::ZERO);
        let d = read_ahead_delay(3.0, Duration::from_millis(500), ra);
        assert!((d.as_secs_f64() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_unthrottled_never_waits() {
        let mut pacer = PlaybackPacer::new(false, false);
        let now = Instant::now();
        assert_eq!(pacer.delay_for(100.0, now), Duration::ZERO);
    }

    #[test]
    fn test_throttle_clock_starts_on_first_item() {
        let mut pacer = PlaybackPacer::new(true, false);
        let start = Instant::now();
        assert_eq!(pacer.delay_for(0.0, start), Duration::ZERO);
        let d = pacer.delay_for(2.0, start + Duration::from_millis(250));
        assert!((d.as_secs_f64() - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_wait_aborts_on_quit() {
        let mut pacer = PlaybackPacer::new(true, false);
        let quit = SignalOfStop::new();
        assert!(pacer.wait(Some(0.0), &quit));

        quit.cancel();
        let started = Instant::now();
        assert!(!pacer.wait(Some(30.0), &quit));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_rebase_starts_at_zero() {
        let mut timeline = Timeline::new();
        let mut first = video(Some(123_456));
        let mut second = video(Some(126_456));

        assert!(timeline.rebase(&mut first));
        assert!(timeline.rebase(&mut second));
        assert_eq!(first.pts(), Some(0));
        assert_eq!(second.pts(), Some(3000));
    }

    #[test]
    fn test_rebase_rejects_missing_and_early() {
        let mut timeline = Timeline::new();
        assert!(!timeline.rebase(&mut video(None)));

        assert!(timeline.rebase(&mut video(Some(5000))));
        assert!(!timeline.rebase(&mut video(Some(4000))));
    }

    #[test]
    fn test_loop_continues_timeline() {
        let mut timeline = Timeline::new();
        for pts in [1000, 4000, 7000] {
            assert!(timeline.rebase(&mut video(Some(pts))));
        }
        assert_eq!(timeline.last_pts(), Some(6000));

        timeline.on_loop();
        let mut looped = video(Some(1000));
        assert!(timeline.rebase(&mut looped));
        assert_eq!(looped.pts(), Some(9000));

        let mut next = video(Some(4000));
        assert!(timeline.rebase(&mut next));
        assert_eq!(next.pts(), Some(12_000));
    }
}
