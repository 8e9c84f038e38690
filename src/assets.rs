use std::time::Duration;

pub const FRAME_RATE: u32 = 30;

// audio track format
pub const AUDIO_SAMPLE_RATE: u32 = 48_000;
pub const AUDIO_CHANNELS: u16 = 2;
pub const AUDIO_PTIME: Duration = Duration::from_millis(20);
pub const AUDIO_SAMPLES_PER_FRAME: usize =
    (AUDIO_SAMPLE_RATE as u64 * AUDIO_PTIME.as_millis() as u64 / 1000) as usize;

// pacing
pub const READ_AHEAD: Duration = Duration::from_secs(1);
pub const RETRY_BACKOFF: Duration = Duration::from_millis(10);
/// Upper bound for a single blocking source read, and for any sleep slice on the
/// decode thread. Quit is observed at least this often.
pub const SOURCE_POLL_INTERVAL: Duration = Duration::from_millis(100);

// lifecycle
pub const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
pub const SESSION_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);
pub const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);
/// A running pipeline that forwarded nothing for this long is reported as stalled
pub const STALL_THRESHOLD: Duration = Duration::from_secs(5);

pub const VIDEO_TIME_BASE_DEN: i32 = 90_000;
