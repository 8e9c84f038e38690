//! Media sources
//!
//! A source turns a capture region into a blocking sequence of frames or
//! packets. `testsrc` selects the built-in synthetic source; `desktop` grabs
//! the screen through the `ffmpeg` tool; anything else is read as a file or
//! stream. Everything but `testsrc` needs the `ffmpeg` feature.

pub mod device;
#[cfg(feature = "ffmpeg")]
mod ffmpeg;
pub mod region;
pub mod synthetic;
mod traits;

use std::time::Duration;

#[cfg(feature = "ffmpeg")]
pub use ffmpeg::FfmpegSource;
pub use device::{DESKTOP_ID, DeviceInput, Platform};
pub use region::{CaptureRegion, RegionError};
pub use synthetic::{SyntheticConfig, SyntheticSource};
pub use traits::{MediaSource, SourceError, SourceFactory, SourceOptions};

/// Id of the synthetic live source; `testsrc:<seconds>` selects a finite clip
pub const TEST_SOURCE_ID: &str = "testsrc";

fn synthetic_config(id: &str) -> Result<Option<SyntheticConfig>, SourceError> {
    if id == TEST_SOURCE_ID {
        return Ok(Some(SyntheticConfig::default()));
    }
    let Some(secs) = id
        .strip_prefix(TEST_SOURCE_ID)
        .and_then(|rest| rest.strip_prefix(':'))
    else {
        return Ok(None);
    };
    let secs: f64 = secs
        .parse()
        .map_err(|_| SourceError::Open(format!("invalid clip length in '{}'", id)))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(SourceError::Open(format!("invalid clip length in '{}'", id)));
    }
    Ok(Some(SyntheticConfig::clip(Duration::from_secs_f64(secs))))
}

/// Open the source named by `region.device_or_desktop_id`
pub fn open_source(
    region: &CaptureRegion,
    options: &SourceOptions,
) -> Result<Box<dyn MediaSource>, SourceError> {
    if let Some(cfg) = synthetic_config(&region.device_or_desktop_id)? {
        return SyntheticSource::factory(cfg)(region, options);
    }

    #[cfg(feature = "ffmpeg")]
    {
        Ok(Box::new(FfmpegSource::open(region, options)?))
    }

    #[cfg(not(feature = "ffmpeg"))]
    {
        let what = match DeviceInput::for_region(region, Platform::current()) {
            Some(device) => format!("desktop capture via {}", device.format),
            None => format!("'{}'", region.device_or_desktop_id),
        };
        Err(SourceError::Open(format!(
            "{} needs FFmpeg support (build with --features ffmpeg)",
            what
        )))
    }
}

/// Factory used when none is configured
pub fn default_factory() -> SourceFactory {
    Box::new(open_source)
}
