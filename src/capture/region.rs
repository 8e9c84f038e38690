//! Capture rectangle handed over by the region selector

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::assets::FRAME_RATE;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegionError {
    #[error("video size too small: {width}x{height}")]
    InvalidSize { width: i32, height: i32 },

    #[error("frame rate must be positive")]
    InvalidFramerate,

    #[error("cannot parse region '{0}', expected WxH or WxH+X+Y")]
    Parse(String),
}

/// Region of a device or desktop to capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureRegion {
    pub device_or_desktop_id: String,
    pub width: i32,
    pub height: i32,
    pub offset_x: i32,
    pub offset_y: i32,
    pub framerate: u32,
}

impl Default for CaptureRegion {
    fn default() -> Self {
        Self {
            device_or_desktop_id: String::from("desktop"),
            width: 640,
            height: 480,
            offset_x: 0,
            offset_y: 0,
            framerate: FRAME_RATE,
        }
    }
}

impl CaptureRegion {
    pub fn new(device_or_desktop_id: impl Into<String>, width: i32, height: i32) -> Self {
        Self {
            device_or_desktop_id: device_or_desktop_id.into(),
            width,
            height,
            ..Default::default()
        }
    }

    pub fn with_offset(mut self, offset_x: i32, offset_y: i32) -> Self {
        self.offset_x = offset_x;
        self.offset_y = offset_y;
        self
    }

    pub fn with_framerate(mut self, framerate: u32) -> Self {
        self.framerate = framerate;
        self
    }

    /// Build a region from the two corners of a mouse drag, in any order
    pub fn from_corners(
        device_or_desktop_id: impl Into<String>,
        start: (i32, i32),
        end: (i32, i32),
    ) -> Self {
        let offset_x = start.0.min(end.0);
        let offset_y = start.1.min(end.1);
        Self {
            device_or_desktop_id: device_or_desktop_id.into(),
            width: start.0.max(end.0) - offset_x,
            height: start.1.max(end.1) - offset_y,
            offset_x,
            offset_y,
            framerate: FRAME_RATE,
        }
    }

    pub fn validate(&self) -> Result<(), RegionError> {
        if self.width <= 0 || self.height <= 0 {
            return Err(RegionError::InvalidSize {
                width: self.width,
                height: self.height,
            });
        }
        if self.framerate == 0 {
            return Err(RegionError::InvalidFramerate);
        }
        Ok(())
    }

    /// Parse the geometry part `WxH` or `WxH+X+Y`, keeping id and frame rate
    pub fn parse_geometry(&self, geometry: &str) -> Result<Self, RegionError> {
        let err = || RegionError::Parse(geometry.to_string());

        let mut parts = geometry.trim().splitn(2, '+');
        let size = parts.next().ok_or_else(err)?;
        let (w, h) = size.split_once(['x', 'X']).ok_or_else(err)?;
        let width = w.trim().parse::<i32>().map_err(|_| err())?;
        let height = h.trim().parse::<i32>().map_err(|_| err())?;

        let (offset_x, offset_y) = match parts.next() {
            Some(offsets) => {
                let (x, y) = offsets.split_once('+').ok_or_else(err)?;
                (
                    x.trim().parse::<i32>().map_err(|_| err())?,
                    y.trim().parse::<i32>().map_err(|_| err())?,
                )
            }
            None => (0, 0),
        };

        Ok(Self {
            width,
            height,
            offset_x,
            offset_y,
            ..self.clone()
        })
    }
}

impl fmt::Display for CaptureRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {}) - {}x{} @{}fps",
            self.device_or_desktop_id,
            self.offset_x,
            self.offset_y,
            self.width,
            self.height,
            self.framerate
        )
    }
}
