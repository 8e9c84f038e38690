//! Desktop grabber command line
//!
//! Screen capture goes through the platform grab device of the `ffmpeg`
//! command line tool: gdigrab on Windows, x11grab on Linux, avfoundation on
//! macOS. The grabber writes raw video as NUT to stdout, which the FFmpeg
//! source demuxes like any other live stream.

use std::process::{Command, Stdio};

use crate::capture::region::CaptureRegion;

/// Id selecting the whole desktop, cropped to the region
pub const DESKTOP_ID: &str = "desktop";

const GRABBER: &str = "ffmpeg";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    Windows,
    MacOs,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }
}

/// Grab device invocation for one capture region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInput {
    pub format: &'static str,
    pub input: String,
    pub options: Vec<(&'static str, String)>,
    /// Crop applied after grabbing, for devices that cannot grab a sub-rectangle
    pub filter: Option<String>,
}

impl DeviceInput {
    /// The grab device for `region`, or `None` when its id is not a desktop.
    ///
    /// Besides [`DESKTOP_ID`], X display names (`:0`, `:1.0`) select a
    /// specific display on Linux.
    pub fn for_region(region: &CaptureRegion, platform: Platform) -> Option<Self> {
        let id = region.device_or_desktop_id.as_str();
        let display = match (platform, id) {
            (_, DESKTOP_ID) => None,
            (Platform::Linux, id) if id.starts_with(':') => Some(id.to_string()),
            _ => return None,
        };

        let size = format!("{}x{}", region.width, region.height);
        let framerate = region.framerate.to_string();

        Some(match platform {
            Platform::Windows => DeviceInput {
                format: "gdigrab",
                input: String::from(DESKTOP_ID),
                options: vec![
                    ("video_size", size),
                    ("framerate", framerate),
                    ("offset_x", region.offset_x.to_string()),
                    ("offset_y", region.offset_y.to_string()),
                    ("show_region", String::from("1")),
                ],
                filter: None,
            },
            Platform::Linux => {
                let display = display
                    .or_else(|| std::env::var("DISPLAY").ok().filter(|d| !d.is_empty()))
                    .unwrap_or_else(|| String::from(":0.0"));
                DeviceInput {
                    format: "x11grab",
                    input: format!("{}+{},{}", display, region.offset_x, region.offset_y),
                    options: vec![
                        ("video_size", size),
                        ("framerate", framerate),
                        ("show_region", String::from("1")),
                        ("draw_mouse", String::from("1")),
                    ],
                    filter: None,
                }
            }
            Platform::MacOs => DeviceInput {
                format: "avfoundation",
                input: String::from("Capture screen 0:none"),
                options: vec![
                    ("framerate", framerate),
                    ("capture_cursor", String::from("1")),
                ],
                filter: Some(format!(
                    "crop={}:{}:{}:{}",
                    region.width, region.height, region.offset_x, region.offset_y
                )),
            },
        })
    }

    /// Arguments for a grabber writing raw yuv420p video as NUT to stdout
    pub fn grabber_args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-f", self.format]
            .into_iter()
            .map(String::from)
            .collect();
        for (key, value) in &self.options {
            args.push(format!("-{}", key));
            args.push(value.clone());
        }
        args.push(String::from("-i"));
        args.push(self.input.clone());
        if let Some(filter) = &self.filter {
            args.push(String::from("-vf"));
            args.push(filter.clone());
        }
        args.extend(
            ["-an", "-c:v", "rawvideo", "-pix_fmt", "yuv420p", "-f", "nut", "-"]
                .into_iter()
                .map(String::from),
        );
        args
    }

    pub fn grabber_command(&self) -> Command {
        let mut command = Command::new(GRABBER);
        command
            .args(self.grabber_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        command
    }
}
