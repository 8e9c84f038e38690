use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::assets::{SESSION_TEARDOWN_TIMEOUT, WORKER_JOIN_TIMEOUT};
use crate::capture::{CaptureRegion, SourceOptions};
use crate::session::Credentials;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// How the capture pipeline reads and paces its source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub region: CaptureRegion,
    /// Decode into frames; `false` forwards compressed packets
    pub decode: bool,
    pub audio: bool,
    /// Seek back to the start when the source runs out
    pub loop_enabled: bool,
    /// Pace delivery to wall-clock time; unset means "unless the source is live"
    pub throttle: Option<bool>,
    /// Milliseconds to wait for the decode thread on stop
    pub join_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            region: CaptureRegion::default(),
            decode: true,
            audio: true,
            loop_enabled: false,
            throttle: None,
            join_timeout_ms: WORKER_JOIN_TIMEOUT.as_millis() as u64,
        }
    }
}

impl PipelineConfig {
    pub fn source_options(&self) -> SourceOptions {
        SourceOptions {
            decode: self.decode,
            audio: self.audio,
        }
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

/// Remote session settings. An empty `server_url` keeps the pipeline local.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub server_url: String,
    pub api_secret: String,
    pub token: String,
    pub room_id: i64,
    pub display_name: String,
    /// Milliseconds allowed for unpublish, leave and disconnect together
    pub teardown_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            api_secret: String::new(),
            token: String::new(),
            room_id: 0,
            display_name: app_name().to_string(),
            teardown_timeout_ms: SESSION_TEARDOWN_TIMEOUT.as_millis() as u64,
        }
    }
}

impl SessionConfig {
    pub fn is_enabled(&self) -> bool {
        !self.server_url.trim().is_empty()
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            api_secret: self.api_secret.clone(),
            token: self.token.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub pipeline: PipelineConfig,
    pub session: SessionConfig,
}

impl AppConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_local_preview() {
        let config = AppConfig::default();
        assert!(!config.session.is_enabled());
        assert_eq!(config.pipeline.join_timeout(), WORKER_JOIN_TIMEOUT);
        assert_eq!(config.pipeline.throttle, None);
        assert_eq!(config.session.display_name, "kandar");
        assert_eq!(config.session.teardown_timeout(), SESSION_TEARDOWN_TIMEOUT);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = AppConfig::from_json(
            r#"{
                "pipeline": { "region": { "width": 800, "height": 600, "offset_x": 10 }, "loop_enabled": true },
                "session": { "server_url": "wss://sfu.example.test", "room_id": 1234 }
            }"#,
        )
        .unwrap();

        let region = &config.pipeline.region;
        assert_eq!((region.width, region.height, region.offset_x), (800, 600, 10));
        assert_eq!(region.device_or_desktop_id, "desktop");
        assert!(config.pipeline.loop_enabled);
        assert!(config.pipeline.decode);
        assert!(config.session.is_enabled());
        assert_eq!(config.session.room_id, 1234);
    }

    #[test]
    fn test_blank_server_url_disables_session() {
        let session = SessionConfig {
            server_url: String::from("   "),
            ..Default::default()
        };
        assert!(!session.is_enabled());
    }

    #[test]
    fn test_load_reports_path() {
        let err = AppConfig::load("/nonexistent/kandar.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/kandar.json"));
        assert!(matches!(
            AppConfig::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
