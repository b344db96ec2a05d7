pub mod capture;
pub mod clock;
pub mod controller;
pub mod error;
pub mod ipc;
pub mod pipeline;
pub mod recording;
pub mod supervisor;
pub mod utils;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use capture::{CameraConfig, CameraConfigs, CameraId, DeviceBackend, SyntheticOptions};
pub use controller::CameraGroupController;
pub use error::{Error, Result};
use error::ConfigError;

/// Prefix of environment overrides, e.g. `POLYCAM__CAPTURE__PIN_WORKERS=true`
pub const ENV_PREFIX: &str = "POLYCAM";

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureSettings,
    pub pipeline: PipelineSettings,
    pub recording: RecordingSettings,
}

/// Where worker hosts run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaptureStrategy {
    /// Worker threads inside this process
    #[default]
    Thread,
    /// One child process per host. `None` re-executes the current binary.
    Process { executable: Option<PathBuf> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub backend: DeviceBackend,
    pub strategy: CaptureStrategy,
    pub cameras_per_process: usize,
    pub slots_per_camera: u32,
    pub start_timeout_ms: u64,
    pub stop_timeout_ms: u64,
    pub pin_workers: bool,
    pub allow_partial_start: bool,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            backend: DeviceBackend::default(),
            strategy: CaptureStrategy::default(),
            cameras_per_process: 1,
            slots_per_camera: 8,
            start_timeout_ms: 5_000,
            stop_timeout_ms: 3_000,
            pin_workers: false,
            allow_partial_start: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Frame loop sleep when a tick found nothing to do
    pub idle_sleep_us: u64,
    /// Oldest frame backfill may reuse; unset reuses indefinitely
    pub max_staleness_ms: Option<u64>,
    /// Emission intervals kept for the framerate estimate
    pub framerate_window: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            idle_sleep_us: 500,
            max_staleness_ms: None,
            framerate_window: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingSettings {
    pub jpeg_quality: u8,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self { jpeg_quality: 85 }
    }
}

impl Config {
    /// Defaults, then the TOML file if given, then `POLYCAM__*` variables
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn defaults_without_file() {
        let config = Config::load(None).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("polycam.toml");
        fs::write(
            &path,
            r#"
[capture]
cameras_per_process = 2
allow_partial_start = true

[capture.strategy]
kind = "process"

[capture.backend]
kind = "synthetic"
cameras = 6
fail_open = [3]

[pipeline]
max_staleness_ms = 250
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.capture.cameras_per_process, 2);
        assert!(config.capture.allow_partial_start);
        assert_eq!(config.capture.strategy, CaptureStrategy::Process { executable: None });
        assert_eq!(
            config.capture.backend,
            DeviceBackend::Synthetic(SyntheticOptions {
                cameras: 6,
                fail_open: vec![3],
                ..Default::default()
            })
        );
        assert_eq!(config.pipeline.max_staleness_ms, Some(250));
        assert_eq!(config.pipeline.framerate_window, 120);
        assert_eq!(config.recording.jpeg_quality, 85);
    }

    #[test]
    fn missing_file_is_an_error() {
        let result = Config::load(Some(Path::new("/nonexistent/polycam.toml")));
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }
}
