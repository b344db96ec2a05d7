//! Per-camera configuration

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Small non-negative integer, unique within a camera group
pub type CameraId = u32;

/// Camera configs keyed by camera id
pub type CameraConfigs = BTreeMap<CameraId, CameraConfig>;

pub const DEFAULT_WIDTH: u32 = 1280;
pub const DEFAULT_HEIGHT: u32 = 720;
pub const DEFAULT_CHANNELS: u8 = 3;
pub const DEFAULT_EXPOSURE: i32 = -7;
pub const DEFAULT_FRAMERATE: f64 = 30.0;
/// One frame every 100 s
pub const MIN_FRAMERATE: f64 = 0.01;

/// Image rotation applied once per frame, after capture
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rotation {
    #[default]
    None,
    Clockwise90,
    Rotate180,
    Counterclockwise90,
}

impl Rotation {
    pub fn degrees(self) -> u16 {
        match self {
            Rotation::None => 0,
            Rotation::Clockwise90 => 90,
            Rotation::Rotate180 => 180,
            Rotation::Counterclockwise90 => 270,
        }
    }

    pub fn from_degrees(degrees: u16) -> Option<Self> {
        match degrees {
            0 => Some(Rotation::None),
            90 => Some(Rotation::Clockwise90),
            180 => Some(Rotation::Rotate180),
            270 => Some(Rotation::Counterclockwise90),
            _ => None,
        }
    }

    /// Whether width and height trade places
    pub fn swaps_axes(self) -> bool {
        matches!(self, Rotation::Clockwise90 | Rotation::Counterclockwise90)
    }
}

/// Opaque 4-character codec tag
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FourCc([u8; 4]);

impl FourCc {
    pub const MJPG: FourCc = FourCc(*b"MJPG");
    pub const JPEG: FourCc = FourCc(*b"JPEG");
    pub const YUYV: FourCc = FourCc(*b"YUYV");
    pub const RGB3: FourCc = FourCc(*b"RGB3");
    pub const GREY: FourCc = FourCc(*b"GREY");

    pub fn new(code: [u8; 4]) -> Result<Self, ConfigError> {
        if code.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            Ok(Self(code))
        } else {
            Err(ConfigError::InvalidFourcc(
                String::from_utf8_lossy(&code).into_owned(),
            ))
        }
    }

    pub fn bytes(&self) -> [u8; 4] {
        self.0
    }

    /// Whether captured frames in this format can be turned into an image
    /// with `channels` channels. Raw formats pass through only when their
    /// layout already matches.
    pub fn is_capturable(&self, channels: u8) -> bool {
        match *self {
            FourCc::MJPG | FourCc::JPEG | FourCc::YUYV => true,
            FourCc::RGB3 => channels == 3,
            FourCc::GREY => channels == 1,
            _ => false,
        }
    }
}

impl FromStr for FourCc {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code: [u8; 4] = s
            .as_bytes()
            .try_into()
            .map_err(|_| ConfigError::InvalidFourcc(s.to_string()))?;
        Self::new(code)
    }
}

impl TryFrom<String> for FourCc {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FourCc> for String {
    fn from(value: FourCc) -> Self {
        value.to_string()
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({self})")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Configuration of a single camera.
///
/// Handed to a worker at start-up; afterwards it only changes through an
/// explicit update command, applied between acquire calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub camera_id: CameraId,
    pub enabled: bool,
    pub resolution: Resolution,
    pub color_channels: u8,
    /// Driver-specific exposure value
    pub exposure: i32,
    pub framerate: f64,
    pub rotation: Rotation,
    pub capture_fourcc: FourCc,
    pub writer_fourcc: FourCc,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            camera_id: 0,
            enabled: true,
            resolution: Resolution {
                width: DEFAULT_WIDTH,
                height: DEFAULT_HEIGHT,
            },
            color_channels: DEFAULT_CHANNELS,
            exposure: DEFAULT_EXPOSURE,
            framerate: DEFAULT_FRAMERATE,
            rotation: Rotation::None,
            capture_fourcc: FourCc::MJPG,
            writer_fourcc: FourCc::MJPG,
        }
    }
}

impl CameraConfig {
    pub fn new(camera_id: CameraId) -> Self {
        Self {
            camera_id,
            ..Default::default()
        }
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Resolution { width, height };
        self
    }

    pub fn with_framerate(mut self, framerate: f64) -> Self {
        self.framerate = framerate;
        self
    }

    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    /// Uncompressed image size in bytes
    pub fn image_size_bytes(&self) -> usize {
        self.resolution.width as usize
            * self.resolution.height as usize
            * self.color_channels as usize
    }

    pub fn frame_period(&self) -> Duration {
        period_of(self.framerate)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.framerate.is_finite() || self.framerate < MIN_FRAMERATE {
            return Err(ConfigError::InvalidFramerate {
                camera_id: self.camera_id,
                framerate: self.framerate,
            });
        }
        if self.resolution.width == 0 || self.resolution.height == 0 {
            return Err(ConfigError::InvalidResolution {
                camera_id: self.camera_id,
                width: self.resolution.width,
                height: self.resolution.height,
            });
        }
        if !matches!(self.color_channels, 1 | 3 | 4) {
            return Err(ConfigError::InvalidChannels {
                camera_id: self.camera_id,
                channels: self.color_channels,
            });
        }
        if !self.capture_fourcc.is_capturable(self.color_channels) {
            return Err(ConfigError::UnsupportedCaptureFourcc {
                camera_id: self.camera_id,
                fourcc: self.capture_fourcc.to_string(),
                channels: self.color_channels,
            });
        }
        Ok(())
    }
}

/// Validate a whole group and return only the enabled cameras
pub fn validate_configs(configs: &CameraConfigs) -> Result<CameraConfigs, ConfigError> {
    for (key, config) in configs {
        if *key != config.camera_id {
            return Err(ConfigError::KeyMismatch {
                key: *key,
                camera_id: config.camera_id,
            });
        }
        config.validate()?;
    }

    let enabled: CameraConfigs = configs
        .iter()
        .filter(|(_, config)| config.enabled)
        .map(|(id, config)| (*id, config.clone()))
        .collect();

    if enabled.is_empty() {
        return Err(ConfigError::NoCameras);
    }
    Ok(enabled)
}

/// The slowest camera sets the group cadence: `1 / min(framerate)`
pub fn ideal_frame_period(configs: &CameraConfigs) -> Option<Duration> {
    configs
        .values()
        .filter(|config| config.enabled)
        .map(|config| config.framerate)
        .fold(None, |slowest: Option<f64>, rate| {
            Some(slowest.map_or(rate, |s| s.min(rate)))
        })
        .map(period_of)
}

/// Rates below [`MIN_FRAMERATE`] are clamped so the period stays representable
fn period_of(framerate: f64) -> Duration {
    Duration::from_secs_f64(1.0 / framerate.max(MIN_FRAMERATE))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(rates: &[f64]) -> CameraConfigs {
        rates
            .iter()
            .enumerate()
            .map(|(i, rate)| (i as CameraId, CameraConfig::new(i as CameraId).with_framerate(*rate)))
            .collect()
    }

    #[test]
    fn slowest_camera_sets_the_period() {
        let period = ideal_frame_period(&group(&[30.0, 15.0, 60.0])).unwrap();
        assert_eq!(period, Duration::from_secs_f64(1.0 / 15.0));
    }

    #[test]
    fn tiny_framerates_never_overflow_the_period() {
        let configs = group(&[1e-30]);
        assert_eq!(
            ideal_frame_period(&configs),
            Some(Duration::from_secs_f64(1.0 / MIN_FRAMERATE))
        );
        let longest = Duration::from_secs_f64(1.0 / MIN_FRAMERATE);
        assert_eq!(configs[&0].frame_period(), longest);
        let nan = CameraConfig::new(0).with_framerate(f64::NAN);
        assert_eq!(nan.frame_period(), longest);
    }

    #[test]
    fn disabled_cameras_do_not_count() {
        let mut configs = group(&[30.0, 5.0]);
        configs.get_mut(&1).unwrap().enabled = false;
        let period = ideal_frame_period(&configs).unwrap();
        assert_eq!(period, Duration::from_secs_f64(1.0 / 30.0));

        let enabled = validate_configs(&configs).unwrap();
        assert_eq!(enabled.keys().copied().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn rejects_bad_configs() {
        let mut configs = group(&[30.0]);
        configs.get_mut(&0).unwrap().framerate = 0.0;
        assert!(matches!(
            validate_configs(&configs),
            Err(ConfigError::InvalidFramerate { camera_id: 0, .. })
        ));

        let mut configs = group(&[30.0]);
        configs.get_mut(&0).unwrap().framerate = 1e-30;
        assert!(matches!(
            validate_configs(&configs),
            Err(ConfigError::InvalidFramerate { camera_id: 0, .. })
        ));

        let mut configs = group(&[30.0]);
        configs.insert(7, CameraConfig::new(3));
        assert!(matches!(
            validate_configs(&configs),
            Err(ConfigError::KeyMismatch { key: 7, camera_id: 3 })
        ));

        let mut configs = group(&[30.0]);
        configs.get_mut(&0).unwrap().enabled = false;
        assert!(matches!(validate_configs(&configs), Err(ConfigError::NoCameras)));

        let mut configs = group(&[30.0]);
        configs.get_mut(&0).unwrap().color_channels = 2;
        assert!(validate_configs(&configs).is_err());
    }

    #[test]
    fn capture_fourcc_must_be_unpackable() {
        let mut configs = group(&[30.0]);
        configs.get_mut(&0).unwrap().capture_fourcc = FourCc::YUYV;
        assert!(validate_configs(&configs).is_ok());

        configs.get_mut(&0).unwrap().capture_fourcc = "H264".parse().unwrap();
        assert!(matches!(
            validate_configs(&configs),
            Err(ConfigError::UnsupportedCaptureFourcc { camera_id: 0, .. })
        ));

        // 3-channel config cannot take single-channel raw frames
        configs.get_mut(&0).unwrap().capture_fourcc = FourCc::GREY;
        assert!(validate_configs(&configs).is_err());
        configs.get_mut(&0).unwrap().color_channels = 1;
        assert!(validate_configs(&configs).is_ok());
    }

    #[test]
    fn fourcc_parsing() {
        assert_eq!("MJPG".parse::<FourCc>().unwrap(), FourCc::MJPG);
        assert!("MJPEG".parse::<FourCc>().is_err());
        assert!(FourCc::new([0, b'a', b'b', b'c']).is_err());
        assert_eq!(FourCc::MJPG.to_string(), "MJPG");
    }

    #[test]
    fn rotation_degrees_round_trip() {
        for rotation in [
            Rotation::None,
            Rotation::Clockwise90,
            Rotation::Rotate180,
            Rotation::Counterclockwise90,
        ] {
            assert_eq!(Rotation::from_degrees(rotation.degrees()), Some(rotation));
        }
        assert_eq!(Rotation::from_degrees(45), None);
    }
}
