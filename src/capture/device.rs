//! Capture device abstraction.
//!
//! `read` is the one call in the whole pipeline that is allowed to block:
//! it waits for the device to deliver the next frame.

use std::thread;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::config::{CameraConfig, CameraId};
use super::frame::{PixelType, RawImage};
use crate::error::DeviceError;

pub trait CaptureDevice: Send {
    /// Block until the next frame. `Ok(None)` means the device answered
    /// without data, which the caller treats as a dropped frame.
    fn read(&mut self) -> Result<Option<RawImage>, DeviceError>;

    /// Apply resolution/exposure/framerate/fourcc changes
    fn apply_config(&mut self, config: &CameraConfig) -> Result<(), DeviceError>;

    /// Release the device handle
    fn release(&mut self) {}
}

/// Which driver backs the capture devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceBackend {
    Synthetic(SyntheticOptions),
    V4l2,
}

impl Default for DeviceBackend {
    fn default() -> Self {
        DeviceBackend::Synthetic(SyntheticOptions::default())
    }
}

/// Test-pattern cameras with fault injection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticOptions {
    /// How many cameras `detect` reports
    pub cameras: u32,
    /// Cameras whose open fails
    pub fail_open: Vec<CameraId>,
    /// Cameras that open but never deliver the first frame
    pub fail_first_read: Vec<CameraId>,
    /// Every Nth read answers without data
    pub drop_every: Option<u32>,
}

impl Default for SyntheticOptions {
    fn default() -> Self {
        Self {
            cameras: 2,
            fail_open: Vec::new(),
            fail_first_read: Vec::new(),
            drop_every: None,
        }
    }
}

/// Open the device for `config` on the given backend
pub fn open_device(
    backend: &DeviceBackend,
    config: &CameraConfig,
) -> Result<Box<dyn CaptureDevice>, DeviceError> {
    match backend {
        DeviceBackend::Synthetic(options) => {
            Ok(Box::new(SyntheticDevice::open(config, options.clone())?))
        }
        #[cfg(feature = "v4l2")]
        DeviceBackend::V4l2 => Ok(Box::new(super::v4l2::V4l2Device::open(config)?)),
        #[cfg(not(feature = "v4l2"))]
        DeviceBackend::V4l2 => Err(DeviceError::FailedToOpenDevice {
            camera_id: config.camera_id,
            reason: "built without the `v4l2` feature".into(),
        }),
    }
}

/// Paced test-pattern generator standing in for a real camera
pub struct SyntheticDevice {
    config: CameraConfig,
    options: SyntheticOptions,
    reads: u64,
    next_deadline: Option<Instant>,
}

impl SyntheticDevice {
    pub fn open(config: &CameraConfig, options: SyntheticOptions) -> Result<Self, DeviceError> {
        if options.fail_open.contains(&config.camera_id) {
            return Err(DeviceError::FailedToOpenDevice {
                camera_id: config.camera_id,
                reason: "synthetic open failure".into(),
            });
        }
        info!(
            "Camera {}: synthetic device {}x{} @ {} fps",
            config.camera_id, config.resolution.width, config.resolution.height, config.framerate
        );
        Ok(Self {
            config: config.clone(),
            options,
            reads: 0,
            next_deadline: None,
        })
    }

    fn pattern(&self) -> Bytes {
        let width = self.config.resolution.width as usize;
        let channels = self.config.color_channels as usize;
        let shift = (self.reads % 256) as usize;
        let pixels = (0..self.config.image_size_bytes())
            .map(|i| {
                let x = (i / channels) % width;
                ((x + shift + i % channels) % 256) as u8
            })
            .collect::<Vec<u8>>();
        Bytes::from(pixels)
    }

    fn wait_for_next_frame(&mut self) {
        let period = self.config.frame_period();
        let now = Instant::now();
        let deadline = match self.next_deadline {
            Some(deadline) if deadline > now => {
                thread::sleep(deadline - now);
                deadline
            }
            // running late or first frame: resync instead of bursting
            _ => now,
        };
        self.next_deadline = Some(deadline + period);
    }
}

impl CaptureDevice for SyntheticDevice {
    fn read(&mut self) -> Result<Option<RawImage>, DeviceError> {
        self.wait_for_next_frame();
        self.reads += 1;

        if self.reads == 1 && self.options.fail_first_read.contains(&self.config.camera_id) {
            return Ok(None);
        }
        if let Some(every) = self.options.drop_every.filter(|n| *n > 0) {
            if self.reads > 1 && self.reads % u64::from(every) == 0 {
                return Ok(None);
            }
        }

        let image = RawImage::from_pixels(
            self.config.resolution.width,
            self.config.resolution.height,
            self.config.color_channels,
            PixelType::U8,
            self.pattern(),
        )
        .map_err(|e| DeviceError::ReadFailed {
            camera_id: self.config.camera_id,
            reason: e.to_string(),
        })?;
        Ok(Some(image))
    }

    fn apply_config(&mut self, config: &CameraConfig) -> Result<(), DeviceError> {
        self.config = config.clone();
        self.next_deadline = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(camera_id: CameraId) -> CameraConfig {
        CameraConfig::new(camera_id)
            .with_resolution(8, 4)
            .with_framerate(500.0)
    }

    #[test]
    fn synthetic_device_produces_sized_frames() {
        let mut device = SyntheticDevice::open(&small(0), SyntheticOptions::default()).unwrap();
        let image = device.read().unwrap().unwrap();
        assert_eq!((image.width, image.height, image.channels), (8, 4, 3));
        assert_eq!(image.byte_len(), 8 * 4 * 3);

        let next = device.read().unwrap().unwrap();
        assert_ne!(image.bytes().unwrap(), next.bytes().unwrap());
    }

    #[test]
    fn open_failure_is_reported_per_camera() {
        let options = SyntheticOptions {
            fail_open: vec![1],
            ..Default::default()
        };
        let backend = DeviceBackend::Synthetic(options);
        assert!(open_device(&backend, &small(0)).is_ok());
        match open_device(&backend, &small(1)) {
            Err(DeviceError::FailedToOpenDevice { camera_id, .. }) => assert_eq!(camera_id, 1),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn drop_every_skips_reads() {
        let options = SyntheticOptions {
            drop_every: Some(3),
            ..Default::default()
        };
        let mut device = SyntheticDevice::open(&small(0), options).unwrap();
        let delivered = (0..9)
            .map(|_| device.read().unwrap().is_some())
            .collect::<Vec<_>>();
        assert_eq!(
            delivered,
            vec![true, true, false, true, true, false, true, true, false]
        );
    }

    #[test]
    fn reconfigure_changes_resolution() {
        let mut device = SyntheticDevice::open(&small(0), SyntheticOptions::default()).unwrap();
        device
            .apply_config(&small(0).with_resolution(2, 2))
            .unwrap();
        let image = device.read().unwrap().unwrap();
        assert_eq!((image.width, image.height), (2, 2));
    }
}
