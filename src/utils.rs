use serde::{Deserialize, Serialize};
use tracing::info;

use crate::capture::config::{CameraId, FourCc};
use crate::capture::device::DeviceBackend;
use crate::error::DeviceError;

/// Capture device found by [`detect_devices`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedDevice {
    pub camera_id: CameraId,
    pub name: String,
    /// Preferred capture codec, if the device advertises one we support
    pub fourcc: Option<FourCc>,
}

/// Enumerate the cameras the backend can open
pub fn detect_devices(backend: &DeviceBackend) -> Result<Vec<DetectedDevice>, DeviceError> {
    info!("Detecting capture devices...");
    let devices = match backend {
        DeviceBackend::Synthetic(options) => (0..options.cameras)
            .map(|camera_id| DetectedDevice {
                camera_id,
                name: format!("synthetic-{camera_id}"),
                fourcc: Some(FourCc::MJPG),
            })
            .collect(),
        DeviceBackend::V4l2 => detect_v4l2()?,
    };
    info!("Found {} capture devices", devices.len());
    Ok(devices)
}

#[cfg(feature = "v4l2")]
const MAX_VIDEO_NODES: u32 = 64;

#[cfg(feature = "v4l2")]
fn detect_v4l2() -> Result<Vec<DetectedDevice>, DeviceError> {
    use std::path::Path;

    use tracing::debug;
    use v4l::{capability::Flags, video::Capture, Device, FourCC};

    let mut found = Vec::new();
    for camera_id in 0..MAX_VIDEO_NODES {
        let path = format!("/dev/video{camera_id}");
        if !Path::new(&path).exists() {
            continue;
        }
        let Ok(dev) = Device::with_path(&path) else {
            debug!("{path}: cannot open");
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        // metadata nodes share the driver but cannot capture
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }
        let formats = dev.enum_formats().unwrap_or_default();
        let fourcc = [b"MJPG", b"YUYV"].into_iter().find_map(|code| {
            formats
                .iter()
                .any(|fmt| fmt.fourcc == FourCC::new(code))
                .then(|| FourCc::new(*code).ok())
                .flatten()
        });
        info!("Found {path} - {} ({fourcc:?})", caps.card);
        found.push(DetectedDevice {
            camera_id,
            name: caps.card,
            fourcc,
        });
    }
    Ok(found)
}

#[cfg(not(feature = "v4l2"))]
fn detect_v4l2() -> Result<Vec<DetectedDevice>, DeviceError> {
    Err(DeviceError::FailedToOpenDevice {
        camera_id: 0,
        reason: "built without the v4l2 feature".into(),
    })
}
