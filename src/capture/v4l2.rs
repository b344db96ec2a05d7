//! V4L2 capture device with memory-mapped streaming buffers

use bytes::Bytes;
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control, Value};
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::config::{CameraConfig, CameraId, FourCc};
use super::decoder;
use super::device::CaptureDevice;
use super::frame::{Compression, PixelType, RawImage};
use crate::error::DeviceError;

const BUFFER_COUNT: u32 = 4;
const CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;

/// `/dev/video<camera_id>`
pub struct V4l2Device {
    camera_id: CameraId,
    device: Device,
    stream: Option<MmapStream<'static>>,
    config: CameraConfig,
    /// Bytes per row as reported by the driver
    stride: usize,
}

impl V4l2Device {
    pub fn open(config: &CameraConfig) -> Result<Self, DeviceError> {
        let camera_id = config.camera_id;
        let open_err = |reason: String| DeviceError::FailedToOpenDevice { camera_id, reason };

        let device = Device::new(camera_id as usize).map_err(|e| open_err(e.to_string()))?;
        let caps = device.query_caps().map_err(|e| open_err(e.to_string()))?;
        info!("Camera {camera_id}: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(open_err("device doesn't support video capture".into()));
        }

        let mut this = Self {
            camera_id,
            device,
            stream: None,
            config: config.clone(),
            stride: 0,
        };
        this.configure(config)?;
        Ok(this)
    }

    fn configure(&mut self, config: &CameraConfig) -> Result<(), DeviceError> {
        let camera_id = self.camera_id;
        let cfg_err = |reason: String| DeviceError::ConfigureFailed { camera_id, reason };

        // buffers must be released before the format can change
        self.stream = None;

        let mut fmt = self.device.format().map_err(|e| cfg_err(e.to_string()))?;
        fmt.width = config.resolution.width;
        fmt.height = config.resolution.height;
        fmt.fourcc = FourCC::new(&config.capture_fourcc.bytes());
        let actual = self
            .device
            .set_format(&fmt)
            .map_err(|e| cfg_err(e.to_string()))?;
        if actual.width != fmt.width || actual.height != fmt.height {
            warn!(
                "Camera {camera_id}: requested {}x{}, driver chose {}x{}",
                fmt.width, fmt.height, actual.width, actual.height
            );
        }

        let fps = config.framerate.round().max(1.0) as u32;
        if let Err(e) = self.device.set_params(&Parameters::with_fps(fps)) {
            warn!("Camera {camera_id}: failed to set {fps} fps: {e}");
        }

        let exposure = Control {
            id: CID_EXPOSURE_ABSOLUTE,
            value: Value::Integer(i64::from(config.exposure)),
        };
        if let Err(e) = self.device.set_control(exposure) {
            debug!("Camera {camera_id}: exposure not applied: {e}");
        }

        let stream = MmapStream::with_buffers(&self.device, Type::VideoCapture, BUFFER_COUNT)
            .map_err(|e| cfg_err(e.to_string()))?;
        self.stream = Some(stream);

        let mut applied = config.clone();
        applied.resolution.width = actual.width;
        applied.resolution.height = actual.height;
        self.config = applied;
        self.stride = actual.stride as usize;
        info!(
            "Camera {camera_id}: streaming {} {}x{} with {BUFFER_COUNT} buffers",
            config.capture_fourcc, actual.width, actual.height
        );
        Ok(())
    }
}

impl CaptureDevice for V4l2Device {
    fn read(&mut self) -> Result<Option<RawImage>, DeviceError> {
        let camera_id = self.camera_id;
        let stream = self.stream.as_mut().ok_or_else(|| DeviceError::ReadFailed {
            camera_id,
            reason: "stream not started".into(),
        })?;

        let (buf, meta) = stream.next().map_err(|e| DeviceError::ReadFailed {
            camera_id,
            reason: e.to_string(),
        })?;
        let used = (meta.bytesused as usize).min(buf.len());
        if used == 0 {
            return Ok(None);
        }
        let data = &buf[..used];

        let width = self.config.resolution.width;
        let height = self.config.resolution.height;
        let channels = self.config.color_channels;
        let image = match self.config.capture_fourcc {
            FourCc::MJPG | FourCc::JPEG => Ok(RawImage::from_compressed(
                width,
                height,
                channels,
                Compression::Jpeg,
                Bytes::copy_from_slice(data),
            )),
            FourCc::YUYV => decoder::yuyv_to_pixels(width, height, self.stride, channels, data),
            _ => RawImage::from_pixels(
                width,
                height,
                channels,
                PixelType::U8,
                Bytes::copy_from_slice(data),
            ),
        };
        image.map(Some).map_err(|e| DeviceError::ReadFailed {
            camera_id,
            reason: e.to_string(),
        })
    }

    fn apply_config(&mut self, config: &CameraConfig) -> Result<(), DeviceError> {
        self.configure(config)
    }

    fn release(&mut self) {
        self.stream = None;
    }
}
