pub mod config;
pub mod decoder;
pub mod device;
pub mod frame;
#[cfg(feature = "v4l2")]
pub mod v4l2;
pub mod worker;

pub use config::{CameraConfig, CameraConfigs, CameraId, FourCc, Resolution, Rotation};
pub use device::{open_device, CaptureDevice, DeviceBackend, SyntheticOptions};
pub use frame::{Compression, FramePayload, ImageData, PixelType, RawImage, SlotRef};
pub use worker::{CaptureWorker, WorkerHandle, WorkerState};
