//! Messages exchanged between the supervisor and its worker hosts

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::capture::config::{CameraConfig, CameraId};
use crate::capture::device::{DeviceBackend, SyntheticOptions};
use crate::capture::frame::FramePayload;
use crate::error::DeviceError;

/// Supervisor → worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerCommand {
    /// Routed to the worker owning `camera_id`, applied between reads
    UpdateConfig(CameraConfig),
    /// Stop sentinel
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    OpenDevice,
    InitialFrame,
    Configure,
    Transport,
}

impl From<&DeviceError> for FailureKind {
    fn from(err: &DeviceError) -> Self {
        match err {
            DeviceError::FailedToOpenDevice { .. } => FailureKind::OpenDevice,
            DeviceError::FailedToReadInitialFrame { .. } => FailureKind::InitialFrame,
            DeviceError::ConfigureFailed { .. } => FailureKind::Configure,
            DeviceError::ReadFailed { .. } => FailureKind::Transport,
        }
    }
}

/// Worker → supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerEvent {
    /// Device opened and the first read succeeded
    Ready {
        camera_id: CameraId,
        width: u32,
        height: u32,
    },
    Frame(FramePayload),
    Failed {
        camera_id: CameraId,
        kind: FailureKind,
        reason: String,
    },
    Closed {
        camera_id: CameraId,
    },
}

impl WorkerEvent {
    pub fn camera_id(&self) -> CameraId {
        match self {
            WorkerEvent::Ready { camera_id, .. }
            | WorkerEvent::Failed { camera_id, .. }
            | WorkerEvent::Closed { camera_id } => *camera_id,
            WorkerEvent::Frame(frame) => frame.camera_id,
        }
    }
}

/// First message a worker-host child process reads from stdin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInit {
    pub shm_path: PathBuf,
    #[serde(with = "backend_wire")]
    pub backend: DeviceBackend,
    pub pin_workers: bool,
    pub configs: Vec<CameraConfig>,
}

/// `DeviceBackend` is internally tagged for config files, which the binary
/// wire format cannot read back; it travels externally tagged instead.
mod backend_wire {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::{DeviceBackend, SyntheticOptions};

    #[derive(Serialize, Deserialize)]
    enum Wire {
        Synthetic(SyntheticOptions),
        V4l2,
    }

    pub fn serialize<S: Serializer>(backend: &DeviceBackend, serializer: S) -> Result<S::Ok, S::Error> {
        match backend {
            DeviceBackend::Synthetic(options) => Wire::Synthetic(options.clone()),
            DeviceBackend::V4l2 => Wire::V4l2,
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DeviceBackend, D::Error> {
        Ok(match Wire::deserialize(deserializer)? {
            Wire::Synthetic(options) => DeviceBackend::Synthetic(options),
            Wire::V4l2 => DeviceBackend::V4l2,
        })
    }
}
