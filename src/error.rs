//! Error taxonomy for the capture pipeline

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::capture::config::CameraId;

/// Device open/read failures. Fatal to one worker, never to its siblings.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("camera {camera_id}: failed to open device: {reason}")]
    FailedToOpenDevice { camera_id: CameraId, reason: String },

    #[error("camera {camera_id}: failed to read initial frame: {reason}")]
    FailedToReadInitialFrame { camera_id: CameraId, reason: String },

    #[error("camera {camera_id}: read failed: {reason}")]
    ReadFailed { camera_id: CameraId, reason: String },

    #[error("camera {camera_id}: failed to apply config: {reason}")]
    ConfigureFailed { camera_id: CameraId, reason: String },
}

impl DeviceError {
    pub fn camera_id(&self) -> CameraId {
        match self {
            DeviceError::FailedToOpenDevice { camera_id, .. }
            | DeviceError::FailedToReadInitialFrame { camera_id, .. }
            | DeviceError::ReadFailed { camera_id, .. }
            | DeviceError::ConfigureFailed { camera_id, .. } => *camera_id,
        }
    }
}

/// Wire decoding failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of message")]
    UnexpectedEof,

    #[error("bad magic {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown {what} tag 0x{tag:02x}")]
    UnknownTag { what: &'static str, tag: u8 },

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    #[error("invalid field: {0}")]
    Invalid(String),
}

/// Pipe/queue failures between processes or threads
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{0} channel disconnected")]
    Disconnected(&'static str),

    #[error("message of {len} bytes exceeds limit of {max}")]
    MessageTooLarge { len: usize, max: usize },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Shared image buffer failures
#[derive(Debug, Error)]
pub enum BufferError {
    /// Capacity: no free slot, the frame is dropped
    #[error("shared buffer exhausted ({slots} slots in use)")]
    BufferExhausted { slots: u32 },

    /// Capacity: image larger than the slot it would occupy
    #[error("image of {len} bytes does not fit slot of {slot_size} bytes")]
    ImageTooLarge { len: usize, slot_size: usize },

    /// Integrity: checksum mismatch after read-back
    #[error("corrupted shared image in slot {slot}: expected checksum {expected}, got {actual}")]
    CorruptedSharedImage {
        slot: u32,
        expected: u64,
        actual: u64,
    },

    #[error("slot {slot} out of range ({slots} slots)")]
    SlotOutOfRange { slot: u32, slots: u32 },

    #[error("invalid shared buffer layout: {0}")]
    InvalidLayout(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl BufferError {
    /// Capacity errors drop one frame and are otherwise harmless
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            BufferError::BufferExhausted { .. } | BufferError::ImageTooLarge { .. }
        )
    }
}

/// Image conversion failures
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("pixel buffer of {actual} bytes, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("image bytes are not hydrated (still in shared slot {0})")]
    NotHydrated(u32),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("unsupported image: {0}")]
    Unsupported(String),
}

/// Invalid camera configuration, rejected before touching running state
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no enabled cameras in config")]
    NoCameras,

    #[error("camera config keyed as {key} carries camera id {camera_id}")]
    KeyMismatch { key: CameraId, camera_id: CameraId },

    #[error("camera {0} is not part of the running group")]
    UnknownCamera(CameraId),

    #[error("camera {camera_id}: invalid framerate {framerate}")]
    InvalidFramerate { camera_id: CameraId, framerate: f64 },

    #[error("camera {camera_id}: invalid resolution {width}x{height}")]
    InvalidResolution {
        camera_id: CameraId,
        width: u32,
        height: u32,
    },

    #[error("camera {camera_id}: unsupported channel count {channels}")]
    InvalidChannels { camera_id: CameraId, channels: u8 },

    #[error("invalid fourcc {0:?}")]
    InvalidFourcc(String),

    #[error("camera {camera_id}: cannot capture {fourcc} into {channels} channels")]
    UnsupportedCaptureFourcc {
        camera_id: CameraId,
        fourcc: String,
        channels: u8,
    },

    #[error("camera {camera_id}: image of {needed} bytes exceeds shared slot size {slot_size}")]
    ExceedsSlotSize {
        camera_id: CameraId,
        needed: usize,
        slot_size: usize,
    },

    #[error(transparent)]
    Load(#[from] config::ConfigError),
}

/// Recording failures. Write failures halt the session and set the error state.
#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("already recording")]
    AlreadyRecording,

    #[error("not recording")]
    NotRecording,

    #[error("recording halted: {0}")]
    Halted(String),

    #[error("recording writer is not running")]
    WriterUnavailable,

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Top-level error for supervisor and controller operations
#[derive(Debug, Error)]
pub enum Error {
    #[error("camera group failed to start: {}", describe_failures(.failed))]
    GroupStartFailed { failed: Vec<(CameraId, String)> },

    #[error("camera group is not connected")]
    NotConnected,

    #[error("failed to spawn worker host: {0}")]
    Spawn(#[source] io::Error),

    #[error("background task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Recording(#[from] RecordingError),
}

fn describe_failures(failed: &[(CameraId, String)]) -> String {
    failed
        .iter()
        .map(|(camera_id, reason)| format!("camera {camera_id}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
