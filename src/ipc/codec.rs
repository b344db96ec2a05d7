//! Binary encoding for everything that crosses a thread or process boundary.
//!
//! A packed message is `b"PCAM"`, a version byte and a type marker, followed
//! by the bincode body (fixed-width little-endian integers).

use std::io;

use bincode::Options;
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;
use crate::ipc::messages::{HostInit, WorkerCommand, WorkerEvent};
use crate::pipeline::payload::MultiFramePayload;

pub const MAGIC: [u8; 4] = *b"PCAM";
pub const VERSION: u8 = 1;
const HEADER_LEN: usize = MAGIC.len() + 2;

/// A top-level message type
pub trait Message: Serialize + DeserializeOwned {
    /// Type marker written after the header by [`pack`]
    const MARKER: u8;
}

impl Message for MultiFramePayload {
    const MARKER: u8 = 0x04;
}

impl Message for WorkerCommand {
    const MARKER: u8 = 0x10;
}

impl Message for WorkerEvent {
    const MARKER: u8 = 0x20;
}

impl Message for HostInit {
    const MARKER: u8 = 0x30;
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .allow_trailing_bytes()
}

fn codec_error(err: bincode::Error) -> CodecError {
    match err.as_ref() {
        bincode::ErrorKind::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            CodecError::UnexpectedEof
        }
        _ => CodecError::Invalid(err.to_string()),
    }
}

/// Serialize with header and type marker
pub fn pack<T: Message>(value: &T) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_slice(&MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(T::MARKER);
    let mut writer = buf.writer();
    options()
        .serialize_into(&mut writer, value)
        .map_err(codec_error)?;
    Ok(writer.into_inner().freeze())
}

/// Inverse of [`pack`]. Rejects trailing bytes.
pub fn unpack<T: Message>(bytes: Bytes) -> Result<T, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::UnexpectedEof);
    }
    let (header, mut body) = bytes.split_at(HEADER_LEN);
    let mut magic = [0u8; 4];
    magic.copy_from_slice(&header[..4]);
    if magic != MAGIC {
        return Err(CodecError::BadMagic(magic));
    }
    if header[4] != VERSION {
        return Err(CodecError::UnsupportedVersion(header[4]));
    }
    if header[5] != T::MARKER {
        return Err(CodecError::UnknownTag {
            what: "message",
            tag: header[5],
        });
    }
    let value = options()
        .deserialize_from(&mut body)
        .map_err(codec_error)?;
    if !body.is_empty() {
        return Err(CodecError::TrailingBytes(body.len()));
    }
    Ok(value)
}
