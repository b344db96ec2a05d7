//! Length-prefixed framing for byte streams (worker-host pipes).
//!
//! Each frame is a 2-byte magic (`"PF"`) followed by a 4-byte little-endian
//! payload length and the payload.

use std::io::{self, Read, Write};

use bytes::Bytes;

use crate::error::{CodecError, TransportError};

const FRAME_MAGIC: [u8; 2] = *b"PF";
pub const HEADER_SIZE: usize = 6;
/// Frame metadata only; image bytes travel through the shared buffer
pub const MAX_MESSAGE: usize = 64 * 1024 * 1024;

pub fn write_message<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), TransportError> {
    if payload.len() > MAX_MESSAGE {
        return Err(TransportError::MessageTooLarge {
            len: payload.len(),
            max: MAX_MESSAGE,
        });
    }
    let mut header = [0u8; HEADER_SIZE];
    header[..2].copy_from_slice(&FRAME_MAGIC);
    header[2..].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    writer.write_all(&header)?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Blocking read of one frame. `Ok(None)` on a clean EOF between frames.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Option<Bytes>, TransportError> {
    let mut header = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    if header[..2] != FRAME_MAGIC {
        return Err(CodecError::Invalid(format!("frame magic {:02x?}", &header[..2])).into());
    }
    let len = u32::from_le_bytes([header[2], header[3], header[4], header[5]]) as usize;
    if len > MAX_MESSAGE {
        return Err(TransportError::MessageTooLarge {
            len,
            max: MAX_MESSAGE,
        });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(Bytes::from(payload)))
}
