pub mod codec;
pub mod framing;
pub mod messages;
pub mod shared_buffer;

pub use codec::{pack, unpack, Message};
pub use messages::{FailureKind, HostInit, WorkerCommand, WorkerEvent};
pub use shared_buffer::SharedImageBuffer;
