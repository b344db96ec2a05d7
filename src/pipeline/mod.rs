//! Supervising-side pipeline: payload assembly, synchronization and routing.

pub mod frame_loop;
pub mod payload;
pub mod ringbuf;
pub mod router;
pub mod synchronizer;

pub use frame_loop::{FrameLoop, LoopSnapshot};
pub use payload::{LifecycleEvent, LifecycleTag, MultiFramePayload, TimeBase};
pub use router::{FrameRouter, LoggingSink, RelayReceiver, RelaySink};
pub use synchronizer::FrameSynchronizer;
