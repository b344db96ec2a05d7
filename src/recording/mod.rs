//! Recording: recorder state, the writer thread and its output files.

pub mod manager;
pub mod state;
pub mod writer;

pub use manager::{RecorderMessage, RecordingManager};
pub use state::{RecorderFlags, RecorderState, RecorderStatus};
pub use writer::{RecordingSession, RecordingSummary};
