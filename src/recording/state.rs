//! Recorder state shared between the orchestrator, the router and the
//! writer thread. Every field is a single atomic word.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle = 0,
    Running = 1,
    /// Opening output files for a new session
    Preparing = 2,
    Recording = 3,
    /// Draining queued records up to the stop sentinel
    Finishing = 4,
    Closed = 5,
    /// A write failed; queued records are dropped until the next session
    Error = 6,
}

impl RecorderState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => RecorderState::Running,
            2 => RecorderState::Preparing,
            3 => RecorderState::Recording,
            4 => RecorderState::Finishing,
            5 => RecorderState::Closed,
            6 => RecorderState::Error,
            _ => RecorderState::Idle,
        }
    }
}

/// Boolean view of the recorder state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecorderFlags {
    pub should_record: bool,
    pub is_recording: bool,
    pub is_running: bool,
    pub finishing: bool,
    pub updating: bool,
    pub closed: bool,
    pub error: bool,
    pub recording: bool,
}

#[derive(Debug)]
pub struct RecorderStatus {
    /// The owner sets `Running` before the first message and `Closed` after
    /// joining; every transition in between is made by the writer thread
    state: AtomicU8,
    /// Written by the orchestrator only
    should_record: AtomicBool,
    last_error: ArcSwapOption<String>,
}

impl Default for RecorderStatus {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(RecorderState::Idle as u8),
            should_record: AtomicBool::new(false),
            last_error: ArcSwapOption::empty(),
        }
    }
}

impl RecorderStatus {
    pub fn state(&self) -> RecorderState {
        RecorderState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: RecorderState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move `from -> to` only if nobody changed the state in between
    pub fn transition(&self, from: RecorderState, to: RecorderState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn should_record(&self) -> bool {
        self.should_record.load(Ordering::SeqCst)
    }

    pub fn request_recording(&self, active: bool) {
        self.should_record.store(active, Ordering::SeqCst);
    }

    pub fn fail(&self, reason: impl Into<String>) {
        self.last_error.store(Some(Arc::new(reason.into())));
        self.set_state(RecorderState::Error);
    }

    pub fn last_error(&self) -> Option<Arc<String>> {
        self.last_error.load_full()
    }

    pub fn flags(&self) -> RecorderFlags {
        let state = self.state();
        let should_record = self.should_record();
        let is_recording = matches!(state, RecorderState::Recording | RecorderState::Finishing);
        RecorderFlags {
            should_record,
            is_recording,
            is_running: !matches!(state, RecorderState::Idle | RecorderState::Closed),
            finishing: state == RecorderState::Finishing,
            updating: state == RecorderState::Preparing,
            closed: state == RecorderState::Closed,
            error: state == RecorderState::Error,
            recording: is_recording && should_record,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_follow_state() {
        let status = RecorderStatus::default();
        assert!(!status.flags().is_running);

        status.set_state(RecorderState::Running);
        status.request_recording(true);
        let flags = status.flags();
        assert!(flags.is_running && flags.should_record && !flags.recording);

        status.set_state(RecorderState::Recording);
        assert!(status.flags().recording);

        assert!(status.transition(RecorderState::Recording, RecorderState::Finishing));
        assert!(!status.transition(RecorderState::Recording, RecorderState::Finishing));
        let flags = status.flags();
        assert!(flags.finishing && flags.is_recording);
    }

    #[test]
    fn failure_keeps_reason() {
        let status = RecorderStatus::default();
        status.fail("disk full");
        assert!(status.flags().error);
        assert_eq!(status.last_error().as_deref().map(String::as_str), Some("disk full"));
    }
}
