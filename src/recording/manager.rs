//! Recording manager: owns the writer thread and its queue.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use flume::{Receiver, Sender};
use tracing::{debug, error, info, instrument, warn};

use super::state::{RecorderFlags, RecorderState, RecorderStatus};
use super::writer::RecordingSession;
use crate::capture::config::CameraConfigs;
use crate::error::{Error, RecordingError};
use crate::ipc::codec::unpack;
use crate::pipeline::payload::MultiFramePayload;
use crate::RecordingSettings;

/// Writer queue entries, consumed in order
#[derive(Debug)]
pub enum RecorderMessage {
    Start {
        folder: PathBuf,
        configs: CameraConfigs,
    },
    /// One packed `MultiFramePayload`
    Frames(Bytes),
    /// End of the current session
    Stop,
    /// End of the writer thread
    Shutdown,
}

pub struct RecordingManager {
    queue: Sender<RecorderMessage>,
    status: Arc<RecorderStatus>,
    writer: Option<JoinHandle<()>>,
}

impl RecordingManager {
    pub fn spawn(settings: &RecordingSettings) -> Result<Self, Error> {
        let (queue, rx) = flume::unbounded();
        let status = Arc::new(RecorderStatus::default());
        let writer = {
            let status = status.clone();
            let quality = settings.jpeg_quality;
            thread::Builder::new()
                .name("recorder".into())
                .spawn(move || writer_loop(rx, status, quality))
                .map_err(Error::Spawn)?
        };
        status.set_state(RecorderState::Running);
        Ok(Self {
            queue,
            status,
            writer: Some(writer),
        })
    }

    /// Queue handle for the frame router
    pub fn queue(&self) -> Sender<RecorderMessage> {
        self.queue.clone()
    }

    pub fn status(&self) -> Arc<RecorderStatus> {
        self.status.clone()
    }

    pub fn flags(&self) -> RecorderFlags {
        self.status.flags()
    }

    #[instrument(skip(self, configs))]
    pub fn start_recording(
        &self,
        folder: &Path,
        configs: &CameraConfigs,
    ) -> Result<(), RecordingError> {
        if self.writer.is_none() || self.status.state() == RecorderState::Closed {
            return Err(RecordingError::WriterUnavailable);
        }
        if self.status.should_record() {
            return Err(RecordingError::AlreadyRecording);
        }
        // Start must be queued ahead of the first record
        self.queue
            .send(RecorderMessage::Start {
                folder: folder.to_path_buf(),
                configs: configs.clone(),
            })
            .map_err(|_| RecordingError::WriterUnavailable)?;
        self.status.request_recording(true);
        info!("Recording requested");
        Ok(())
    }

    /// Withdraw the recording request. The writer moves to `Finishing` when
    /// the stop sentinel the router queues reaches it.
    pub fn stop_recording(&self) -> Result<(), RecordingError> {
        if !self.status.should_record() {
            return Err(RecordingError::NotRecording);
        }
        self.status.request_recording(false);
        info!("Recording stop requested");
        match self.status.state() {
            RecorderState::Error => Err(self.halted()),
            _ => Ok(()),
        }
    }

    fn halted(&self) -> RecordingError {
        RecordingError::Halted(
            self.status
                .last_error()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown write failure".into()),
        )
    }

    /// Poll until the writer has no session in flight
    pub fn wait_idle(&self, timeout: Duration) -> Result<(), RecordingError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.status.state() {
                RecorderState::Error => return Err(self.halted()),
                RecorderState::Running | RecorderState::Closed
                    if !self.status.should_record() && self.queue.is_empty() =>
                {
                    return Ok(())
                }
                _ if Instant::now() >= deadline => {
                    return Err(RecordingError::Halted("timed out waiting for writer".into()))
                }
                _ => thread::sleep(Duration::from_millis(5)),
            }
        }
    }

    /// Finish any session and join the writer thread
    pub fn close(&mut self) {
        let Some(writer) = self.writer.take() else {
            return;
        };
        self.status.request_recording(false);
        let _ = self.queue.send(RecorderMessage::Shutdown);
        if writer.join().is_err() {
            error!("Recorder thread panicked");
        }
        self.status.set_state(RecorderState::Closed);
    }
}

impl Drop for RecordingManager {
    fn drop(&mut self) {
        self.close();
    }
}

fn writer_loop(rx: Receiver<RecorderMessage>, status: Arc<RecorderStatus>, quality: u8) {
    let mut session: Option<RecordingSession> = None;

    for message in rx.iter() {
        match message {
            RecorderMessage::Start { folder, configs } => {
                if let Some(previous) = session.take() {
                    warn!("New recording started before the previous one stopped");
                    finish(previous, &status);
                }
                status.set_state(RecorderState::Preparing);
                match RecordingSession::create(&folder, &configs, quality) {
                    Ok(opened) => {
                        info!("Recording to {}", folder.display());
                        session = Some(opened);
                        status.set_state(RecorderState::Recording);
                    }
                    Err(e) => {
                        error!("Failed to start recording: {e}");
                        status.fail(e.to_string());
                    }
                }
            }
            RecorderMessage::Frames(bytes) => {
                let Some(active) = session.as_mut() else {
                    metrics::counter!("polycam_records_dropped").increment(1);
                    debug!("Record outside a session dropped");
                    continue;
                };
                let written = unpack::<MultiFramePayload>(bytes)
                    .map_err(RecordingError::from)
                    .and_then(|payload| active.write(&payload));
                if let Err(e) = written {
                    error!("Recording halted: {e}");
                    session = None;
                    status.fail(e.to_string());
                }
            }
            RecorderMessage::Stop => {
                if let Some(active) = session.take() {
                    status.transition(RecorderState::Recording, RecorderState::Finishing);
                    finish(active, &status);
                }
            }
            RecorderMessage::Shutdown => break,
        }
    }

    if let Some(active) = session.take() {
        finish(active, &status);
    }
    debug!("Recorder thread exiting");
}

fn finish(session: RecordingSession, status: &RecorderStatus) {
    match session.finish() {
        Ok(summary) => {
            info!(
                "Recording finished: {} records in {}",
                summary.records,
                summary.folder.display()
            );
            status.set_state(RecorderState::Running);
        }
        Err(e) => {
            error!("Failed to finalize recording: {e}");
            status.fail(e.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::capture::config::CameraConfig;
    use crate::ipc::codec::pack;
    use crate::pipeline::payload::tests::frame;
    use crate::recording::writer::TIMESTAMPS_FILE;

    fn packed(sequence: u64) -> Bytes {
        let mut payload = MultiFramePayload::create([0], sequence);
        payload.add_frame(frame(0, sequence, sequence), None, sequence).unwrap();
        pack(&payload).unwrap()
    }

    #[test]
    fn session_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let configs: CameraConfigs = [(0, CameraConfig::new(0))].into();
        let mut manager = RecordingManager::spawn(&RecordingSettings::default()).unwrap();
        assert!(manager.flags().is_running);

        manager.start_recording(dir.path(), &configs).unwrap();
        assert!(matches!(
            manager.start_recording(dir.path(), &configs),
            Err(RecordingError::AlreadyRecording)
        ));
        for seq in 0..10 {
            manager.queue().send(RecorderMessage::Frames(packed(seq))).unwrap();
        }
        manager.stop_recording().unwrap();
        manager.queue().send(RecorderMessage::Stop).unwrap();
        manager.wait_idle(Duration::from_secs(5)).unwrap();

        let flags = manager.flags();
        assert!(!flags.is_recording && flags.is_running && !flags.error);
        let csv = fs::read_to_string(dir.path().join(TIMESTAMPS_FILE)).unwrap();
        assert_eq!(csv.lines().count(), 11);

        manager.close();
        assert!(manager.flags().closed);
        assert!(matches!(
            manager.start_recording(dir.path(), &configs),
            Err(RecordingError::WriterUnavailable)
        ));
    }

    #[test]
    fn write_failure_sets_error_and_drops_records() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let configs: CameraConfigs = [(0, CameraConfig::new(0))].into();
        let manager = RecordingManager::spawn(&RecordingSettings::default()).unwrap();

        manager.start_recording(&blocker.join("out"), &configs).unwrap();
        manager.queue().send(RecorderMessage::Frames(packed(0))).unwrap();
        assert!(manager.wait_idle(Duration::from_secs(5)).is_err());
        assert!(manager.flags().error);
        assert!(matches!(manager.stop_recording(), Err(RecordingError::Halted(_))));
    }

    #[test]
    fn only_the_stop_sentinel_ends_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let configs: CameraConfigs = [(0, CameraConfig::new(0))].into();
        let manager = RecordingManager::spawn(&RecordingSettings::default()).unwrap();
        manager.start_recording(dir.path(), &configs).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !manager.flags().is_recording && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        manager.stop_recording().unwrap();
        let flags = manager.flags();
        assert!(!flags.should_record);
        assert!(flags.is_recording && !flags.finishing);

        manager.queue().send(RecorderMessage::Stop).unwrap();
        manager.wait_idle(Duration::from_secs(5)).unwrap();
        assert!(!manager.flags().is_recording);
    }

    #[test]
    fn stop_without_start_is_rejected() {
        let manager = RecordingManager::spawn(&RecordingSettings::default()).unwrap();
        assert!(matches!(manager.stop_recording(), Err(RecordingError::NotRecording)));
    }
}
