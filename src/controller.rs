//! Top-level orchestrator owned by whichever layer drives the cameras.
//!
//! Group lifecycle calls (`connect`, `close`, `detect`) block on worker
//! start-up and shutdown, so they run on tokio's blocking pool and never
//! stall the frame loop or the caller's runtime.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::capture::config::{validate_configs, CameraConfigs, CameraId};
use crate::error::{Error, Result};
use crate::pipeline::{FrameLoop, FrameRouter, LoopSnapshot, RelayReceiver};
use crate::recording::{RecorderFlags, RecordingManager};
use crate::supervisor::{CaptureSupervisor, StopReport};
use crate::utils::{self, DetectedDevice};
use crate::Config;

/// A running camera group and everything attached to it
struct ActiveGroup {
    supervisor: CaptureSupervisor,
    frame_loop: FrameLoop,
    recorder: RecordingManager,
}

impl ActiveGroup {
    fn start(config: &Config, configs: &CameraConfigs) -> Result<Self> {
        let mut supervisor = CaptureSupervisor::new(config.capture.clone(), configs)?;
        supervisor.start_capture()?;
        let buffer = supervisor.buffer().ok_or(Error::NotConnected)?;

        let recorder = RecordingManager::spawn(&config.recording)?;
        let router = FrameRouter::new().with_recorder(recorder.queue(), recorder.status());
        let frame_loop = FrameLoop::spawn(
            &config.pipeline,
            supervisor.configs(),
            supervisor.event_receivers(),
            buffer,
            router,
        )?;
        Ok(Self {
            supervisor,
            frame_loop,
            recorder,
        })
    }

    fn camera_ids(&self) -> BTreeSet<CameraId> {
        self.supervisor.camera_ids().into_iter().collect()
    }

    fn update_configs(&mut self, configs: &CameraConfigs) -> Result<()> {
        self.supervisor.update_configs(configs)?;
        self.frame_loop.update_configs(self.supervisor.configs())
    }

    /// Workers first, so their channels close before the loop drains them;
    /// the recorder last, so it sees the loop's final stop sentinel.
    fn shutdown(mut self) -> StopReport {
        if self.recorder.stop_recording().is_ok() {
            info!("Recording stopped by close");
        }
        let report = self.supervisor.stop_capture();
        let stats = self.frame_loop.stop();
        self.recorder.close();
        info!(
            "Group closed after {} payloads ({} backfilled slots)",
            stats.payloads_emitted, stats.backfilled_slots
        );
        report
    }
}

pub struct CameraGroupController {
    config: Config,
    active: Option<ActiveGroup>,
}

impl CameraGroupController {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            active: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.active.is_some()
    }

    /// Cameras of the running group
    pub fn camera_ids(&self) -> Vec<CameraId> {
        self.active
            .as_ref()
            .map(|group| group.camera_ids().into_iter().collect())
            .unwrap_or_default()
    }

    pub async fn detect(&self) -> Result<Vec<DetectedDevice>> {
        let backend = self.config.capture.backend.clone();
        tokio::task::spawn_blocking(move || utils::detect_devices(&backend))
            .await
            .map_err(|e| Error::Task(e.to_string()))?
            .map_err(Error::from)
    }

    /// Start a group. An already running group is closed first.
    #[instrument(skip(self, configs), fields(cameras = configs.len()))]
    pub async fn connect(&mut self, configs: CameraConfigs) -> Result<Vec<CameraId>> {
        validate_configs(&configs)?;
        if self.active.is_some() {
            self.close().await?;
        }
        let config = self.config.clone();
        let group = tokio::task::spawn_blocking(move || ActiveGroup::start(&config, &configs))
            .await
            .map_err(|e| Error::Task(e.to_string()))??;
        let ids = group.camera_ids().into_iter().collect::<Vec<_>>();
        info!("Connected cameras {ids:?}");
        self.active = Some(group);
        Ok(ids)
    }

    /// Apply new camera configs. A different set of enabled cameras means a
    /// full reconnect; otherwise only the changed workers are updated.
    pub async fn update_configs(&mut self, configs: CameraConfigs) -> Result<()> {
        let validated = validate_configs(&configs)?;
        let group = self.active.as_mut().ok_or(Error::NotConnected)?;
        let requested = validated.keys().copied().collect::<BTreeSet<_>>();
        if requested != group.camera_ids() {
            info!("Camera set changed, reconnecting");
            self.connect(configs).await?;
            return Ok(());
        }
        group.update_configs(&validated)
    }

    /// Stop the group and everything attached to it
    pub async fn close(&mut self) -> Result<StopReport> {
        let group = self.active.take().ok_or(Error::NotConnected)?;
        let report = tokio::task::spawn_blocking(move || group.shutdown())
            .await
            .map_err(|e| Error::Task(e.to_string()))?;
        if !report.is_clean() {
            warn!("Cameras {:?} had to be terminated", report.forced);
        }
        Ok(report)
    }

    pub fn start_recording(&self, folder: impl AsRef<Path>) -> Result<()> {
        let group = self.active.as_ref().ok_or(Error::NotConnected)?;
        group
            .recorder
            .start_recording(folder.as_ref(), group.supervisor.configs())?;
        Ok(())
    }

    pub fn stop_recording(&self) -> Result<()> {
        let group = self.active.as_ref().ok_or(Error::NotConnected)?;
        group.recorder.stop_recording()?;
        Ok(())
    }

    /// Block until the recorder has written everything queued so far
    pub fn wait_recording_idle(&self, timeout: Duration) -> Result<()> {
        let group = self.active.as_ref().ok_or(Error::NotConnected)?;
        group.recorder.wait_idle(timeout)?;
        Ok(())
    }

    pub fn attach_relay(&self) -> Result<RelayReceiver> {
        let group = self.active.as_ref().ok_or(Error::NotConnected)?;
        group.frame_loop.attach_relay()
    }

    pub fn stats(&self) -> Option<LoopSnapshot> {
        self.active.as_ref().map(|group| group.frame_loop.stats())
    }

    pub fn recorder_flags(&self) -> Option<RecorderFlags> {
        self.active.as_ref().map(|group| group.recorder.flags())
    }

    pub fn live_workers(&mut self) -> usize {
        self.active
            .as_mut()
            .map(|group| group.supervisor.live_workers())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::config::CameraConfig;
    use crate::error::ConfigError;

    fn configs(ids: impl IntoIterator<Item = CameraId>) -> CameraConfigs {
        ids.into_iter()
            .map(|id| (id, CameraConfig::new(id).with_resolution(64, 48)))
            .collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn connect_update_close() {
        let mut controller = CameraGroupController::new(Config::default());
        assert!(matches!(
            controller.update_configs(configs([0])).await,
            Err(Error::NotConnected)
        ));

        let ids = controller.connect(configs([0, 1])).await.unwrap();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(controller.live_workers(), 2);

        let slower = configs([0, 1])
            .into_iter()
            .map(|(id, c)| (id, c.with_framerate(10.0)))
            .collect();
        controller.update_configs(slower).await.unwrap();

        controller.update_configs(configs([0])).await.unwrap();
        assert_eq!(controller.camera_ids(), vec![0]);

        assert!(matches!(
            controller.update_configs(CameraConfigs::new()).await,
            Err(Error::Config(ConfigError::NoCameras))
        ));

        let report = controller.close().await.unwrap();
        assert!(report.is_clean());
        assert!(!controller.is_connected());
        assert_eq!(controller.live_workers(), 0);
    }

    #[tokio::test]
    async fn detect_lists_synthetic_devices() {
        let controller = CameraGroupController::new(Config::default());
        let devices = controller.detect().await.unwrap();
        assert_eq!(devices.len(), 2);
    }

    #[tokio::test]
    async fn recording_requires_a_group() {
        let controller = CameraGroupController::new(Config::default());
        assert!(matches!(controller.start_recording("/tmp"), Err(Error::NotConnected)));
        assert!(controller.stats().is_none());
    }
}
