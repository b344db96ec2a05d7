//! Capture process supervisor: owns worker hosts for one camera group.

pub mod host;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use flume::{Receiver, TryRecvError};
use tracing::{error, info, instrument, warn};

use crate::capture::config::{validate_configs, CameraConfigs, CameraId};
use crate::error::{ConfigError, Error, Result};
use crate::ipc::messages::{HostInit, WorkerCommand, WorkerEvent};
use crate::ipc::shared_buffer::SharedImageBuffer;
use crate::{CaptureSettings, CaptureStrategy};

pub use host::{run_worker_host, HostStop, ProcessHost, ThreadHost, WorkerHost, WORKER_SUBCOMMAND};

/// Result of [`CaptureSupervisor::stop_capture`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StopReport {
    /// Stopped through the sentinel
    pub clean: Vec<CameraId>,
    /// Terminated after the stop timeout
    pub forced: Vec<CameraId>,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.forced.is_empty()
    }
}

pub struct CaptureSupervisor {
    settings: CaptureSettings,
    configs: CameraConfigs,
    buffer: Option<Arc<SharedImageBuffer>>,
    hosts: Vec<WorkerHost>,
    receivers: BTreeMap<CameraId, Receiver<WorkerEvent>>,
}

impl CaptureSupervisor {
    /// Validates the group; disabled cameras are dropped here
    pub fn new(settings: CaptureSettings, configs: &CameraConfigs) -> Result<Self, ConfigError> {
        let configs = validate_configs(configs)?;
        Ok(Self {
            settings,
            configs,
            buffer: None,
            hosts: Vec::new(),
            receivers: BTreeMap::new(),
        })
    }

    pub fn configs(&self) -> &CameraConfigs {
        &self.configs
    }

    pub fn camera_ids(&self) -> Vec<CameraId> {
        self.configs.keys().copied().collect()
    }

    pub fn is_running(&self) -> bool {
        !self.hosts.is_empty()
    }

    pub fn buffer(&self) -> Option<Arc<SharedImageBuffer>> {
        self.buffer.clone()
    }

    /// One inbound frame channel per running camera
    pub fn event_receivers(&self) -> BTreeMap<CameraId, Receiver<WorkerEvent>> {
        self.receivers.clone()
    }

    /// Spawn every worker and wait until each reports ready
    #[instrument(skip(self), fields(cameras = self.configs.len()))]
    pub fn start_capture(&mut self) -> Result<()> {
        if self.is_running() {
            warn!("Capture already running");
            return Ok(());
        }

        let slot_size = self
            .configs
            .values()
            .map(|c| c.image_size_bytes())
            .max()
            .ok_or(ConfigError::NoCameras)?;
        let slot_count = self.configs.len() as u32 * self.settings.slots_per_camera.max(1);
        let buffer = Arc::new(match self.settings.strategy {
            CaptureStrategy::Thread => SharedImageBuffer::create_anonymous(slot_count, slot_size)?,
            CaptureStrategy::Process { .. } => {
                SharedImageBuffer::create_in_shm(slot_count, slot_size)?
            }
        });

        let mut senders = BTreeMap::new();
        let mut receivers = BTreeMap::new();
        for camera_id in self.configs.keys() {
            let (tx, rx) = flume::unbounded();
            senders.insert(*camera_id, tx);
            receivers.insert(*camera_id, rx);
        }

        let configs = self.configs.values().cloned().collect::<Vec<_>>();
        let per_host = self.settings.cameras_per_process.max(1);
        let mut hosts = Vec::new();
        for chunk in configs.chunks(per_host) {
            let host = match &self.settings.strategy {
                CaptureStrategy::Thread => ThreadHost::spawn(
                    chunk,
                    &self.settings.backend,
                    &buffer,
                    &senders,
                    self.settings.pin_workers,
                )
                .map(WorkerHost::Thread),
                CaptureStrategy::Process { executable } => {
                    self.spawn_process_host(executable.as_ref(), chunk, &buffer, &senders)
                }
            };
            match host {
                Ok(host) => hosts.push(host),
                Err(e) => {
                    error!("Failed to start worker host: {e}");
                    shutdown_hosts(&mut hosts, self.stop_timeout());
                    return Err(e);
                }
            }
        }
        // receivers are the only handles the pipeline keeps
        drop(senders);

        let (ready, failed) = await_ready(&receivers, &buffer, self.start_timeout());
        if !failed.is_empty() {
            let partial = self.settings.allow_partial_start && !ready.is_empty();
            if !partial {
                for (camera_id, reason) in &failed {
                    error!("Camera {camera_id}: failed to start: {reason}");
                }
                shutdown_hosts(&mut hosts, self.stop_timeout());
                return Err(Error::GroupStartFailed { failed });
            }
            for (camera_id, reason) in &failed {
                warn!("Camera {camera_id}: excluded from group: {reason}");
                receivers.remove(camera_id);
                self.configs.remove(camera_id);
            }
            for host in &mut hosts {
                let ids = host.camera_ids();
                if ids.iter().all(|id| !ready.contains(id)) {
                    host.request_stop();
                }
            }
        }

        info!(
            "Capture started: cameras {:?}, {} slots of {} bytes",
            ready,
            buffer.slot_count(),
            buffer.slot_size()
        );
        self.buffer = Some(buffer);
        self.hosts = hosts;
        self.receivers = receivers;
        Ok(())
    }

    fn spawn_process_host(
        &self,
        executable: Option<&PathBuf>,
        chunk: &[crate::capture::config::CameraConfig],
        buffer: &Arc<SharedImageBuffer>,
        senders: &BTreeMap<CameraId, flume::Sender<WorkerEvent>>,
    ) -> Result<WorkerHost> {
        let executable = match executable {
            Some(path) => path.clone(),
            None => std::env::current_exe().map_err(Error::Spawn)?,
        };
        let shm_path = buffer
            .path()
            .ok_or_else(|| Error::Task("process workers need a file-backed buffer".into()))?
            .to_path_buf();
        let init = HostInit {
            shm_path,
            backend: self.settings.backend.clone(),
            pin_workers: self.settings.pin_workers,
            configs: chunk.to_vec(),
        };
        ProcessHost::spawn(&executable, init, buffer, senders).map(WorkerHost::Process)
    }

    /// Send each changed camera its new config. Rejected configs leave the
    /// running group untouched.
    pub fn update_configs(&mut self, configs: &CameraConfigs) -> Result<()> {
        let configs = validate_configs(configs)?;
        let running = self.configs.keys().copied().collect::<BTreeSet<_>>();
        if let Some(unknown) = configs.keys().find(|id| !running.contains(*id)) {
            return Err(ConfigError::UnknownCamera(*unknown).into());
        }
        if let Some(buffer) = &self.buffer {
            for config in configs.values() {
                let needed = config.image_size_bytes();
                if needed > buffer.slot_size() {
                    return Err(ConfigError::ExceedsSlotSize {
                        camera_id: config.camera_id,
                        needed,
                        slot_size: buffer.slot_size(),
                    }
                    .into());
                }
            }
        }

        for (camera_id, config) in &configs {
            if self.configs.get(camera_id) == Some(config) {
                continue;
            }
            if let Some(host) = self
                .hosts
                .iter_mut()
                .find(|h| h.camera_ids().contains(camera_id))
            {
                host.send(*camera_id, WorkerCommand::UpdateConfig(config.clone()))?;
            }
            self.configs.insert(*camera_id, config.clone());
        }
        Ok(())
    }

    /// Stop every worker. Workers that miss the timeout are terminated and
    /// listed in the report; that never fails the call.
    #[instrument(skip(self))]
    pub fn stop_capture(&mut self) -> StopReport {
        let timeout = self.stop_timeout();
        let report = shutdown_hosts(&mut self.hosts, timeout);
        self.hosts.clear();
        self.receivers.clear();
        if let Some(buffer) = self.buffer.take() {
            if buffer.in_use() > 0 {
                info!("{} shared slots still claimed at shutdown", buffer.in_use());
            }
        }
        for camera_id in &report.forced {
            error!("Camera {camera_id}: worker force-terminated");
        }
        info!(
            "Capture stopped: {} clean, {} forced",
            report.clean.len(),
            report.forced.len()
        );
        report
    }

    /// Number of cameras whose worker is still running
    pub fn live_workers(&mut self) -> usize {
        self.hosts.iter_mut().map(|h| h.live_cameras().len()).sum()
    }

    fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.start_timeout_ms)
    }

    fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.stop_timeout_ms)
    }
}

impl Drop for CaptureSupervisor {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop_capture();
        }
    }
}

fn shutdown_hosts(hosts: &mut Vec<WorkerHost>, timeout: Duration) -> StopReport {
    for host in hosts.iter_mut() {
        host.request_stop();
    }
    let deadline = Instant::now() + timeout;
    let mut report = StopReport::default();
    for host in hosts.iter_mut() {
        let stop = host.join_until(deadline);
        report.clean.extend(stop.clean);
        report.forced.extend(stop.forced);
    }
    hosts.clear();
    report.clean.sort_unstable();
    report.forced.sort_unstable();
    report
}

/// Poll every camera channel until all are ready, failed or timed out.
/// Frames that arrive early give their slot straight back.
fn await_ready(
    receivers: &BTreeMap<CameraId, Receiver<WorkerEvent>>,
    buffer: &SharedImageBuffer,
    timeout: Duration,
) -> (BTreeSet<CameraId>, Vec<(CameraId, String)>) {
    let deadline = Instant::now() + timeout;
    let mut ready = BTreeSet::new();
    let mut failed = BTreeMap::new();

    while ready.len() + failed.len() < receivers.len() {
        let mut progressed = false;
        for (camera_id, rx) in receivers {
            if ready.contains(camera_id) || failed.contains_key(camera_id) {
                continue;
            }
            match rx.try_recv() {
                Ok(WorkerEvent::Ready { width, height, .. }) => {
                    info!("Camera {camera_id}: ready at {width}x{height}");
                    ready.insert(*camera_id);
                    progressed = true;
                }
                Ok(WorkerEvent::Failed { reason, .. }) => {
                    failed.insert(*camera_id, reason);
                    progressed = true;
                }
                Ok(WorkerEvent::Closed { .. }) | Err(TryRecvError::Disconnected) => {
                    failed.insert(*camera_id, "worker exited during startup".to_string());
                    progressed = true;
                }
                Ok(WorkerEvent::Frame(frame)) => {
                    if let Some(slot) = frame.image.slot() {
                        if let Err(e) = buffer.release(slot.index) {
                            warn!("Camera {camera_id}: {e}");
                        }
                    }
                    progressed = true;
                }
                Err(TryRecvError::Empty) => {}
            }
        }
        if Instant::now() >= deadline {
            for camera_id in receivers.keys() {
                if !ready.contains(camera_id) && !failed.contains_key(camera_id) {
                    failed.insert(*camera_id, format!("not ready within {timeout:?}"));
                }
            }
            break;
        }
        if !progressed {
            thread::sleep(Duration::from_millis(1));
        }
    }
    (ready, failed.into_iter().collect())
}
