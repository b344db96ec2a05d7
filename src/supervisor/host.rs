//! Worker hosts: a group of capture workers living either on threads of the
//! supervising process or inside one child process.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::Sender;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use crate::capture::config::{CameraConfig, CameraId};
use crate::capture::device::DeviceBackend;
use crate::capture::worker::{CaptureWorker, WorkerHandle};
use crate::error::{Error, TransportError};
use crate::ipc::codec::{pack, unpack};
use crate::ipc::framing::{read_message, write_message};
use crate::ipc::messages::{HostInit, WorkerCommand, WorkerEvent};
use crate::ipc::shared_buffer::SharedImageBuffer;

const TERM_GRACE: Duration = Duration::from_millis(500);

/// Subcommand the process host re-executes the binary with
pub const WORKER_SUBCOMMAND: &str = "capture-worker";

pub enum WorkerHost {
    Thread(ThreadHost),
    Process(ProcessHost),
}

/// Outcome of stopping one host
#[derive(Debug, Default)]
pub struct HostStop {
    pub clean: Vec<CameraId>,
    pub forced: Vec<CameraId>,
}

impl WorkerHost {
    pub fn camera_ids(&self) -> Vec<CameraId> {
        match self {
            WorkerHost::Thread(host) => host.workers.keys().copied().collect(),
            WorkerHost::Process(host) => host.camera_ids.clone(),
        }
    }

    pub fn send(&mut self, camera_id: CameraId, command: WorkerCommand) -> Result<(), TransportError> {
        match self {
            WorkerHost::Thread(host) => host
                .workers
                .get(&camera_id)
                .ok_or(TransportError::Disconnected("worker command"))?
                .send(command),
            WorkerHost::Process(host) => host.send(&command),
        }
    }

    /// Enqueue the stop sentinel without waiting
    pub fn request_stop(&mut self) {
        match self {
            WorkerHost::Thread(host) => host.workers.values().for_each(WorkerHandle::request_stop),
            WorkerHost::Process(host) => host.request_stop(),
        }
    }

    /// Wait for the host to exit, escalating once `deadline` passes
    pub fn join_until(&mut self, deadline: Instant) -> HostStop {
        match self {
            WorkerHost::Thread(host) => host.join_until(deadline),
            WorkerHost::Process(host) => host.join_until(deadline),
        }
    }

    /// Cameras whose worker is still running
    pub fn live_cameras(&mut self) -> Vec<CameraId> {
        match self {
            WorkerHost::Thread(host) => host
                .workers
                .values()
                .filter(|w| !w.is_finished())
                .map(WorkerHandle::camera_id)
                .collect(),
            WorkerHost::Process(host) => {
                if host.is_alive() {
                    host.camera_ids.clone()
                } else {
                    Vec::new()
                }
            }
        }
    }
}

/// Workers as threads of this process
pub struct ThreadHost {
    workers: BTreeMap<CameraId, WorkerHandle>,
}

impl ThreadHost {
    pub fn spawn(
        configs: &[CameraConfig],
        backend: &DeviceBackend,
        buffer: &Arc<SharedImageBuffer>,
        events: &BTreeMap<CameraId, Sender<WorkerEvent>>,
        pin_workers: bool,
    ) -> Result<Self, Error> {
        let mut workers = BTreeMap::new();
        for config in configs {
            let camera_id = config.camera_id;
            let events = events
                .get(&camera_id)
                .cloned()
                .ok_or(TransportError::Disconnected("worker event"))?;
            let handle = CaptureWorker::new(config.clone(), backend.clone(), buffer.clone(), events)
                .pinned(pin_workers)
                .spawn()
                .map_err(Error::Spawn)?;
            workers.insert(camera_id, handle);
        }
        Ok(Self { workers })
    }

    fn join_until(&mut self, deadline: Instant) -> HostStop {
        let mut stop = HostStop::default();
        for (camera_id, worker) in &mut self.workers {
            if worker.join_until(deadline) {
                stop.clean.push(*camera_id);
            } else {
                // threads cannot be killed; it is left detached
                stop.forced.push(*camera_id);
            }
        }
        stop
    }
}

/// Workers inside one child process, talking over framed stdin/stdout
pub struct ProcessHost {
    camera_ids: Vec<CameraId>,
    child: Child,
    stdin: Option<ChildStdin>,
    reader: Option<JoinHandle<()>>,
}

impl ProcessHost {
    pub fn spawn(
        executable: &Path,
        init: HostInit,
        buffer: &Arc<SharedImageBuffer>,
        events: &BTreeMap<CameraId, Sender<WorkerEvent>>,
    ) -> Result<Self, Error> {
        let camera_ids = init.configs.iter().map(|c| c.camera_id).collect::<Vec<_>>();
        let mut child = Command::new(executable)
            .arg(WORKER_SUBCOMMAND)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(Error::Spawn)?;
        info!(
            "Spawned worker host pid {} for cameras {:?}",
            child.id(),
            camera_ids
        );

        let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(TransportError::Disconnected("worker host pipe").into());
        };
        let sent = pack(&init)
            .map_err(TransportError::from)
            .and_then(|bytes| write_message(&mut stdin, &bytes));
        if let Err(e) = sent {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e.into());
        }

        let routes = camera_ids
            .iter()
            .filter_map(|id| events.get(id).map(|tx| (*id, tx.clone())))
            .collect::<BTreeMap<_, _>>();
        let buffer = buffer.clone();
        let pid = child.id();
        let reader = thread::Builder::new()
            .name(format!("host-reader-{pid}"))
            .spawn(move || relay_events(stdout, routes, &buffer))
            .map_err(Error::Spawn)?;

        Ok(Self {
            camera_ids,
            child,
            stdin: Some(stdin),
            reader: Some(reader),
        })
    }

    fn send(&mut self, command: &WorkerCommand) -> Result<(), TransportError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or(TransportError::Disconnected("worker host stdin"))?;
        let bytes = pack(command)?;
        write_message(stdin, &bytes)
    }

    fn request_stop(&mut self) {
        if let Err(e) = self.send(&WorkerCommand::Stop) {
            debug!("Worker host {}: stop not delivered: {e}", self.child.id());
        }
        // EOF is a second stop signal
        self.stdin = None;
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn wait_until(&mut self, deadline: Instant) -> bool {
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!("Worker host {} exited: {status}", self.child.id());
                    return true;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(5)),
                Ok(None) => return false,
                Err(e) => {
                    warn!("Worker host {}: wait failed: {e}", self.child.id());
                    return false;
                }
            }
        }
    }

    fn join_until(&mut self, deadline: Instant) -> HostStop {
        let pid = self.child.id();
        let clean = self.wait_until(deadline);
        if !clean {
            warn!("Worker host {pid} did not stop in time, sending SIGTERM");
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!("SIGTERM to {pid} failed: {e}");
            }
            if !self.wait_until(Instant::now() + TERM_GRACE) {
                error!("Worker host {pid} ignored SIGTERM, killing");
                let _ = self.child.kill();
                let _ = self.child.wait();
            }
        }
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                error!("Worker host {pid}: reader thread panicked");
            }
        }

        let ids = self.camera_ids.clone();
        if clean {
            HostStop {
                clean: ids,
                forced: Vec::new(),
            }
        } else {
            HostStop {
                clean: Vec::new(),
                forced: ids,
            }
        }
    }
}

impl Drop for ProcessHost {
    fn drop(&mut self) {
        if self.is_alive() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Decode events from a host's stdout and route them per camera. Frames no
/// one listens to give their slot back.
fn relay_events<R: Read>(
    mut stdout: R,
    routes: BTreeMap<CameraId, Sender<WorkerEvent>>,
    buffer: &SharedImageBuffer,
) {
    loop {
        let bytes = match read_message(&mut stdout) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => break,
            Err(e) => {
                error!("Worker host pipe failed: {e}");
                break;
            }
        };
        let event = match unpack::<WorkerEvent>(bytes) {
            Ok(event) => event,
            Err(e) => {
                error!("Undecodable worker event: {e}");
                break;
            }
        };
        let camera_id = event.camera_id();
        let Some(route) = routes.get(&camera_id) else {
            warn!("Event for unexpected camera {camera_id}");
            continue;
        };
        if let Err(flume::SendError(WorkerEvent::Frame(frame))) = route.send(event) {
            if let Some(slot) = frame.image.slot() {
                if let Err(e) = buffer.release(slot.index) {
                    warn!("Camera {camera_id}: {e}");
                }
            }
        }
    }
}

/// Child-process side of a [`ProcessHost`]: read a [`HostInit`], run its
/// workers, relay their events to `output`, stop on the sentinel or on EOF.
pub fn run_worker_host<R, W>(mut input: R, output: W) -> Result<(), Error>
where
    R: Read,
    W: Write + Send + 'static,
{
    let init = match read_message(&mut input)? {
        Some(bytes) => unpack::<HostInit>(bytes).map_err(TransportError::from)?,
        None => return Err(TransportError::Disconnected("host init").into()),
    };
    let buffer = Arc::new(SharedImageBuffer::open(&init.shm_path)?);
    info!(
        "Worker host {} attached to {} for {} cameras",
        std::process::id(),
        init.shm_path.display(),
        init.configs.len()
    );

    let (events_tx, events_rx) = flume::unbounded::<WorkerEvent>();
    let writer = thread::Builder::new()
        .name("host-writer".into())
        .spawn(move || {
            let mut output = output;
            for event in events_rx.iter() {
                let sent = pack(&event)
                    .map_err(TransportError::from)
                    .and_then(|bytes| write_message(&mut output, &bytes));
                if let Err(e) = sent {
                    error!("Worker host output failed: {e}");
                    break;
                }
            }
        })
        .map_err(Error::Spawn)?;

    let mut workers = BTreeMap::new();
    for config in &init.configs {
        let handle = CaptureWorker::new(
            config.clone(),
            init.backend.clone(),
            buffer.clone(),
            events_tx.clone(),
        )
        .pinned(init.pin_workers)
        .spawn()
        .map_err(Error::Spawn)?;
        workers.insert(config.camera_id, handle);
    }
    drop(events_tx);

    loop {
        let bytes = match read_message(&mut input) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!("Command pipe closed");
                break;
            }
            Err(e) => {
                error!("Command pipe failed: {e}");
                break;
            }
        };
        match unpack::<WorkerCommand>(bytes) {
            Ok(WorkerCommand::Stop) => break,
            Ok(WorkerCommand::UpdateConfig(config)) => match workers.get(&config.camera_id) {
                Some(worker) => {
                    if let Err(e) = worker.send(WorkerCommand::UpdateConfig(config)) {
                        warn!("Config update not delivered: {e}");
                    }
                }
                None => warn!("Config for camera {} not hosted here", config.camera_id),
            },
            Err(e) => error!("Undecodable command: {e}"),
        }
    }

    for worker in workers.values() {
        worker.request_stop();
    }
    let deadline = Instant::now() + Duration::from_secs(2);
    for (camera_id, worker) in &mut workers {
        if !worker.join_until(deadline) {
            warn!("Camera {camera_id}: worker did not stop");
        }
    }
    drop(workers);
    if writer.join().is_err() {
        error!("Worker host writer panicked");
    }
    Ok(())
}
