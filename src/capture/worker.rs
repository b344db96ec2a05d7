//! Capture worker: one device, one unbroken acquire loop.
//!
//! ```text
//! Disconnected -> Connecting -> Capturing <-> Reconfiguring -> Closed
//! ```
//!
//! The device read is the only blocking call. Commands are picked up with a
//! non-blocking receive between reads, so a config update or the stop
//! sentinel is applied at the next iteration boundary.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, Sender, TryRecvError};
use tracing::{debug, error, info, warn};

use super::config::{CameraConfig, CameraId, Rotation};
use super::decoder;
use super::device::{open_device, CaptureDevice, DeviceBackend};
use super::frame::{FramePayload, ImageData, RawImage};
use crate::clock;
use crate::error::{DeviceError, ImageError, TransportError};
use crate::ipc::messages::{FailureKind, WorkerCommand, WorkerEvent};
use crate::ipc::shared_buffer::SharedImageBuffer;

/// Upper bound on the pause after a failed or empty read
const READ_RETRY_MAX: Duration = Duration::from_millis(10);
/// Consecutive read failures between repeated warnings
const READ_FAILURE_LOG_EVERY: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Disconnected,
    Connecting,
    Capturing,
    Reconfiguring,
    Closed,
}

pub struct CaptureWorker {
    config: CameraConfig,
    backend: DeviceBackend,
    buffer: Arc<SharedImageBuffer>,
    commands: Receiver<WorkerCommand>,
    command_tx: Option<Sender<WorkerCommand>>,
    events: Sender<WorkerEvent>,
    state: WorkerState,
    sequence: u64,
    pin: bool,
}

impl CaptureWorker {
    pub fn new(
        config: CameraConfig,
        backend: DeviceBackend,
        buffer: Arc<SharedImageBuffer>,
        events: Sender<WorkerEvent>,
    ) -> Self {
        let (command_tx, commands) = flume::unbounded();
        Self {
            config,
            backend,
            buffer,
            commands,
            command_tx: Some(command_tx),
            events,
            state: WorkerState::Disconnected,
            sequence: 0,
            pin: false,
        }
    }

    /// Pin the worker thread to a core picked by camera id
    pub fn pinned(mut self, pin: bool) -> Self {
        self.pin = pin;
        self
    }

    pub fn camera_id(&self) -> CameraId {
        self.config.camera_id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Start the worker on its own thread
    pub fn spawn(mut self) -> std::io::Result<WorkerHandle> {
        let camera_id = self.camera_id();
        let commands = self
            .command_tx
            .take()
            .unwrap_or_else(|| flume::unbounded().0);
        let join = thread::Builder::new()
            .name(format!("capture-{camera_id}"))
            .spawn(move || self.run())?;
        Ok(WorkerHandle {
            camera_id,
            commands,
            join: Some(join),
        })
    }

    /// Run until stopped. Failures are reported as events, never returned.
    pub fn run(mut self) {
        let camera_id = self.camera_id();
        if self.pin {
            pin_to_core(camera_id);
        }

        let mut device = match self.connect() {
            Ok(device) => device,
            Err(e) => {
                error!("Camera {camera_id}: {e}");
                self.state = WorkerState::Closed;
                let _ = self.events.send(WorkerEvent::Failed {
                    camera_id,
                    kind: FailureKind::from(&e),
                    reason: e.to_string(),
                });
                return;
            }
        };

        self.state = WorkerState::Capturing;
        let ready = WorkerEvent::Ready {
            camera_id,
            width: self.output_width(),
            height: self.output_height(),
        };
        if self.events.send(ready).is_ok() {
            info!("Camera {camera_id}: capturing");
            self.capture_loop(device.as_mut());
        }

        device.release();
        self.state = WorkerState::Closed;
        let _ = self.events.send(WorkerEvent::Closed { camera_id });
        info!(
            "Camera {camera_id}: closed after {} frames",
            self.sequence
        );
    }

    fn connect(&mut self) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        let camera_id = self.camera_id();
        self.state = WorkerState::Connecting;
        let mut device = open_device(&self.backend, &self.config)?;

        // first read is discarded
        match device.read() {
            Ok(Some(_)) => Ok(device),
            Ok(None) => {
                device.release();
                Err(DeviceError::FailedToReadInitialFrame {
                    camera_id,
                    reason: "device returned no data".into(),
                })
            }
            Err(e) => {
                device.release();
                Err(DeviceError::FailedToReadInitialFrame {
                    camera_id,
                    reason: e.to_string(),
                })
            }
        }
    }

    fn capture_loop(&mut self, device: &mut dyn CaptureDevice) {
        let camera_id = self.camera_id();
        let mut failures = 0u64;
        loop {
            loop {
                match self.commands.try_recv() {
                    Ok(WorkerCommand::UpdateConfig(config)) => self.reconfigure(device, config),
                    Ok(WorkerCommand::Stop) => {
                        debug!("Camera {camera_id}: stop requested");
                        return;
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        warn!("Camera {camera_id}: command channel closed, stopping");
                        return;
                    }
                }
            }

            let started = clock::monotonic_ns();
            match device.read() {
                Ok(Some(image)) => {
                    if failures >= READ_FAILURE_LOG_EVERY {
                        info!("Camera {camera_id}: reads recovered after {failures} failures");
                    }
                    failures = 0;
                    let timestamp_ns = clock::monotonic_ns();
                    if !self.publish(image, timestamp_ns, timestamp_ns - started) {
                        return;
                    }
                }
                Ok(None) => {
                    metrics::counter!("polycam_frames_dropped", "reason" => "device_miss")
                        .increment(1);
                    debug!("Camera {camera_id}: read returned no frame");
                    thread::sleep(self.read_backoff());
                }
                Err(e) => {
                    metrics::counter!("polycam_frames_dropped", "reason" => "device_error")
                        .increment(1);
                    failures += 1;
                    if failures == 1 || failures % READ_FAILURE_LOG_EVERY == 0 {
                        warn!("Camera {camera_id}: {e} ({failures} consecutive failures)");
                    }
                    thread::sleep(self.read_backoff());
                }
            }
        }
    }

    fn read_backoff(&self) -> Duration {
        self.config.frame_period().min(READ_RETRY_MAX)
    }

    fn reconfigure(&mut self, device: &mut dyn CaptureDevice, config: CameraConfig) {
        let camera_id = self.camera_id();
        if config.camera_id != camera_id {
            warn!(
                "Camera {camera_id}: ignoring config for camera {}",
                config.camera_id
            );
            return;
        }
        self.state = WorkerState::Reconfiguring;
        match device.apply_config(&config) {
            Ok(()) => {
                info!("Camera {camera_id}: config updated");
                self.config = config;
            }
            Err(e) => {
                error!("Camera {camera_id}: {e}");
                let _ = self.events.send(WorkerEvent::Failed {
                    camera_id,
                    kind: FailureKind::from(&e),
                    reason: e.to_string(),
                });
            }
        }
        self.state = WorkerState::Capturing;
    }

    /// Returns false when the outbound channel is gone
    fn publish(&mut self, image: RawImage, timestamp_ns: u64, acquisition_ns: u64) -> bool {
        let camera_id = self.camera_id();
        let sequence = self.sequence;
        self.sequence += 1;

        let image = match rotate_once(&image, self.config.rotation) {
            Ok(image) => image,
            Err(e) => {
                warn!("Camera {camera_id}: rotation failed, frame {sequence} dropped: {e}");
                return true;
            }
        };
        let slot = match image.bytes().map(|bytes| self.buffer.put_image(bytes)) {
            Ok(Ok(slot)) => slot,
            Ok(Err(e)) if e.is_capacity() => {
                metrics::counter!("polycam_frames_dropped", "reason" => "buffer_full")
                    .increment(1);
                warn!("Camera {camera_id}: frame {sequence} dropped: {e}");
                return true;
            }
            Ok(Err(e)) => {
                error!("Camera {camera_id}: shared buffer failure: {e}");
                return true;
            }
            Err(e) => {
                error!("Camera {camera_id}: {e}");
                return true;
            }
        };

        let frame = FramePayload {
            success: true,
            image: RawImage {
                data: ImageData::Shared(slot),
                ..image
            },
            timestamp_ns,
            sequence,
            camera_id,
            acquisition_ns: Some(acquisition_ns),
        };
        metrics::counter!("polycam_frames_captured").increment(1);
        metrics::histogram!("polycam_acquisition_us").record(acquisition_ns as f64 / 1_000.0);

        if self.events.send(WorkerEvent::Frame(frame)).is_err() {
            if let Err(e) = self.buffer.release(slot.index) {
                warn!("Camera {camera_id}: {e}");
            }
            error!("Camera {camera_id}: frame channel closed");
            return false;
        }
        true
    }

    fn output_width(&self) -> u32 {
        let res = self.config.resolution;
        if self.config.rotation.swaps_axes() {
            res.height
        } else {
            res.width
        }
    }

    fn output_height(&self) -> u32 {
        let res = self.config.resolution;
        if self.config.rotation.swaps_axes() {
            res.width
        } else {
            res.height
        }
    }
}

fn rotate_once(image: &RawImage, rotation: Rotation) -> Result<RawImage, ImageError> {
    if rotation == Rotation::None {
        return Ok(image.clone());
    }
    decoder::rotate(image, rotation)
}

fn pin_to_core(camera_id: CameraId) {
    let Some(cores) = core_affinity::get_core_ids().filter(|c| !c.is_empty()) else {
        warn!("Camera {camera_id}: no cores reported, not pinning");
        return;
    };
    let core = cores[camera_id as usize % cores.len()];
    if core_affinity::set_for_current(core) {
        debug!("Camera {camera_id}: pinned to core {}", core.id);
    } else {
        warn!("Camera {camera_id}: failed to pin to core {}", core.id);
    }
}

/// Owner-side handle of a worker thread
pub struct WorkerHandle {
    camera_id: CameraId,
    commands: Sender<WorkerCommand>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn camera_id(&self) -> CameraId {
        self.camera_id
    }

    pub fn send(&self, command: WorkerCommand) -> Result<(), TransportError> {
        self.commands
            .send(command)
            .map_err(|_| TransportError::Disconnected("worker command"))
    }

    /// Enqueue the stop sentinel. A worker that already exited is fine.
    pub fn request_stop(&self) {
        let _ = self.commands.send(WorkerCommand::Stop);
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Join if the thread exits before `deadline`. Returns false if it is
    /// still running; the thread is then left detached.
    pub fn join_until(&mut self, deadline: Instant) -> bool {
        while !self.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("Camera {}: worker thread panicked", self.camera_id);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::capture::device::SyntheticOptions;

    fn setup(
        config: CameraConfig,
        options: SyntheticOptions,
    ) -> (CaptureWorker, Receiver<WorkerEvent>, Arc<SharedImageBuffer>) {
        let buffer = Arc::new(
            SharedImageBuffer::create_anonymous(8, config.image_size_bytes()).unwrap(),
        );
        let (events_tx, events) = flume::unbounded();
        let worker = CaptureWorker::new(
            config,
            DeviceBackend::Synthetic(options),
            buffer.clone(),
            events_tx,
        );
        (worker, events, buffer)
    }

    /// Device that fails every read without blocking
    struct FailingDevice {
        camera_id: CameraId,
        reads: Arc<AtomicU64>,
    }

    impl CaptureDevice for FailingDevice {
        fn read(&mut self) -> Result<Option<RawImage>, DeviceError> {
            self.reads.fetch_add(1, Ordering::Relaxed);
            Err(DeviceError::ReadFailed {
                camera_id: self.camera_id,
                reason: "unplugged".into(),
            })
        }

        fn apply_config(&mut self, _config: &CameraConfig) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    fn small(camera_id: CameraId) -> CameraConfig {
        CameraConfig::new(camera_id)
            .with_resolution(4, 2)
            .with_framerate(200.0)
    }

    fn next_frame(events: &Receiver<WorkerEvent>) -> FramePayload {
        loop {
            match events.recv_timeout(Duration::from_secs(2)).unwrap() {
                WorkerEvent::Frame(frame) => return frame,
                WorkerEvent::Ready { .. } => continue,
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn reports_ready_then_frames_with_increasing_sequence() {
        let (worker, events, buffer) = setup(small(0), SyntheticOptions::default());
        let mut handle = worker.spawn().unwrap();

        assert!(matches!(
            events.recv_timeout(Duration::from_secs(2)).unwrap(),
            WorkerEvent::Ready { camera_id: 0, width: 4, height: 2 }
        ));

        let mut last = None;
        for _ in 0..5 {
            let frame = next_frame(&events);
            let slot = frame.image.slot().unwrap();
            assert_eq!(buffer.get_image(&slot).unwrap().len(), 4 * 2 * 3);
            buffer.release(slot.index).unwrap();
            if let Some(last) = last {
                assert!(frame.sequence > last);
            } else {
                assert_eq!(frame.sequence, 0);
            }
            last = Some(frame.sequence);
        }

        handle.request_stop();
        assert!(handle.join_until(Instant::now() + Duration::from_secs(2)));
        let closed = events
            .iter()
            .find(|e| matches!(e, WorkerEvent::Closed { .. }));
        assert_eq!(closed, Some(WorkerEvent::Closed { camera_id: 0 }));
    }

    #[test]
    fn open_failure_is_an_event() {
        let options = SyntheticOptions {
            fail_open: vec![3],
            ..Default::default()
        };
        let (worker, events, _buffer) = setup(small(3), options);
        worker.run();
        match events.try_recv().unwrap() {
            WorkerEvent::Failed { camera_id, kind, .. } => {
                assert_eq!(camera_id, 3);
                assert_eq!(kind, FailureKind::OpenDevice);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn empty_first_read_fails_startup() {
        let options = SyntheticOptions {
            fail_first_read: vec![1],
            ..Default::default()
        };
        let (worker, events, _buffer) = setup(small(1), options);
        worker.run();
        assert!(matches!(
            events.try_recv().unwrap(),
            WorkerEvent::Failed {
                kind: FailureKind::InitialFrame,
                ..
            }
        ));
    }

    #[test]
    fn sequence_keeps_increasing_across_drops() {
        let options = SyntheticOptions {
            drop_every: Some(2),
            ..Default::default()
        };
        let (worker, events, buffer) = setup(small(0), options);
        let mut handle = worker.spawn().unwrap();

        let mut sequences = Vec::new();
        for _ in 0..4 {
            let frame = next_frame(&events);
            buffer.release(frame.image.slot().unwrap().index).unwrap();
            sequences.push(frame.sequence);
        }
        handle.request_stop();
        assert!(handle.join_until(Instant::now() + Duration::from_secs(2)));
        assert!(sequences.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn rotation_and_reconfigure_apply_between_reads() {
        let config = small(0).with_rotation(Rotation::Clockwise90);
        let (worker, events, buffer) = setup(config.clone(), SyntheticOptions::default());
        let mut handle = worker.spawn().unwrap();

        let frame = next_frame(&events);
        assert_eq!(frame.resolution(), (2, 4));
        buffer.release(frame.image.slot().unwrap().index).unwrap();

        handle
            .send(WorkerCommand::UpdateConfig(
                config.with_rotation(Rotation::None).with_resolution(2, 2),
            ))
            .unwrap();
        let resized = (0..50)
            .map(|_| {
                let frame = next_frame(&events);
                buffer.release(frame.image.slot().unwrap().index).unwrap();
                frame.resolution()
            })
            .any(|res| res == (2, 2));
        assert!(resized);

        handle.request_stop();
        assert!(handle.join_until(Instant::now() + Duration::from_secs(2)));
    }

    #[test]
    fn failing_reads_back_off_and_still_stop() {
        let (mut worker, _events, _buffer) = setup(
            small(0).with_framerate(30.0),
            SyntheticOptions::default(),
        );
        let commands = worker.command_tx.clone().unwrap();
        let reads = Arc::new(AtomicU64::new(0));
        let mut device = FailingDevice {
            camera_id: 0,
            reads: reads.clone(),
        };
        let join = thread::spawn(move || worker.capture_loop(&mut device));

        thread::sleep(Duration::from_millis(100));
        commands.send(WorkerCommand::Stop).unwrap();
        join.join().unwrap();

        // one retry per 10 ms at most
        let reads = reads.load(Ordering::Relaxed);
        assert!((2..=20).contains(&reads), "{reads} reads in 100ms");
    }
}
