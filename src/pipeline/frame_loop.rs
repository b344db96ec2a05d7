//! The supervising side's event loop.
//!
//! One thread polls every camera's inbound channel with `try_recv`, hydrates
//! shared-buffer frames, feeds the synchronizer and routes emitted payloads.
//! Nothing in here blocks on a channel; when a tick finds no work the loop
//! sleeps for `idle_sleep_us`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::{Receiver, Sender, TryRecvError};
use tracing::{debug, error, info, trace, warn};

use super::router::{FrameRouter, RelayReceiver, RouterStats};
use super::synchronizer::FrameSynchronizer;
use crate::capture::config::{CameraConfigs, CameraId};
use crate::capture::frame::{FramePayload, ImageData};
use crate::clock;
use crate::error::{ConfigError, Error, Result, TransportError};
use crate::ipc::messages::WorkerEvent;
use crate::ipc::shared_buffer::SharedImageBuffer;
use crate::PipelineSettings;

const CONTROL_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Loop counters, written by the loop thread only
#[derive(Debug, Default)]
pub struct LoopStats {
    pub frames_received: AtomicU64,
    pub frames_corrupted: AtomicU64,
    pub payloads_emitted: AtomicU64,
    pub backfilled_slots: AtomicU64,
    pub missing_slots: AtomicU64,
    pub last_sequence: AtomicU64,
    /// `f64` bits of the observed group framerate
    pub framerate_bits: AtomicU64,
}

/// Point-in-time copy of the loop and router counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoopSnapshot {
    pub frames_received: u64,
    pub frames_corrupted: u64,
    pub payloads_emitted: u64,
    pub backfilled_slots: u64,
    pub missing_slots: u64,
    pub last_sequence: u64,
    pub framerate: f64,
    pub recorded: u64,
    pub relayed: u64,
    pub relay_skipped: u64,
}

enum LoopCommand {
    UpdateConfigs(CameraConfigs, Sender<Result<(), ConfigError>>),
    AttachRelay(Sender<RelayReceiver>),
}

pub struct FrameLoop {
    control: Sender<LoopCommand>,
    stop: Arc<AtomicBool>,
    stats: Arc<CachePadded<LoopStats>>,
    router_stats: Arc<CachePadded<RouterStats>>,
    join: Option<JoinHandle<()>>,
}

impl FrameLoop {
    pub fn spawn(
        settings: &PipelineSettings,
        configs: &CameraConfigs,
        receivers: BTreeMap<CameraId, Receiver<WorkerEvent>>,
        buffer: Arc<SharedImageBuffer>,
        router: FrameRouter,
    ) -> Result<Self> {
        let synchronizer = FrameSynchronizer::new(
            configs,
            settings.max_staleness_ms.map(Duration::from_millis),
            settings.framerate_window,
        )?;
        let (control, commands) = flume::unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(CachePadded::new(LoopStats::default()));
        let router_stats = router.stats();

        let state = LoopState {
            synchronizer,
            router,
            receivers,
            closed: BTreeSet::new(),
            buffer,
            last_sequence: BTreeMap::new(),
            commands,
            stats: stats.clone(),
            idle_sleep: Duration::from_micros(settings.idle_sleep_us),
        };
        let join = {
            let stop = stop.clone();
            thread::Builder::new()
                .name("frame-loop".into())
                .spawn(move || state.run(&stop))
                .map_err(Error::Spawn)?
        };
        Ok(Self {
            control,
            stop,
            stats,
            router_stats,
            join: Some(join),
        })
    }

    /// Apply new framerates to the synchronizer
    pub fn update_configs(&self, configs: &CameraConfigs) -> Result<()> {
        let (reply, response) = flume::bounded(1);
        self.control
            .send(LoopCommand::UpdateConfigs(configs.clone(), reply))
            .map_err(|_| TransportError::Disconnected("frame loop control"))?;
        response
            .recv_timeout(CONTROL_REPLY_TIMEOUT)
            .map_err(|_| TransportError::Disconnected("frame loop reply"))??;
        Ok(())
    }

    /// Attach a live relay, replacing any previous one
    pub fn attach_relay(&self) -> Result<RelayReceiver> {
        let (reply, response) = flume::bounded(1);
        self.control
            .send(LoopCommand::AttachRelay(reply))
            .map_err(|_| TransportError::Disconnected("frame loop control"))?;
        let relay = response
            .recv_timeout(CONTROL_REPLY_TIMEOUT)
            .map_err(|_| TransportError::Disconnected("frame loop reply"))?;
        Ok(relay)
    }

    pub fn stats(&self) -> LoopSnapshot {
        let stats = &self.stats;
        LoopSnapshot {
            frames_received: stats.frames_received.load(Ordering::Relaxed),
            frames_corrupted: stats.frames_corrupted.load(Ordering::Relaxed),
            payloads_emitted: stats.payloads_emitted.load(Ordering::Relaxed),
            backfilled_slots: stats.backfilled_slots.load(Ordering::Relaxed),
            missing_slots: stats.missing_slots.load(Ordering::Relaxed),
            last_sequence: stats.last_sequence.load(Ordering::Relaxed),
            framerate: f64::from_bits(stats.framerate_bits.load(Ordering::Relaxed)),
            recorded: self.router_stats.recorded.load(Ordering::Relaxed),
            relayed: self.router_stats.relayed.load(Ordering::Relaxed),
            relay_skipped: self.router_stats.relay_skipped.load(Ordering::Relaxed),
        }
    }

    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|join| !join.is_finished())
    }

    /// Stop and join the loop thread
    pub fn stop(&mut self) -> LoopSnapshot {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("Frame loop panicked");
            }
        }
        self.stats()
    }
}

impl Drop for FrameLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

struct LoopState {
    synchronizer: FrameSynchronizer,
    router: FrameRouter,
    receivers: BTreeMap<CameraId, Receiver<WorkerEvent>>,
    /// Cameras whose channel disconnected
    closed: BTreeSet<CameraId>,
    buffer: Arc<SharedImageBuffer>,
    last_sequence: BTreeMap<CameraId, u64>,
    commands: Receiver<LoopCommand>,
    stats: Arc<CachePadded<LoopStats>>,
    idle_sleep: Duration,
}

impl LoopState {
    fn run(mut self, stop: &AtomicBool) {
        info!(
            "Frame loop running for cameras {:?}",
            self.receivers.keys().collect::<Vec<_>>()
        );
        while !stop.load(Ordering::Acquire) {
            self.handle_commands();
            let received = self.drain_inbound();
            self.router.sync_recording_state();

            let emitted = self.synchronizer.poll_emit(clock::monotonic_ns());
            let busy = received > 0 || emitted.is_some();
            if let Some(payload) = emitted {
                self.stats.payloads_emitted.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .backfilled_slots
                    .fetch_add(payload.backfilled.len() as u64, Ordering::Relaxed);
                self.stats
                    .missing_slots
                    .fetch_add(payload.missing.len() as u64, Ordering::Relaxed);
                self.stats.last_sequence.store(payload.sequence, Ordering::Relaxed);
                if let Some(fps) = self.synchronizer.observed_framerate() {
                    self.stats.framerate_bits.store(fps.to_bits(), Ordering::Relaxed);
                }
                trace!("Emitting payload {}", payload.sequence);
                self.router.route(&payload);
            }

            if !busy {
                thread::sleep(self.idle_sleep);
            }
        }

        // stop sentinel for a recording released at shutdown
        self.router.sync_recording_state();
        self.drain_unused();
        debug!("Frame loop exiting");
    }

    fn handle_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                LoopCommand::UpdateConfigs(configs, reply) => {
                    let _ = reply.send(self.synchronizer.update_configs(&configs));
                }
                LoopCommand::AttachRelay(reply) => {
                    let _ = reply.send(self.router.attach_relay());
                }
            }
        }
    }

    /// Take everything queued on every camera channel. Returns the number of
    /// events handled.
    fn drain_inbound(&mut self) -> usize {
        let mut handled = 0;
        let mut events = Vec::new();
        for (camera_id, receiver) in &self.receivers {
            if self.closed.contains(camera_id) {
                continue;
            }
            loop {
                match receiver.try_recv() {
                    Ok(event) => events.push(event),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        warn!("Camera {camera_id}: channel closed, slot will be backfilled");
                        self.closed.insert(*camera_id);
                        break;
                    }
                }
            }
        }
        for event in events {
            handled += 1;
            self.handle_event(event);
        }
        handled
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Frame(frame) => self.accept_frame(frame),
            WorkerEvent::Ready {
                camera_id,
                width,
                height,
            } => info!("Camera {camera_id}: ready at {width}x{height}"),
            WorkerEvent::Failed {
                camera_id,
                kind,
                reason,
            } => error!("Camera {camera_id}: worker failed ({kind:?}): {reason}"),
            WorkerEvent::Closed { camera_id } => info!("Camera {camera_id}: worker closed"),
        }
    }

    fn accept_frame(&mut self, mut frame: FramePayload) {
        let camera_id = frame.camera_id;
        let now = clock::monotonic_ns();
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);

        if let Some(last) = self.last_sequence.insert(camera_id, frame.sequence) {
            if frame.sequence <= last {
                warn!(
                    "Camera {camera_id}: sequence went from {last} to {}",
                    frame.sequence
                );
            }
        }

        let slot = match frame.image.data {
            ImageData::Shared(slot) => {
                let hydrated = self.buffer.get_image(&slot);
                if let Err(e) = self.buffer.release(slot.index) {
                    warn!("Camera {camera_id}: {e}");
                }
                match hydrated {
                    Ok(bytes) => {
                        frame.image.data = ImageData::Inline(bytes);
                        Some(slot)
                    }
                    Err(e) => {
                        warn!("Camera {camera_id}: {e}");
                        self.stats.frames_corrupted.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("polycam_frames_corrupted").increment(1);
                        self.synchronizer.mark_invalid(camera_id, now);
                        return;
                    }
                }
            }
            ImageData::Inline(_) => None,
        };

        if let Err(e) = self.synchronizer.add_frame(frame, slot, now) {
            warn!("Dropping frame: {e}");
        }
    }

    /// Release slots of frames that arrived after the stop request
    fn drain_unused(&mut self) {
        for (camera_id, receiver) in &self.receivers {
            for event in receiver.drain() {
                if let WorkerEvent::Frame(frame) = event {
                    if let Some(slot) = frame.image.slot() {
                        if let Err(e) = self.buffer.release(slot.index) {
                            warn!("Camera {camera_id}: {e}");
                        }
                    }
                }
            }
        }
    }
}
