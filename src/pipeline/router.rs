//! Frame router: fans emitted payloads out to the recorder queue and the
//! live relay.
//!
//! Recording favors completeness: every payload is enqueued while recording
//! is requested, followed by a stop sentinel when the request is withdrawn.
//! The live relay favors liveness: it holds at most one undelivered payload
//! and anything arriving while that one is still pending is skipped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam::utils::CachePadded;
use flume::{Receiver, Sender, TrySendError};
use tracing::{debug, error, info, warn};

use super::payload::MultiFramePayload;
use crate::error::TransportError;
use crate::ipc::codec::{pack, unpack};
use crate::recording::{RecorderMessage, RecorderStatus};

/// Consumer on the far side of the live relay
pub trait RelaySink {
    fn send(&mut self, payload: Bytes) -> Result<(), TransportError>;
}

/// Relay sink that only logs what it receives
#[derive(Debug, Default)]
pub struct LoggingSink {
    pub received: u64,
}

impl RelaySink for LoggingSink {
    fn send(&mut self, payload: Bytes) -> Result<(), TransportError> {
        let len = payload.len();
        let decoded: MultiFramePayload = unpack(payload)?;
        self.received += 1;
        debug!(
            "Relay payload {}: {} cameras, {} bytes, {} backfilled",
            decoded.sequence,
            decoded.frames.len(),
            len,
            decoded.backfilled.len()
        );
        Ok(())
    }
}

/// Receiving end of the live relay
pub struct RelayReceiver {
    rx: Receiver<Bytes>,
}

impl RelayReceiver {
    pub fn try_recv(&self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Bytes> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Feed every relayed payload to `sink` on a dedicated thread. The
    /// thread ends when the router detaches or the sink fails, and hands the
    /// sink back.
    pub fn pump<S>(self, mut sink: S) -> std::io::Result<JoinHandle<S>>
    where
        S: RelaySink + Send + 'static,
    {
        thread::Builder::new()
            .name("relay".into())
            .spawn(move || {
                for payload in self.rx.iter() {
                    if let Err(e) = sink.send(payload) {
                        warn!("Relay sink failed, detaching: {e}");
                        break;
                    }
                }
                sink
            })
    }
}

/// Counters shared between the router and whoever reports on it
#[derive(Debug, Default)]
pub struct RouterStats {
    pub recorded: AtomicU64,
    pub relayed: AtomicU64,
    pub relay_skipped: AtomicU64,
}

struct RecorderLink {
    queue: Sender<RecorderMessage>,
    status: Arc<RecorderStatus>,
}

pub struct FrameRouter {
    recorder: Option<RecorderLink>,
    relay: Option<Sender<Bytes>>,
    was_recording: bool,
    stats: Arc<CachePadded<RouterStats>>,
}

impl FrameRouter {
    pub fn new() -> Self {
        Self {
            recorder: None,
            relay: None,
            was_recording: false,
            stats: Arc::new(CachePadded::new(RouterStats::default())),
        }
    }

    pub fn with_recorder(mut self, queue: Sender<RecorderMessage>, status: Arc<RecorderStatus>) -> Self {
        self.recorder = Some(RecorderLink { queue, status });
        self
    }

    pub fn stats(&self) -> Arc<CachePadded<RouterStats>> {
        self.stats.clone()
    }

    /// Replace the relay. Capacity 1: one pending payload at most.
    pub fn attach_relay(&mut self) -> RelayReceiver {
        let (tx, rx) = flume::bounded(1);
        self.relay = Some(tx);
        info!("Live relay attached");
        RelayReceiver { rx }
    }

    pub fn set_relay(&mut self, relay: Sender<Bytes>) {
        self.relay = Some(relay);
    }

    pub fn has_relay(&self) -> bool {
        self.relay.is_some()
    }

    /// Enqueue the stop sentinel when recording goes from requested to not
    pub fn sync_recording_state(&mut self) {
        let Some(link) = &self.recorder else {
            return;
        };
        let active = link.status.should_record();
        if self.was_recording && !active {
            debug!("Recording released, sending stop sentinel");
            if link.queue.send(RecorderMessage::Stop).is_err() {
                error!("Recorder queue closed");
                self.recorder = None;
            }
        }
        self.was_recording = active;
    }

    /// Deliver one emitted payload. The payload is packed at most once and
    /// the bytes shared between consumers.
    pub fn route(&mut self, payload: &MultiFramePayload) {
        self.sync_recording_state();

        let mut packed: Option<Bytes> = None;
        let mut packed_bytes = || -> Option<Bytes> {
            if packed.is_none() {
                match pack(payload) {
                    Ok(bytes) => packed = Some(bytes),
                    Err(e) => error!("Payload {} not packed: {e}", payload.sequence),
                }
            }
            packed.clone()
        };

        if self.was_recording {
            if let Some(link) = &self.recorder {
                let Some(bytes) = packed_bytes() else {
                    return;
                };
                if link.queue.send(RecorderMessage::Frames(bytes)).is_ok() {
                    self.stats.recorded.fetch_add(1, Ordering::Relaxed);
                } else {
                    error!("Recorder queue closed, payload {} lost", payload.sequence);
                    self.recorder = None;
                    self.was_recording = false;
                }
            }
        }

        if let Some(relay) = &self.relay {
            // checked first so a busy client costs no packing
            if relay.is_full() {
                self.skip_relay();
                return;
            }
            let Some(bytes) = packed_bytes() else {
                return;
            };
            match relay.try_send(bytes) {
                Ok(()) => {
                    self.stats.relayed.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("polycam_relay_sent").increment(1);
                }
                Err(TrySendError::Full(_)) => self.skip_relay(),
                Err(TrySendError::Disconnected(_)) => {
                    info!("Live relay detached");
                    self.relay = None;
                }
            }
        }
    }

    fn skip_relay(&self) {
        self.stats.relay_skipped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("polycam_relay_skipped").increment(1);
    }
}

impl Default for FrameRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::pipeline::payload::tests::frame;

    fn payload(sequence: u64) -> MultiFramePayload {
        let mut payload = MultiFramePayload::create([0], sequence);
        payload.add_frame(frame(0, sequence, sequence), None, sequence).unwrap();
        payload
    }

    #[test]
    fn recording_gets_every_payload_then_one_stop() {
        let (queue, records) = flume::unbounded();
        let status = Arc::new(RecorderStatus::default());
        let mut router = FrameRouter::new().with_recorder(queue, status.clone());

        router.route(&payload(0));
        status.request_recording(true);
        for seq in 1..=50 {
            router.route(&payload(seq));
        }
        status.request_recording(false);
        router.sync_recording_state();
        router.route(&payload(51));
        router.sync_recording_state();

        let messages = records.drain().collect::<Vec<_>>();
        assert_eq!(messages.len(), 51);
        let sequences = messages[..50]
            .iter()
            .map(|m| match m {
                RecorderMessage::Frames(bytes) => {
                    unpack::<MultiFramePayload>(bytes.clone()).unwrap().sequence
                }
                other => panic!("unexpected {other:?}"),
            })
            .collect::<Vec<_>>();
        assert_eq!(sequences, (1..=50).collect::<Vec<_>>());
        assert!(matches!(messages[50], RecorderMessage::Stop));
        assert_eq!(router.stats().recorded.load(Ordering::Relaxed), 50);
    }

    #[test]
    fn busy_relay_skips_instead_of_queueing() {
        let mut router = FrameRouter::new();
        let relay = router.attach_relay();

        router.route(&payload(0));
        router.route(&payload(1));
        router.route(&payload(2));
        let first = unpack::<MultiFramePayload>(relay.try_recv().unwrap()).unwrap();
        assert_eq!(first.sequence, 0);
        assert!(relay.try_recv().is_none());

        router.route(&payload(3));
        let next = unpack::<MultiFramePayload>(relay.try_recv().unwrap()).unwrap();
        assert_eq!(next.sequence, 3);

        let stats = router.stats();
        assert_eq!(stats.relayed.load(Ordering::Relaxed), 2);
        assert_eq!(stats.relay_skipped.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn dropped_receiver_detaches_relay() {
        let mut router = FrameRouter::new();
        drop(router.attach_relay());
        router.route(&payload(0));
        assert!(!router.has_relay());
    }

    #[test]
    fn pump_feeds_the_sink() {
        let mut router = FrameRouter::new();
        let handle = router.attach_relay().pump(LoggingSink::default()).unwrap();
        for seq in 0..20 {
            router.route(&payload(seq));
            thread::sleep(Duration::from_millis(2));
        }
        drop(router);
        let sink = handle.join().unwrap();
        assert!(sink.received >= 1);
    }
}
