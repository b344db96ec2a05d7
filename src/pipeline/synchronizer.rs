//! Frame synchronizer: assembles per-camera frames into aligned
//! multi-frame payloads.
//!
//! One payload is in progress at a time. It is emitted when every camera has
//! filled its slot, or once its oldest frame is older than the ideal frame
//! period (`1 / slowest framerate`). Before emission, empty slots are
//! backfilled from the previously emitted payload. Until the first payload
//! fills up (priming) there is nothing to backfill from, so only fullness
//! triggers emission.

use std::collections::BTreeSet;
use std::mem;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::payload::{LifecycleTag, MultiFramePayload};
use super::ringbuf::FramerateTracker;
use crate::capture::config::{ideal_frame_period, validate_configs, CameraConfigs, CameraId};
use crate::capture::frame::{FramePayload, SlotRef};
use crate::error::ConfigError;

const FRAMERATE_LOG_EVERY: u64 = 300;

pub struct FrameSynchronizer {
    current: MultiFramePayload,
    /// Last emitted payload; `None` while priming
    previous: Option<MultiFramePayload>,
    ideal_period_ns: u64,
    max_staleness_ns: Option<u64>,
    framerate: FramerateTracker,
}

impl FrameSynchronizer {
    pub fn new(
        configs: &CameraConfigs,
        max_staleness: Option<Duration>,
        framerate_window: usize,
    ) -> Result<Self, ConfigError> {
        let configs = validate_configs(configs)?;
        let period = ideal_frame_period(&configs).ok_or(ConfigError::NoCameras)?;
        info!(
            "Synchronizing cameras {:?}, ideal frame period {:?}",
            configs.keys().collect::<Vec<_>>(),
            period
        );
        Ok(Self {
            current: MultiFramePayload::create(configs.keys().copied(), 0),
            previous: None,
            ideal_period_ns: period.as_nanos() as u64,
            max_staleness_ns: max_staleness.map(|d| d.as_nanos() as u64),
            framerate: FramerateTracker::new(framerate_window),
        })
    }

    pub fn camera_ids(&self) -> BTreeSet<CameraId> {
        self.current.camera_ids().collect()
    }

    pub fn is_priming(&self) -> bool {
        self.previous.is_none()
    }

    pub fn ideal_frame_period(&self) -> Duration {
        Duration::from_nanos(self.ideal_period_ns)
    }

    /// Sequence number the next emitted payload will carry
    pub fn next_sequence(&self) -> u64 {
        self.current.sequence
    }

    pub fn current(&self) -> &MultiFramePayload {
        &self.current
    }

    pub fn add_frame(
        &mut self,
        frame: FramePayload,
        slot: Option<SlotRef>,
        now_ns: u64,
    ) -> Result<(), ConfigError> {
        self.current.add_frame(frame, slot, now_ns)
    }

    /// The camera's frame for this tick failed its integrity check
    pub fn mark_invalid(&mut self, camera_id: CameraId, now_ns: u64) {
        if let Err(e) = self.current.reject_frame(camera_id, now_ns) {
            warn!("{e}");
        }
    }

    /// Check the emit condition and hand out the completed payload
    pub fn poll_emit(&mut self, now_ns: u64) -> Option<MultiFramePayload> {
        if !self.current.is_full() {
            if self.is_priming() {
                return None;
            }
            let oldest = self.current.oldest_timestamp_ns()?;
            if now_ns.saturating_sub(oldest) <= self.ideal_period_ns {
                return None;
            }
            self.current.record(LifecycleTag::TimedOut, None, now_ns);
        }

        if let Some(previous) = &self.previous {
            self.current
                .backfill_from(previous, now_ns, self.max_staleness_ns);
        }
        self.current.record(LifecycleTag::Emitted, None, now_ns);

        let next = MultiFramePayload::from_previous(&self.current);
        let emitted = mem::replace(&mut self.current, next);
        if self.previous.is_none() {
            debug!("Priming complete at sequence {}", emitted.sequence);
        }
        self.previous = Some(emitted.clone());
        self.track(now_ns, &emitted);
        Some(emitted)
    }

    fn track(&mut self, now_ns: u64, emitted: &MultiFramePayload) {
        self.framerate.record(now_ns);
        metrics::counter!("polycam_payloads_emitted").increment(1);
        if !emitted.backfilled.is_empty() {
            metrics::counter!("polycam_backfilled_slots").increment(emitted.backfilled.len() as u64);
        }
        if !emitted.missing.is_empty() {
            metrics::counter!("polycam_missing_slots").increment(emitted.missing.len() as u64);
        }
        if let Some(fps) = self.framerate.framerate() {
            metrics::gauge!("polycam_group_fps").set(fps);
            if self.framerate.frames() % FRAMERATE_LOG_EVERY == 0 {
                info!(
                    "Group framerate {fps:.1} fps (payload {})",
                    emitted.sequence
                );
            }
        }
    }

    /// Apply new framerates. The camera set must not change.
    pub fn update_configs(&mut self, configs: &CameraConfigs) -> Result<(), ConfigError> {
        let configs = validate_configs(configs)?;
        let running = self.camera_ids();
        if let Some(id) = configs
            .keys()
            .chain(running.iter())
            .find(|id| !running.contains(*id) || !configs.contains_key(*id))
        {
            return Err(ConfigError::UnknownCamera(*id));
        }
        let period = ideal_frame_period(&configs).ok_or(ConfigError::NoCameras)?;
        self.ideal_period_ns = period.as_nanos() as u64;
        self.framerate.reset();
        info!("Ideal frame period now {period:?}");
        Ok(())
    }

    /// Observed emission rate over the tracking window
    pub fn observed_framerate(&self) -> Option<f64> {
        self.framerate.framerate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::config::CameraConfig;
    use crate::pipeline::payload::tests::frame;

    const MS: u64 = 1_000_000;

    fn sync(rates: &[f64], staleness: Option<Duration>) -> FrameSynchronizer {
        let configs = rates
            .iter()
            .enumerate()
            .map(|(i, rate)| (i as CameraId, CameraConfig::new(i as CameraId).with_framerate(*rate)))
            .collect();
        FrameSynchronizer::new(&configs, staleness, 16).unwrap()
    }

    #[test]
    fn priming_waits_for_every_camera() {
        let mut sync = sync(&[30.0, 30.0], None);
        sync.add_frame(frame(0, 0, 0), None, 0).unwrap();
        // far past the period, but still priming
        assert!(sync.poll_emit(10_000 * MS).is_none());
        assert!(sync.is_priming());

        sync.add_frame(frame(1, 0, 10_000 * MS), None, 10_000 * MS).unwrap();
        let first = sync.poll_emit(10_000 * MS).unwrap();
        assert_eq!(first.sequence, 0);
        assert!(first.is_full());
        assert!(first.backfilled.is_empty());
        assert!(!sync.is_priming());
        assert_eq!(sync.next_sequence(), 1);
    }

    #[test]
    fn timeout_backfills_lagging_camera() {
        let mut sync = sync(&[30.0, 30.0], None);
        sync.add_frame(frame(0, 0, 0), None, 0).unwrap();
        sync.add_frame(frame(1, 0, 0), None, 0).unwrap();
        sync.poll_emit(0).unwrap();

        sync.add_frame(frame(0, 1, 33 * MS), None, 33 * MS).unwrap();
        assert!(sync.poll_emit(50 * MS).is_none());

        let payload = sync.poll_emit(67 * MS).unwrap();
        assert_eq!(payload.sequence, 1);
        assert!(payload.is_full());
        assert_eq!(payload.frame(1).unwrap().sequence, 0);
        assert_eq!(payload.backfilled, BTreeSet::from([1]));
        assert!(payload.has_event(LifecycleTag::TimedOut));

        // lagging camera keeps being reused
        sync.add_frame(frame(0, 2, 70 * MS), None, 70 * MS).unwrap();
        let payload = sync.poll_emit(110 * MS).unwrap();
        assert_eq!(payload.frame(1).unwrap().sequence, 0);
    }

    #[test]
    fn empty_payload_never_times_out() {
        let mut sync = sync(&[30.0], None);
        sync.add_frame(frame(0, 0, 0), None, 0).unwrap();
        sync.poll_emit(0).unwrap();
        assert!(sync.poll_emit(10_000 * MS).is_none());
    }

    #[test]
    fn emitted_payload_is_detached_from_the_next() {
        let mut sync = sync(&[30.0, 30.0], None);
        sync.add_frame(frame(0, 0, 0), None, 0).unwrap();
        sync.add_frame(frame(1, 0, 0), None, 0).unwrap();
        let first = sync.poll_emit(0).unwrap();

        sync.add_frame(frame(0, 1, 10 * MS), None, 10 * MS).unwrap();
        assert_eq!(first.frame(0).unwrap().sequence, 0);
        assert_eq!(sync.current().frame(0).unwrap().sequence, 1);
        assert_eq!(sync.current().camera_ids().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn staleness_bound_reports_missing() {
        let mut sync = sync(&[30.0, 30.0], Some(Duration::from_millis(100)));
        sync.add_frame(frame(0, 0, 0), None, 0).unwrap();
        sync.add_frame(frame(1, 0, 0), None, 0).unwrap();
        sync.poll_emit(0).unwrap();

        sync.add_frame(frame(0, 1, 50 * MS), None, 50 * MS).unwrap();
        let payload = sync.poll_emit(90 * MS).unwrap();
        assert_eq!(payload.backfilled, BTreeSet::from([1]));

        sync.add_frame(frame(0, 2, 150 * MS), None, 150 * MS).unwrap();
        let payload = sync.poll_emit(190 * MS).unwrap();
        assert!(payload.frame(1).is_none());
        assert_eq!(payload.missing, BTreeSet::from([1]));
    }

    #[test]
    fn thirty_and_fifteen_fps_emit_at_the_slower_rate() {
        let mut sync = sync(&[30.0, 15.0], None);
        let fast = 1_000_000_000 / 30;
        let slow = 1_000_000_000 / 15;
        let end = 2_000 * MS;

        let (mut next_fast, mut next_slow) = (0u64, 0u64);
        let (mut seq_fast, mut seq_slow) = (0u64, 0u64);
        let mut emitted = Vec::new();
        let mut now = 0;
        while now < end {
            if now >= next_fast {
                sync.add_frame(frame(0, seq_fast, now), None, now).unwrap();
                seq_fast += 1;
                next_fast += fast;
            }
            if now >= next_slow {
                sync.add_frame(frame(1, seq_slow, now), None, now).unwrap();
                seq_slow += 1;
                next_slow += slow;
            }
            if let Some(payload) = sync.poll_emit(now) {
                emitted.push(payload);
            }
            now += MS;
        }

        assert!((29..=31).contains(&emitted.len()), "{}", emitted.len());
        for payload in &emitted {
            assert!(payload.is_full());
            assert!(!payload.backfilled.contains(&1));
        }
        let sequences = emitted.iter().map(|p| p.sequence).collect::<Vec<_>>();
        assert_eq!(sequences, (0..emitted.len() as u64).collect::<Vec<_>>());
        let fps = sync.observed_framerate().unwrap();
        assert!((fps - 15.0).abs() < 1.0, "{fps}");
    }

    #[test]
    fn unusable_framerate_is_rejected_up_front() {
        let configs: CameraConfigs = [(0, CameraConfig::new(0).with_framerate(1e-30))].into();
        assert!(matches!(
            FrameSynchronizer::new(&configs, None, 16),
            Err(ConfigError::InvalidFramerate { camera_id: 0, .. })
        ));
    }

    #[test]
    fn update_configs_changes_period_but_not_cameras() {
        let mut sync = sync(&[30.0, 30.0], None);
        let mut configs: CameraConfigs = (0..2)
            .map(|i| (i, CameraConfig::new(i).with_framerate(10.0)))
            .collect();
        sync.update_configs(&configs).unwrap();
        assert_eq!(sync.ideal_frame_period(), Duration::from_secs_f64(0.1));

        configs.insert(2, CameraConfig::new(2));
        assert!(matches!(
            sync.update_configs(&configs),
            Err(ConfigError::UnknownCamera(2))
        ));
    }
}
