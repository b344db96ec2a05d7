//! The aligned one-frame-per-camera record

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::capture::config::CameraId;
use crate::capture::frame::{FramePayload, SlotRef};
use crate::clock;
use crate::error::ConfigError;

/// Monotonic/wall clock pair captured when a payload is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBase {
    pub monotonic_ns: u64,
    pub wall_ns: u64,
}

impl TimeBase {
    pub fn now() -> Self {
        Self {
            monotonic_ns: clock::monotonic_ns(),
            wall_ns: clock::wall_clock_ns(),
        }
    }

    /// Map a monotonic timestamp onto the wall clock
    pub fn to_wall_ns(&self, monotonic_ns: u64) -> u64 {
        if monotonic_ns >= self.monotonic_ns {
            self.wall_ns.saturating_add(monotonic_ns - self.monotonic_ns)
        } else {
            self.wall_ns.saturating_sub(self.monotonic_ns - monotonic_ns)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleTag {
    Created,
    FrameAdded,
    /// Corrupted on hydration
    FrameRejected,
    /// A newer frame from the same camera replaced an unemitted one
    FrameSuperseded,
    Full,
    TimedOut,
    Backfilled,
    /// No usable frame, left empty
    Missing,
    Emitted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub tag: LifecycleTag,
    pub camera_id: Option<CameraId>,
    pub timestamp_ns: u64,
}

/// One synchronized instant across a camera group.
///
/// The camera-id key set is fixed at creation and carried unchanged into
/// every payload built with [`MultiFramePayload::from_previous`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiFramePayload {
    pub sequence: u64,
    pub frames: BTreeMap<CameraId, Option<FramePayload>>,
    /// Shared-buffer slot each fresh frame was read from
    pub slots: BTreeMap<CameraId, Option<SlotRef>>,
    pub backfilled: BTreeSet<CameraId>,
    pub missing: BTreeSet<CameraId>,
    pub time_base: TimeBase,
    pub events: Vec<LifecycleEvent>,
}

impl MultiFramePayload {
    pub fn create(camera_ids: impl IntoIterator<Item = CameraId>, sequence: u64) -> Self {
        let time_base = TimeBase::now();
        let frames: BTreeMap<_, _> = camera_ids.into_iter().map(|id| (id, None)).collect();
        let slots = frames.keys().map(|id| (*id, None)).collect();
        let mut payload = Self {
            sequence,
            frames,
            slots,
            backfilled: BTreeSet::new(),
            missing: BTreeSet::new(),
            time_base,
            events: Vec::new(),
        };
        payload.record(LifecycleTag::Created, None, time_base.monotonic_ns);
        payload
    }

    /// Next payload: same cameras, sequence + 1, fresh time base, empty slots
    pub fn from_previous(previous: &Self) -> Self {
        Self::create(previous.frames.keys().copied(), previous.sequence + 1)
    }

    pub fn camera_ids(&self) -> impl Iterator<Item = CameraId> + '_ {
        self.frames.keys().copied()
    }

    pub fn frame(&self, camera_id: CameraId) -> Option<&FramePayload> {
        self.frames.get(&camera_id).and_then(Option::as_ref)
    }

    pub fn is_full(&self) -> bool {
        self.frames.values().all(Option::is_some)
    }

    pub fn filled(&self) -> usize {
        self.frames.values().filter(|f| f.is_some()).count()
    }

    /// Capture timestamp of the oldest frame held, if any
    pub fn oldest_timestamp_ns(&self) -> Option<u64> {
        self.frames
            .values()
            .flatten()
            .map(|frame| frame.timestamp_ns)
            .min()
    }

    pub fn add_frame(
        &mut self,
        frame: FramePayload,
        slot: Option<SlotRef>,
        now_ns: u64,
    ) -> Result<(), ConfigError> {
        let camera_id = frame.camera_id;
        let entry = self
            .frames
            .get_mut(&camera_id)
            .ok_or(ConfigError::UnknownCamera(camera_id))?;
        let superseded = entry.replace(frame).is_some();
        self.slots.insert(camera_id, slot);
        self.backfilled.remove(&camera_id);
        self.missing.remove(&camera_id);

        if superseded {
            self.record(LifecycleTag::FrameSuperseded, Some(camera_id), now_ns);
        }
        self.record(LifecycleTag::FrameAdded, Some(camera_id), now_ns);
        if !superseded && self.is_full() {
            self.record(LifecycleTag::Full, None, now_ns);
        }
        Ok(())
    }

    /// A frame from `camera_id` arrived but could not be used
    pub fn reject_frame(&mut self, camera_id: CameraId, now_ns: u64) -> Result<(), ConfigError> {
        if !self.frames.contains_key(&camera_id) {
            return Err(ConfigError::UnknownCamera(camera_id));
        }
        self.record(LifecycleTag::FrameRejected, Some(camera_id), now_ns);
        Ok(())
    }

    /// Fill every empty slot from `previous`. Frames older than
    /// `max_staleness_ns` (relative to `now_ns`) are not reused and the
    /// camera is listed as missing instead.
    pub fn backfill_from(&mut self, previous: &Self, now_ns: u64, max_staleness_ns: Option<u64>) {
        let empty = self
            .frames
            .iter()
            .filter(|(_, frame)| frame.is_none())
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        for camera_id in empty {
            let reusable = previous.frame(camera_id).filter(|frame| {
                max_staleness_ns
                    .map_or(true, |bound| now_ns.saturating_sub(frame.timestamp_ns) <= bound)
            });
            match reusable {
                Some(frame) => {
                    self.frames.insert(camera_id, Some(frame.clone()));
                    self.backfilled.insert(camera_id);
                    self.record(LifecycleTag::Backfilled, Some(camera_id), now_ns);
                }
                None => {
                    self.missing.insert(camera_id);
                    self.record(LifecycleTag::Missing, Some(camera_id), now_ns);
                }
            }
        }
    }

    pub fn record(&mut self, tag: LifecycleTag, camera_id: Option<CameraId>, timestamp_ns: u64) {
        self.events.push(LifecycleEvent {
            tag,
            camera_id,
            timestamp_ns,
        });
    }

    pub fn has_event(&self, tag: LifecycleTag) -> bool {
        self.events.iter().any(|e| e.tag == tag)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::capture::frame::{PixelType, RawImage};

    pub(crate) fn frame(camera_id: CameraId, sequence: u64, timestamp_ns: u64) -> FramePayload {
        FramePayload {
            success: true,
            image: RawImage::from_pixels(2, 1, 1, PixelType::U8, Bytes::from_static(&[1, 2]))
                .unwrap(),
            timestamp_ns,
            sequence,
            camera_id,
            acquisition_ns: Some(1_000),
        }
    }

    #[test]
    fn fills_and_reports_full() {
        let mut payload = MultiFramePayload::create([0, 1], 0);
        assert!(!payload.is_full());
        assert_eq!(payload.oldest_timestamp_ns(), None);

        payload.add_frame(frame(0, 0, 50), None, 60).unwrap();
        payload.add_frame(frame(1, 0, 40), None, 70).unwrap();
        assert!(payload.is_full());
        assert!(payload.has_event(LifecycleTag::Full));
        assert_eq!(payload.oldest_timestamp_ns(), Some(40));
    }

    #[test]
    fn unknown_camera_is_rejected() {
        let mut payload = MultiFramePayload::create([0], 0);
        assert!(matches!(
            payload.add_frame(frame(9, 0, 1), None, 1),
            Err(ConfigError::UnknownCamera(9))
        ));
    }

    #[test]
    fn newer_frame_supersedes() {
        let mut payload = MultiFramePayload::create([0, 1], 0);
        payload.add_frame(frame(0, 0, 10), None, 10).unwrap();
        payload.add_frame(frame(0, 1, 20), None, 20).unwrap();
        assert_eq!(payload.frame(0).unwrap().sequence, 1);
        assert!(payload.has_event(LifecycleTag::FrameSuperseded));
    }

    #[test]
    fn from_previous_keeps_keys_and_bumps_sequence() {
        let mut first = MultiFramePayload::create([3, 5, 8], 7);
        first.add_frame(frame(5, 0, 1), None, 1).unwrap();
        let next = MultiFramePayload::from_previous(&first);
        assert_eq!(next.sequence, 8);
        assert_eq!(next.camera_ids().collect::<Vec<_>>(), vec![3, 5, 8]);
        assert_eq!(next.filled(), 0);
        assert!(first.frame(5).is_some());
    }

    #[test]
    fn backfill_reuses_previous_frames() {
        let mut previous = MultiFramePayload::create([0, 1], 0);
        previous.add_frame(frame(0, 0, 100), None, 100).unwrap();
        previous.add_frame(frame(1, 0, 100), None, 100).unwrap();

        let mut current = MultiFramePayload::from_previous(&previous);
        current.add_frame(frame(0, 1, 200), None, 200).unwrap();
        current.backfill_from(&previous, 250, None);

        assert!(current.is_full());
        assert_eq!(current.frame(1).unwrap().sequence, 0);
        assert_eq!(current.backfilled, BTreeSet::from([1]));
        assert!(current.missing.is_empty());
    }

    #[test]
    fn stale_frames_become_missing() {
        let mut previous = MultiFramePayload::create([0, 1], 0);
        previous.add_frame(frame(0, 0, 100), None, 100).unwrap();
        previous.add_frame(frame(1, 0, 100), None, 100).unwrap();

        let mut current = MultiFramePayload::from_previous(&previous);
        current.add_frame(frame(0, 1, 1_000), None, 1_000).unwrap();
        current.backfill_from(&previous, 1_000, Some(500));

        assert!(current.frame(1).is_none());
        assert_eq!(current.missing, BTreeSet::from([1]));
        assert!(current.has_event(LifecycleTag::Missing));
    }

    #[test]
    fn wall_clock_mapping() {
        let base = TimeBase {
            monotonic_ns: 1_000,
            wall_ns: 50_000,
        };
        assert_eq!(base.to_wall_ns(1_500), 50_500);
        assert_eq!(base.to_wall_ns(400), 49_400);
    }
}
