//! Thread-strategy camera groups driven through the controller

use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use polycam::capture::CameraConfig;
use polycam::error::TransportError;
use polycam::ipc::unpack;
use polycam::pipeline::{MultiFramePayload, RelaySink};
use polycam::recording::writer::TIMESTAMPS_FILE;
use polycam::{CameraConfigs, CameraGroupController, Config};

fn group(rates: &[f64]) -> CameraConfigs {
    rates
        .iter()
        .enumerate()
        .map(|(i, rate)| {
            let id = i as u32;
            (id, CameraConfig::new(id).with_resolution(64, 48).with_framerate(*rate))
        })
        .collect()
}

fn controller() -> CameraGroupController {
    let mut config = Config::default();
    config.pipeline.idle_sleep_us = 200;
    CameraGroupController::new(config)
}

/// Relay consumer that takes one payload every `delay`
struct SlowSink {
    delay: Duration,
    received: Vec<MultiFramePayload>,
}

impl RelaySink for SlowSink {
    fn send(&mut self, payload: Bytes) -> Result<(), TransportError> {
        self.received.push(unpack(payload)?);
        thread::sleep(self.delay);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn equal_framerates_emit_at_group_rate() {
    let mut controller = controller();
    controller.connect(group(&[30.0, 30.0])).await.unwrap();
    let start = controller.stats().unwrap().payloads_emitted;
    tokio::time::sleep(Duration::from_secs(2)).await;
    let stats = controller.stats().unwrap();
    controller.close().await.unwrap();

    let emitted = stats.payloads_emitted - start;
    assert!((50..=70).contains(&emitted), "{emitted} payloads in 2s");
    assert_eq!(stats.frames_corrupted, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn mixed_framerates_follow_the_slowest_camera() {
    let mut controller = controller();
    controller.connect(group(&[30.0, 15.0])).await.unwrap();
    let relay = controller
        .attach_relay()
        .unwrap()
        .pump(SlowSink {
            delay: Duration::ZERO,
            received: Vec::new(),
        })
        .unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    let stats = controller.stats().unwrap();
    controller.close().await.unwrap();
    let sink = relay.join().unwrap();

    // 15 fps for 2s
    assert!(
        (27..=33).contains(&stats.payloads_emitted),
        "{} payloads",
        stats.payloads_emitted
    );
    assert_eq!(stats.missing_slots, 0);
    assert!(!sink.received.is_empty());
    for payload in &sink.received {
        assert!(payload.is_full(), "payload {} has an empty slot", payload.sequence);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn stopping_four_cameras_is_clean() {
    let mut controller = controller();
    controller.connect(group(&[30.0; 4])).await.unwrap();
    assert_eq!(controller.live_workers(), 4);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = Instant::now();
    let report = controller.close().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(report.clean, vec![0, 1, 2, 3]);
    assert!(report.forced.is_empty());
    assert_eq!(controller.live_workers(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn recording_drains_before_reporting_idle() {
    let dir = tempfile::tempdir().unwrap();
    let mut controller = controller();
    controller.connect(group(&[30.0, 30.0])).await.unwrap();
    controller.start_recording(dir.path()).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while controller.stats().unwrap().recorded < 50 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    controller.stop_recording().unwrap();
    controller
        .wait_recording_idle(Duration::from_secs(5))
        .unwrap();

    let flags = controller.recorder_flags().unwrap();
    assert!(!flags.is_recording);
    assert!(!flags.error);
    let recorded = controller.stats().unwrap().recorded;
    assert!(recorded >= 50);

    let csv = fs::read_to_string(dir.path().join(TIMESTAMPS_FILE)).unwrap();
    assert_eq!(csv.lines().count() as u64, 1 + recorded * 2);
    for camera_id in 0..2 {
        let video = fs::read(dir.path().join(format!("camera_{camera_id}.mjpeg"))).unwrap();
        assert_eq!(&video[..2], &[0xFF, 0xD8]);
    }
    controller.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_relay_does_not_slow_emission() {
    let mut controller = controller();
    controller.connect(group(&[30.0, 30.0])).await.unwrap();
    let relay = controller
        .attach_relay()
        .unwrap()
        .pump(SlowSink {
            delay: Duration::from_millis(500),
            received: Vec::new(),
        })
        .unwrap();

    let start = controller.stats().unwrap().payloads_emitted;
    tokio::time::sleep(Duration::from_secs(2)).await;
    let stats = controller.stats().unwrap();
    controller.close().await.unwrap();
    let sink = relay.join().unwrap();

    let emitted = stats.payloads_emitted - start;
    assert!((50..=70).contains(&emitted), "{emitted} payloads in 2s");
    assert!(sink.received.len() <= 7, "{}", sink.received.len());
    assert!(stats.relay_skipped > 40, "{}", stats.relay_skipped);
}
