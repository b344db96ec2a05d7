//! Per-camera recording output: concatenated JPEG streams plus a
//! timestamps table.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::capture::config::{CameraConfigs, CameraId, FourCc};
use crate::capture::decoder::encode_jpeg;
use crate::error::RecordingError;
use crate::pipeline::payload::MultiFramePayload;

pub const TIMESTAMPS_FILE: &str = "timestamps.csv";
const TIMESTAMPS_HEADER: &str =
    "multi_frame_sequence,camera_id,frame_sequence,timestamp_ns,wall_clock_ns,backfilled";

pub fn video_file_name(camera_id: CameraId) -> String {
    format!("camera_{camera_id}.mjpeg")
}

/// What a finished session wrote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingSummary {
    pub folder: PathBuf,
    pub records: u64,
    pub frames: BTreeMap<CameraId, u64>,
}

struct VideoFile {
    path: PathBuf,
    out: BufWriter<File>,
    frames: u64,
}

pub struct RecordingSession {
    folder: PathBuf,
    videos: BTreeMap<CameraId, VideoFile>,
    timestamps: BufWriter<File>,
    jpeg_quality: u8,
    records: u64,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> RecordingError + '_ {
    move |source| RecordingError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl RecordingSession {
    pub fn create(
        folder: &Path,
        configs: &CameraConfigs,
        jpeg_quality: u8,
    ) -> Result<Self, RecordingError> {
        fs::create_dir_all(folder).map_err(io_error(folder))?;

        let mut videos = BTreeMap::new();
        for (camera_id, config) in configs {
            if config.writer_fourcc != FourCc::MJPG {
                warn!(
                    "Camera {camera_id}: writer codec {} not supported, recording MJPG",
                    config.writer_fourcc
                );
            }
            let path = folder.join(video_file_name(*camera_id));
            let file = File::create(&path).map_err(io_error(&path))?;
            videos.insert(
                *camera_id,
                VideoFile {
                    path,
                    out: BufWriter::new(file),
                    frames: 0,
                },
            );
        }

        let path = folder.join(TIMESTAMPS_FILE);
        let file = File::create(&path).map_err(io_error(&path))?;
        let mut timestamps = BufWriter::new(file);
        writeln!(timestamps, "{TIMESTAMPS_HEADER}").map_err(io_error(&path))?;

        debug!("Recording session opened in {}", folder.display());
        Ok(Self {
            folder: folder.to_path_buf(),
            videos,
            timestamps,
            jpeg_quality,
            records: 0,
        })
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn write(&mut self, payload: &MultiFramePayload) -> Result<(), RecordingError> {
        for (camera_id, frame) in &payload.frames {
            let Some(frame) = frame else {
                continue;
            };
            let Some(video) = self.videos.get_mut(camera_id) else {
                warn!("Camera {camera_id} not part of this recording, frame skipped");
                continue;
            };
            let jpeg = encode_jpeg(&frame.image, self.jpeg_quality)?;
            video.out.write_all(&jpeg).map_err(io_error(&video.path))?;
            video.frames += 1;

            writeln!(
                self.timestamps,
                "{},{},{},{},{},{}",
                payload.sequence,
                camera_id,
                frame.sequence,
                frame.timestamp_ns,
                payload.time_base.to_wall_ns(frame.timestamp_ns),
                u8::from(payload.backfilled.contains(camera_id)),
            )
            .map_err(io_error(&self.folder.join(TIMESTAMPS_FILE)))?;
        }
        self.records += 1;
        metrics::counter!("polycam_records_written").increment(1);
        Ok(())
    }

    /// Flush everything to disk
    pub fn finish(mut self) -> Result<RecordingSummary, RecordingError> {
        let mut frames = BTreeMap::new();
        for (camera_id, video) in &mut self.videos {
            video.out.flush().map_err(io_error(&video.path))?;
            frames.insert(*camera_id, video.frames);
        }
        let path = self.folder.join(TIMESTAMPS_FILE);
        self.timestamps.flush().map_err(io_error(&path))?;
        Ok(RecordingSummary {
            folder: self.folder,
            records: self.records,
            frames,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::config::CameraConfig;
    use crate::pipeline::payload::tests::frame;

    #[test]
    fn writes_one_row_per_camera_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let configs: CameraConfigs = (0..2).map(|i| (i, CameraConfig::new(i))).collect();
        let mut session = RecordingSession::create(dir.path(), &configs, 80).unwrap();

        let mut previous = MultiFramePayload::create([0, 1], 0);
        previous.add_frame(frame(0, 0, 10), None, 10).unwrap();
        previous.add_frame(frame(1, 0, 10), None, 10).unwrap();
        session.write(&previous).unwrap();

        let mut next = MultiFramePayload::from_previous(&previous);
        next.add_frame(frame(0, 1, 20), None, 20).unwrap();
        next.backfill_from(&previous, 30, None);
        session.write(&next).unwrap();

        let summary = session.finish().unwrap();
        assert_eq!(summary.records, 2);
        assert_eq!(summary.frames, BTreeMap::from([(0, 2), (1, 2)]));

        let csv = fs::read_to_string(dir.path().join(TIMESTAMPS_FILE)).unwrap();
        let lines = csv.lines().collect::<Vec<_>>();
        assert_eq!(lines[0], TIMESTAMPS_HEADER);
        assert_eq!(lines.len(), 5);
        assert!(lines[4].starts_with("1,1,0,10,"));
        assert!(lines[4].ends_with(",1"));

        let video = fs::read(dir.path().join(video_file_name(0))).unwrap();
        assert_eq!(&video[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn unwritable_folder_fails() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let configs: CameraConfigs = [(0, CameraConfig::new(0))].into();
        let result = RecordingSession::create(&blocker.join("sub"), &configs, 80);
        assert!(matches!(result, Err(RecordingError::Io { .. })));
    }
}
