//! Frame sinks: where filled buffers go once a frame is recorded.
//!
//! The camera loops hand every frame to a [`FrameSink`] exactly once, in increasing
//! index order, and reuse the buffer on a later cycle. A sink therefore has to copy
//! or persist the pixels before returning.
//!
//! # File naming
//!
//! [`RawFileSink`] names files `C_K_YYYYMMDD_RUN_ROT_POS_0.raw` with a JSON sidecar of
//! the same stem, where
//!
//! - `C` is the camera number (1 = master),
//! - `K` the exposure kind code,
//! - `YYYYMMDD` the observing night (dates roll over at local noon),
//! - `RUN` one more than the highest run already in the directory for that night,
//! - `ROT`/`POS` the rotation number and position within the rotation.

use crate::data::metadata::{ExposureKind, FrameRecord};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDate, TimeZone};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Suffix shared by every frame file of a run.
const FILE_SUFFIX: &str = "_0.raw";

/// Consumer of recorded frames.
#[async_trait]
pub trait FrameSink: Send {
    /// Persist one frame. `image` is only valid for the duration of the call.
    async fn write_frame(&mut self, image: &[u8], record: &FrameRecord) -> AppResult<()>;

    /// Flush anything buffered. Called once after the last frame.
    async fn finish(&mut self) -> AppResult<()> {
        Ok(())
    }
}

#[async_trait]
impl<T: FrameSink + ?Sized> FrameSink for Box<T> {
    async fn write_frame(&mut self, image: &[u8], record: &FrameRecord) -> AppResult<()> {
        (**self).write_frame(image, record).await
    }

    async fn finish(&mut self) -> AppResult<()> {
        (**self).finish().await
    }
}

// ============================================================================
// In-memory sink
// ============================================================================

/// Keeps frame records, and optionally pixel copies, in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    keep_pixels: bool,
    records: Vec<FrameRecord>,
    images: Vec<Vec<u8>>,
}

impl MemorySink {
    /// Record metadata only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record metadata and a copy of every image.
    pub fn with_pixels() -> Self {
        Self {
            keep_pixels: true,
            ..Self::default()
        }
    }

    /// Records received so far.
    pub fn records(&self) -> &[FrameRecord] {
        &self.records
    }

    /// Image copies received so far; empty unless built with [`Self::with_pixels`].
    pub fn images(&self) -> &[Vec<u8>] {
        &self.images
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn write_frame(&mut self, image: &[u8], record: &FrameRecord) -> AppResult<()> {
        if let Some(last) = self.records.last() {
            if record.index <= last.index {
                return Err(DaqError::Storage(format!(
                    "frame {} after frame {}",
                    record.index, last.index
                )));
            }
        }
        if self.keep_pixels {
            self.images.push(image.to_vec());
        }
        self.records.push(record.clone());
        Ok(())
    }
}

// ============================================================================
// Raw file sink
// ============================================================================

/// Observing night of `now`: the date on which the night began.
pub fn observing_night<Tz: TimeZone>(now: &DateTime<Tz>) -> NaiveDate {
    (now.naive_local() - ChronoDuration::hours(12)).date()
}

/// Next free run number for camera `camera` on `night` in `dir`.
///
/// Scans for `C_?_YYYYMMDD_RUN_*_0.raw` and returns one past the highest run.
///
/// # Errors
/// Returns [`DaqError::Io`] if the directory cannot be read.
pub fn next_run(dir: &Path, camera: u8, night: NaiveDate) -> AppResult<u32> {
    let prefix = format!("{camera}_");
    let date = night.format("%Y%m%d").to_string();
    let mut highest = 0;
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(&prefix) || !name.ends_with(FILE_SUFFIX) {
            continue;
        }
        let mut fields = name.split('_');
        // camera, kind, date, run
        let (_, _, day, run) = (fields.next(), fields.next(), fields.next(), fields.next());
        if day != Some(date.as_str()) {
            continue;
        }
        if let Some(run) = run.and_then(|r| r.parse::<u32>().ok()) {
            highest = highest.max(run);
        }
    }
    Ok(highest + 1)
}

/// Writes raw pixel files plus a JSON sidecar per frame.
#[derive(Debug)]
pub struct RawFileSink {
    dir: PathBuf,
    camera: u8,
    kind: ExposureKind,
    night: NaiveDate,
    run: u32,
    written: usize,
}

impl RawFileSink {
    /// Start a new run in `dir` for camera number `camera` (1-based).
    ///
    /// Creates `dir` if needed and picks the next free run number for tonight.
    ///
    /// # Errors
    /// Returns [`DaqError::Io`] if the directory cannot be created or scanned.
    pub fn create(dir: &Path, camera: u8, kind: ExposureKind) -> AppResult<Self> {
        std::fs::create_dir_all(dir)?;
        let night = observing_night(&Local::now());
        let run = next_run(dir, camera, night)?;
        info!(dir = %dir.display(), camera, %kind, %night, run, "raw file sink ready");
        Ok(Self {
            dir: dir.to_path_buf(),
            camera,
            kind,
            night,
            run,
            written: 0,
        })
    }

    /// Run number of this sink.
    pub fn run(&self) -> u32 {
        self.run
    }

    /// Frames written so far.
    pub fn written(&self) -> usize {
        self.written
    }

    /// File stem for `record`.
    pub fn stem(&self, record: &FrameRecord) -> String {
        format!(
            "{}_{}_{}_{}_{}_{}",
            self.camera,
            self.kind.code(),
            self.night.format("%Y%m%d"),
            self.run,
            record.rotation,
            record.position
        )
    }
}

#[async_trait]
impl FrameSink for RawFileSink {
    async fn write_frame(&mut self, image: &[u8], record: &FrameRecord) -> AppResult<()> {
        let stem = self.stem(record);
        let raw = self.dir.join(format!("{stem}{FILE_SUFFIX}"));
        let sidecar = self.dir.join(format!("{stem}_0.json"));

        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| DaqError::Storage(format!("failed to encode {stem}: {e}")))?;
        tokio::fs::write(&raw, image)
            .await
            .map_err(|e| DaqError::Storage(format!("failed to write {}: {e}", raw.display())))?;
        tokio::fs::write(&sidecar, json).await.map_err(|e| {
            DaqError::Storage(format!("failed to write {}: {e}", sidecar.display()))
        })?;

        self.written += 1;
        debug!(file = %raw.display(), bytes = image.len(), "frame written");
        Ok(())
    }

    async fn finish(&mut self) -> AppResult<()> {
        info!(run = self.run, frames = self.written, "run complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDateTime, Utc};
    use tempfile::tempdir;

    fn record(index: usize) -> FrameRecord {
        let now = Utc::now();
        FrameRecord {
            camera: 0,
            kind: ExposureKind::Expose,
            index,
            rotation: 1 + index / 8,
            position: 1 + index % 8,
            requested_angle: 45.0 * index as f64,
            requested_wrapped: 0.0,
            end_angle: 0.0,
            arc: 45.0,
            ticks: Some(1),
            clock_delta: 0.0,
            exposure: 0.45,
            slot: index % 8,
            started: now,
            finished: now,
        }
    }

    #[test]
    fn night_rolls_over_at_noon() {
        let morning = NaiveDateTime::parse_from_str("2024-03-01 11:59:00", "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc();
        let evening = NaiveDateTime::parse_from_str("2024-03-01 12:00:00", "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc();
        assert_eq!(observing_night(&morning).to_string(), "2024-02-29");
        assert_eq!(observing_night(&evening).to_string(), "2024-03-01");
    }

    #[test]
    fn run_number_follows_existing_files() {
        let dir = tempdir().unwrap();
        let night = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(next_run(dir.path(), 1, night).unwrap(), 1);
        for name in [
            "1_e_20240301_3_1_1_0.raw",
            "1_b_20240301_7_2_4_0.raw",
            "2_e_20240301_9_1_1_0.raw",
            "1_e_20240229_12_1_1_0.raw",
            "1_e_20240301_11_1_1_0.json",
        ] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        assert_eq!(next_run(dir.path(), 1, night).unwrap(), 8);
        assert_eq!(next_run(dir.path(), 2, night).unwrap(), 10);
    }

    #[tokio::test]
    async fn raw_sink_writes_pixels_and_sidecar() {
        let dir = tempdir().unwrap();
        let mut sink = RawFileSink::create(dir.path(), 1, ExposureKind::Expose).unwrap();
        let rec = record(9);
        sink.write_frame(&[1, 2, 3, 4], &rec).await.unwrap();
        sink.finish().await.unwrap();

        let stem = sink.stem(&rec);
        assert!(stem.ends_with("_2_2"));
        let raw = std::fs::read(dir.path().join(format!("{stem}_0.raw"))).unwrap();
        assert_eq!(raw, vec![1, 2, 3, 4]);
        let json = std::fs::read_to_string(dir.path().join(format!("{stem}_0.json"))).unwrap();
        let back: FrameRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.index, 9);
        assert_eq!(sink.written(), 1);
    }

    #[tokio::test]
    async fn memory_sink_rejects_out_of_order_frames() {
        let mut sink = MemorySink::with_pixels();
        sink.write_frame(&[7], &record(0)).await.unwrap();
        sink.write_frame(&[8], &record(1)).await.unwrap();
        assert!(sink.write_frame(&[9], &record(1)).await.is_err());
        assert_eq!(sink.records().len(), 2);
        assert_eq!(sink.images(), &[vec![7], vec![8]]);
    }
}
