//! Detection and location exports.
//!
//! The detection export is a CSV of `label,frame` rows with a header line.
//! The location export is a JSON object keyed by frame index, each value the
//! list of detections found in that frame.

use crate::{
    error::ExportError,
    pipeline::aggregator::{DetectionIndex, LocationMap},
};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

#[derive(Serialize)]
struct DetectionRow<'a> {
    label: &'a str,
    frame: u64,
}

#[derive(Deserialize)]
struct OwnedDetectionRow {
    label: String,
    frame: u64,
}

pub fn write_detections<W: Write>(writer: W, index: &DetectionIndex) -> Result<(), ExportError> {
    let mut csv = csv::Writer::from_writer(writer);
    // An empty index still gets its header row.
    if index.is_empty() {
        csv.write_record(["label", "frame"])?;
    }
    for (label, frame) in index {
        csv.serialize(DetectionRow {
            label,
            frame: *frame,
        })?;
    }
    csv.flush()?;
    Ok(())
}

pub fn read_detections<R: Read>(reader: R) -> Result<DetectionIndex, ExportError> {
    let mut csv = csv::Reader::from_reader(reader);
    let mut index = DetectionIndex::new();
    for row in csv.deserialize() {
        let row: OwnedDetectionRow = row?;
        index.entry(row.label).or_insert(row.frame);
    }
    Ok(index)
}

pub fn write_locations<W: Write>(writer: W, locations: &LocationMap) -> Result<(), ExportError> {
    let mut writer = BufWriter::new(writer);
    serde_json::to_writer_pretty(&mut writer, locations)?;
    writer.flush()?;
    Ok(())
}

pub fn read_locations<R: Read>(reader: R) -> Result<LocationMap, ExportError> {
    let locations: LocationMap = serde_json::from_reader(reader)?;
    Ok(locations)
}

/// Persistence collaborator called at each progress checkpoint and once at
/// the end of a run. Failures are reported, never fatal to the run.
///
/// Calls may block; the coordinator makes them on the blocking thread pool
/// and never has more than one checkpoint in flight.
pub trait ResultSink: Send + Sync {
    fn checkpoint(&self, index: &DetectionIndex, locations: &LocationMap)
        -> Result<(), ExportError>;

    fn finalize(&self, index: &DetectionIndex, locations: &LocationMap) -> Result<(), ExportError>;
}

/// Writes both exports into one directory. Every file is written to a
/// uniquely named temporary sibling and persisted over the target, so
/// readers never see a half written export. A failed write removes its
/// temporary file.
#[derive(Debug, Clone)]
pub struct FileExporter {
    dir: PathBuf,
}

impl FileExporter {
    pub const DETECTIONS: &'static str = "detections.csv";
    pub const LOCATIONS: &'static str = "locations.json";
    pub const DETECTIONS_CHECKPOINT: &'static str = "detections_checkpoint.csv";
    pub const LOCATIONS_CHECKPOINT: &'static str = "locations_checkpoint.json";

    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ExportError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_pair(
        &self,
        detections_name: &str,
        locations_name: &str,
        index: &DetectionIndex,
        locations: &LocationMap,
    ) -> Result<(), ExportError> {
        self.replace(detections_name, |file| write_detections(file, index))?;
        self.replace(locations_name, |file| write_locations(file, locations))?;
        debug!(
            "Exported {} labels and {} frames to {}",
            index.len(),
            locations.len(),
            self.dir.display()
        );
        Ok(())
    }

    fn replace(
        &self,
        name: &str,
        write: impl FnOnce(&mut File) -> Result<(), ExportError>,
    ) -> Result<(), ExportError> {
        let mut staging = NamedTempFile::new_in(&self.dir)?;
        write(staging.as_file_mut())?;
        staging.as_file().sync_all()?;
        staging
            .persist(self.dir.join(name))
            .map_err(|e| ExportError::Io(e.error))?;
        Ok(())
    }
}

impl ResultSink for FileExporter {
    fn checkpoint(
        &self,
        index: &DetectionIndex,
        locations: &LocationMap,
    ) -> Result<(), ExportError> {
        self.write_pair(
            Self::DETECTIONS_CHECKPOINT,
            Self::LOCATIONS_CHECKPOINT,
            index,
            locations,
        )
    }

    fn finalize(&self, index: &DetectionIndex, locations: &LocationMap) -> Result<(), ExportError> {
        self.write_pair(Self::DETECTIONS, Self::LOCATIONS, index, locations)
    }
}
