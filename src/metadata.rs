//! Per-sample metadata, timing files, and failure markers.
//!
//! Every stage leaves durable traces in the sample's output directory:
//! a tab-separated timing file, an optional failure marker, and the
//! consolidated `meta.json` written after assembly and rewritten after
//! annotation. The marker file is the sole durable signal that a stage
//! failed; a sample with neither a terminal artifact nor a marker was
//! interrupted mid-flight.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::context::RunContext;
use crate::sample::Sample;

/// Timing file name for the assembly stage.
pub const ASSEMBLE_TIMING_FILE: &str = "RUNTIME";
/// Timing file name for the annotation stage.
pub const ANNOTATE_TIMING_FILE: &str = "RUNTIME_ANNO";
/// Timing file name for the download stage.
pub const DOWNLOAD_TIMING_FILE: &str = "RUNTIME_DL";

/// Consolidated metadata file name.
pub const META_FILE: &str = "meta.json";

/// Errors that can occur while recording metadata.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Wall-clock start/end/elapsed of one stage, in epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub start: f64,
    pub end: f64,
    pub elapsed: f64,
}

impl StageTiming {
    /// Completes a timing that began at `start`.
    pub fn since(start: f64) -> Self {
        let end = unix_time();
        Self {
            start,
            end,
            elapsed: end - start,
        }
    }

    /// Writes this timing to `<dir>/<name>` as one `start\tend\telapsed`
    /// line.
    pub fn write(&self, dir: &Path, name: &str) -> Result<(), MetadataError> {
        let mut fh = File::create(dir.join(name))?;
        writeln!(fh, "{}\t{}\t{}", self.start, self.end, self.elapsed)?;
        Ok(())
    }
}

/// Current wall-clock time in epoch seconds.
pub fn unix_time() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// The consolidated per-sample record written to `meta.json`.
///
/// `start`/`end`/`elapsed` are the assembly stage (the historical layout
/// downstream tooling reads); download and annotation contribute their
/// elapsed seconds. The record is written after assembly and overwritten
/// after annotation, so the on-disk copy always reflects the most recently
/// completed stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub sra: String,
    pub run_index: usize,
    pub start: f64,
    pub end: f64,
    pub elapsed: f64,
    pub download_elapsed: Option<f64>,
    pub annotation_elapsed: Option<f64>,
    pub host: String,
    pub slurm_task: Option<String>,
    pub slurm_job: Option<String>,
    pub slurm_cluster: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_metadata: Option<serde_json::Value>,
}

impl MetadataRecord {
    /// Builds the record for a sample from its assembly timing and the run
    /// context.
    pub fn new(sample: &Sample, assembly: StageTiming, ctx: &RunContext) -> Self {
        Self {
            sra: sample.id.clone(),
            run_index: sample.run_index,
            start: assembly.start,
            end: assembly.end,
            elapsed: assembly.elapsed,
            download_elapsed: None,
            annotation_elapsed: None,
            host: ctx.host.clone(),
            slurm_task: ctx.slurm_task.clone(),
            slurm_job: ctx.slurm_job.clone(),
            slurm_cluster: ctx.slurm_cluster.clone(),
            container_metadata: ctx.container_metadata.clone(),
        }
    }

    /// Writes the record to `<dir>/meta.json`, replacing any earlier copy.
    pub fn write(&self, dir: &Path) -> Result<(), MetadataError> {
        let fh = File::create(dir.join(META_FILE))?;
        serde_json::to_writer_pretty(fh, self)?;
        Ok(())
    }
}

/// Writes a stage failure marker containing `message`.
///
/// Marker files (`download.failure`, `assembly.failure`,
/// `annotation.failure`) are the durable record of a failed stage.
pub fn write_failure_marker(path: &Path, message: &str) {
    let write = || -> std::io::Result<()> {
        let mut fh = File::create(path)?;
        writeln!(fh, "{message}")?;
        Ok(())
    };
    if let Err(e) = write() {
        warn!(path = %path.display(), error = %e, "cannot write failure marker");
    }
}

/// Removes a stale marker left by a previous attempt, if any.
pub fn clear_failure_marker(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "cannot remove stale failure marker");
        }
    }
}

/// Deletes transient files, ignoring ones already gone.
///
/// Used for downloaded fastq files after assembly and for the NCBI prefetch
/// cache after download, so scratch storage does not grow across a long run.
pub fn remove_transient<I>(paths: I)
where
    I: IntoIterator<Item = PathBuf>,
{
    for path in paths {
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "cannot delete transient file");
            }
        }
    }
}
