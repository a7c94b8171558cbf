//! The three pipeline stages: download, assemble, annotate.
//!
//! Each stage is a [`StageHandler`](crate::scheduler::StageHandler)
//! implementation that builds the external command line for one sample,
//! runs it through the injected executor with stdout/stderr captured to
//! per-stage log files, records timing, applies its failure policy, and
//! cleans up the transient inputs it owns. Tool failures never propagate:
//! they are written to disk as failure markers and either drop the sample
//! (download, assemble) or fall back to the pre-annotation artifact
//! (annotate).

pub mod annotate;
pub mod assemble;
pub mod download;

use std::path::PathBuf;

use crate::metadata::{MetadataRecord, StageTiming};
use crate::sample::Sample;

pub use annotate::AnnotateStage;
pub use assemble::AssembleStage;
pub use download::DownloadStage;

/// A sample with its downloaded reads, headed for assembly.
#[derive(Debug, Clone)]
pub struct Downloaded {
    pub sample: Sample,
    /// Fastq files in the sample's scratch directory, sorted; one file for
    /// unpaired runs, two for paired.
    pub fastq_files: Vec<PathBuf>,
    pub timing: StageTiming,
}

/// An assembled sample with its metadata record, headed for annotation.
#[derive(Debug, Clone)]
pub struct Assembled {
    pub sample: Sample,
    pub record: MetadataRecord,
}
