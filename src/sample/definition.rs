//! The per-sample work item.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Length of the accession prefix used as the shard directory name.
const SHARD_PREFIX_LEN: usize = 7;

/// One SRA sample to be processed by the pipeline.
///
/// Samples are created by the definition loader, handed to exactly one
/// download worker, and carried stage to stage by value. The output
/// directory is derived deterministically from the accession, so reprocessing
/// a sample always lands in the same place.
///
/// Samples are serializable so they can be pushed through the shared Redis
/// list in multi-node runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// SRA accession (e.g. "SRR14093730").
    pub id: String,
    /// 1-based line number in the definitions file.
    ///
    /// Indices are assigned before any filtering, so a given sample keeps
    /// the same index across resumed runs.
    pub run_index: usize,
    /// Sharded output directory: `<base>/<prefix>/<accession>`.
    out_dir: PathBuf,
}

impl Sample {
    /// Creates a sample, deriving its output directory under `base_dir`.
    pub fn new(id: impl Into<String>, run_index: usize, base_dir: &Path) -> Self {
        let id = id.into();
        let prefix = &id[..id.len().min(SHARD_PREFIX_LEN)];
        let out_dir = base_dir.join(prefix).join(&id);
        Self {
            id,
            run_index,
            out_dir,
        }
    }

    /// The sample's output directory.
    pub fn output_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Creates the output directory (and shard parent) if needed.
    pub fn create_output_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.out_dir)
    }

    /// Path of a per-sample artifact `<accession>.<suffix>` in the output
    /// directory.
    pub fn artifact(&self, suffix: &str) -> PathBuf {
        self.out_dir.join(format!("{}.{}", self.id, suffix))
    }

    /// Path of the final annotated artifact (`<accession>.gto`).
    pub fn terminal_artifact(&self) -> PathBuf {
        self.artifact("gto")
    }

    /// Whether the final artifact already exists on disk.
    pub fn has_terminal_artifact(&self) -> bool {
        self.terminal_artifact().exists()
    }

    /// Scratch directory holding this sample's downloaded fastq files,
    /// keyed by run index.
    pub fn fastq_dir(&self, scratch_dir: &Path) -> PathBuf {
        scratch_dir.join(format!("task-{}", self.run_index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sharded_output_dir() {
        let s = Sample::new("SRR14093730", 5, Path::new("/out"));
        assert_eq!(s.output_dir(), Path::new("/out/SRR1409/SRR14093730"));
        assert_eq!(s.run_index, 5);
    }

    #[test]
    fn test_short_accession_shard() {
        let s = Sample::new("SRR1", 1, Path::new("/out"));
        assert_eq!(s.output_dir(), Path::new("/out/SRR1/SRR1"));
    }

    #[test]
    fn test_artifact_paths() {
        let s = Sample::new("SRR14093730", 1, Path::new("/out"));
        assert_eq!(
            s.terminal_artifact(),
            Path::new("/out/SRR1409/SRR14093730/SRR14093730.gto")
        );
        assert_eq!(
            s.artifact("raw.gto"),
            Path::new("/out/SRR1409/SRR14093730/SRR14093730.raw.gto")
        );
    }

    #[test]
    fn test_fastq_dir_uses_run_index() {
        let s = Sample::new("SRR14093730", 42, Path::new("/out"));
        assert_eq!(s.fastq_dir(Path::new("/scratch")), Path::new("/scratch/task-42"));
    }

    #[test]
    fn test_deterministic_derivation() {
        let a = Sample::new("ERR123456789", 7, Path::new("/base"));
        let b = Sample::new("ERR123456789", 7, Path::new("/base"));
        assert_eq!(a, b);
        assert_eq!(a.output_dir(), b.output_dir());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let s = Sample::new("SRR14093730", 3, Path::new("/out"));
        let json = serde_json::to_string(&s).expect("serialization should work");
        let parsed: Sample = serde_json::from_str(&json).expect("deserialization should work");
        assert_eq!(parsed, s);
    }
}
