//! Definition-file loader with resume support.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use super::Sample;

/// Errors that can occur while loading sample definitions.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The definitions file could not be opened or read.
    #[error("cannot read sample definitions from {path}: {source}")]
    DefinitionFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A contiguous slice of the definitions file assigned to one array task.
///
/// Task T (1-based, from `SLURM_ARRAY_TASK_ID`) with offset J and E entries
/// per job processes run indices `J + (T-1)*E + 1 ..= J + T*E`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    /// Base offset into the definitions file.
    pub offset: usize,
    /// Number of entries each array task processes.
    pub per_job: usize,
    /// 1-based array task index.
    pub task_index: usize,
}

impl Partition {
    /// The inclusive range of run indices this partition selects.
    pub fn range(&self) -> RangeInclusive<usize> {
        let start = self.offset + (self.task_index.saturating_sub(1)) * self.per_job + 1;
        start..=start + self.per_job - 1
    }

    /// Whether the given run index falls inside this partition.
    pub fn contains(&self, run_index: usize) -> bool {
        self.range().contains(&run_index)
    }
}

/// Loads samples from a newline-delimited, tab-separated definitions file.
///
/// The accession is the first column of each line. Data lines are assigned
/// sequential 1-based run indices in file order (blank lines are ignored).
/// Samples outside the optional partition, and samples whose terminal
/// artifact already exists under `base_dir`, are excluded. The returned
/// order preserves file order.
pub fn load_definitions(
    def_file: &Path,
    base_dir: &Path,
    partition: Option<&Partition>,
) -> Result<Vec<Sample>, LoadError> {
    let fh = File::open(def_file).map_err(|source| LoadError::DefinitionFile {
        path: def_file.to_path_buf(),
        source,
    })?;

    let mut defs = Vec::new();
    let mut idx = 0usize;

    for line in BufReader::new(fh).lines() {
        let line = line.map_err(|source| LoadError::DefinitionFile {
            path: def_file.to_path_buf(),
            source,
        })?;

        let id = match line.split('\t').next().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => continue,
        };
        idx += 1;

        if let Some(p) = partition {
            if !p.contains(idx) {
                continue;
            }
        }

        let sample = Sample::new(id, idx, base_dir);
        if sample.has_terminal_artifact() {
            debug!(sample = %sample.id, run_index = idx, "terminal artifact exists, skipping");
            continue;
        }
        defs.push(sample);
    }

    Ok(defs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_defs(dir: &Path, lines: &[&str]) -> PathBuf {
        let path = dir.join("sra-defs.tsv");
        fs::write(&path, lines.join("\n")).expect("write defs");
        path
    }

    #[test]
    fn test_load_assigns_sequential_indices() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let defs = write_defs(
            tmp.path(),
            &["SRR0000001\tmeta", "SRR0000002\tmeta", "SRR0000003"],
        );

        let samples = load_definitions(&defs, tmp.path(), None).expect("load");
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].id, "SRR0000001");
        assert_eq!(samples[0].run_index, 1);
        assert_eq!(samples[2].run_index, 3);
    }

    #[test]
    fn test_load_skips_completed_samples() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let defs = write_defs(tmp.path(), &["SRR0000001", "SRR0000002"]);

        // Mark the first sample done by creating its terminal artifact.
        let done = Sample::new("SRR0000001", 1, tmp.path());
        done.create_output_dir().expect("mkdir");
        fs::write(done.terminal_artifact(), b"gto").expect("write gto");

        let samples = load_definitions(&defs, tmp.path(), None).expect("load");
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].id, "SRR0000002");
        // Index is preserved even though an earlier line was skipped.
        assert_eq!(samples[0].run_index, 2);
    }

    #[test]
    fn test_load_applies_partition() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let lines: Vec<String> = (1..=10).map(|i| format!("SRR{:07}", i)).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let defs = write_defs(tmp.path(), &refs);

        // Task 2 of per_job=3, offset 0 selects indices 4..=6.
        let partition = Partition {
            offset: 0,
            per_job: 3,
            task_index: 2,
        };
        let samples = load_definitions(&defs, tmp.path(), Some(&partition)).expect("load");
        let indices: Vec<usize> = samples.iter().map(|s| s.run_index).collect();
        assert_eq!(indices, vec![4, 5, 6]);
    }

    #[test]
    fn test_partition_range_with_offset() {
        let partition = Partition {
            offset: 100,
            per_job: 50,
            task_index: 3,
        };
        assert_eq!(partition.range(), 201..=250);
        assert!(partition.contains(201));
        assert!(partition.contains(250));
        assert!(!partition.contains(200));
        assert!(!partition.contains(251));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let err = load_definitions(&tmp.path().join("nope.tsv"), tmp.path(), None)
            .expect_err("should fail");
        assert!(err.to_string().contains("nope.tsv"));
    }

    #[test]
    fn test_load_skips_blank_lines() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let defs = write_defs(tmp.path(), &["SRR0000001", "", "SRR0000002"]);

        let samples = load_definitions(&defs, tmp.path(), None).expect("load");
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].run_index, 2);
    }
}
