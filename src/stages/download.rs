//! Download stage: fetch reads for one sample.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::context::RunContext;
use crate::executor::{CommandExecutor, CommandLine, Redirection};
use crate::metadata::{
    clear_failure_marker, remove_transient, unix_time, write_failure_marker, StageTiming,
    DOWNLOAD_TIMING_FILE,
};
use crate::sample::Sample;
use crate::scheduler::StageHandler;

use super::Downloaded;

/// Default download tool.
pub const DEFAULT_DOWNLOAD_TOOL: &str = "p3-sra";

/// Marker file written when a download fails.
pub const DOWNLOAD_FAILURE_MARKER: &str = "download.failure";

/// Downloads one sample's reads into its scratch directory.
///
/// The tool also drops the sample's SRA metadata (`<accession>.json`,
/// `<accession>.xml`) into the output directory, where annotation picks it
/// up later. A failed download drops the sample from the pipeline; nothing
/// downstream sees it.
pub struct DownloadStage {
    ctx: Arc<RunContext>,
    executor: Arc<dyn CommandExecutor>,
    tool: String,
}

impl DownloadStage {
    pub fn new(ctx: Arc<RunContext>, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            ctx,
            executor,
            tool: DEFAULT_DOWNLOAD_TOOL.to_string(),
        }
    }

    /// Overrides the download tool name.
    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = tool.into();
        self
    }

    fn command(&self, sample: &Sample, fq_dir: &Path) -> CommandLine {
        CommandLine::new(&self.tool)
            .arg("--id")
            .arg(&sample.id)
            .arg("--out")
            .arg(fq_dir.to_string_lossy())
            .arg("--metadata-file")
            .arg(sample.artifact("json").to_string_lossy())
            .arg("--sra-metadata-file")
            .arg(sample.artifact("xml").to_string_lossy())
    }

    /// Deletes the `.sra` file the download tool leaves in the NCBI
    /// prefetch cache, so the cache does not grow across a long run.
    fn clean_prefetch_cache(&self, sample: &Sample) {
        if let Some(ncbi_dir) = &self.ctx.ncbi_dir {
            remove_transient([ncbi_dir.join("sra").join(format!("{}.sra", sample.id))]);
        }
    }
}

impl StageHandler for DownloadStage {
    type Input = Sample;
    type Output = Downloaded;

    fn name(&self) -> &'static str {
        "download"
    }

    fn process(&self, sample: Sample) -> Option<Downloaded> {
        let out_dir = sample.output_dir().to_path_buf();
        if let Err(e) = sample.create_output_dir() {
            error!(sample = %sample.id, error = %e, "cannot create output directory");
            return None;
        }

        let fq_dir = sample.fastq_dir(&self.ctx.scratch_dir);
        if let Err(e) = fs::create_dir_all(&fq_dir) {
            error!(sample = %sample.id, error = %e, "cannot create fastq scratch directory");
            return None;
        }

        let marker = out_dir.join(DOWNLOAD_FAILURE_MARKER);
        clear_failure_marker(&marker);

        debug!(sample = %sample.id, run_index = sample.run_index, "downloading");
        let cmd = self.command(&sample, &fq_dir);
        let logs = Redirection::truncate(&out_dir, "download");

        let start = unix_time();
        let code = match self.executor.run(&cmd, &logs, None) {
            Ok(code) => code,
            Err(e) => {
                error!(sample = %sample.id, error = %e, "download tool did not run");
                write_failure_marker(&marker, &format!("{} of {} did not run: {e}", self.tool, sample.id));
                self.clean_prefetch_cache(&sample);
                return None;
            }
        };
        let timing = StageTiming::since(start);
        if let Err(e) = timing.write(&out_dir, DOWNLOAD_TIMING_FILE) {
            warn!(sample = %sample.id, error = %e, "cannot write download timing file");
        }

        if code != 0 {
            warn!(sample = %sample.id, code, "download failed");
            write_failure_marker(
                &marker,
                &format!(
                    "Nonzero returncode {code} from {} download of {}",
                    self.tool, sample.id
                ),
            );
            self.clean_prefetch_cache(&sample);
            return None;
        }

        let fastq_files = match find_fastq_files(&fq_dir) {
            Ok(files) => files,
            Err(e) => {
                error!(sample = %sample.id, error = %e, "cannot scan fastq directory");
                write_failure_marker(
                    &marker,
                    &format!("cannot scan fastq directory for {}: {e}", sample.id),
                );
                self.clean_prefetch_cache(&sample);
                return None;
            }
        };
        debug!(sample = %sample.id, files = fastq_files.len(), "download complete");

        self.clean_prefetch_cache(&sample);
        Some(Downloaded {
            sample,
            fastq_files,
            timing,
        })
    }
}

/// Finds the sample's fastq files in its scratch directory, sorted.
///
/// A three-file layout (paired reads plus an unpaired leftover) keeps only
/// the `_1`/`_2` pair, matching what the assembler expects.
fn find_fastq_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "fastq"))
        .collect();

    if files.len() == 3 {
        files.retain(|p| {
            p.file_stem()
                .and_then(|s| s.to_str())
                .is_some_and(|s| s.ends_with("_1") || s.ends_with("_2"))
        });
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_find_fastq_files_sorted() {
        let tmp = tempfile::tempdir().expect("tempdir");
        for name in ["b_2.fastq", "b_1.fastq"] {
            fs::write(tmp.path().join(name), b"@r").expect("write");
        }
        fs::write(tmp.path().join("notes.txt"), b"x").expect("write");

        let files = find_fastq_files(tmp.path()).expect("scan");
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().and_then(|n| n.to_str()).map(String::from))
            .collect();
        assert_eq!(
            names,
            vec![Some("b_1.fastq".to_string()), Some("b_2.fastq".to_string())]
        );
    }

    #[test]
    fn test_find_fastq_files_prefers_pair_of_three() {
        let tmp = tempfile::tempdir().expect("tempdir");
        for name in ["s_1.fastq", "s_2.fastq", "s.fastq"] {
            fs::write(tmp.path().join(name), b"@r").expect("write");
        }

        let files = find_fastq_files(tmp.path()).expect("scan");
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|p| {
            p.file_stem()
                .and_then(|s| s.to_str())
                .is_some_and(|s| s.ends_with("_1") || s.ends_with("_2"))
        }));
    }

    #[test]
    fn test_find_fastq_files_single_unpaired() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("s.fastq"), b"@r").expect("write");

        let files = find_fastq_files(tmp.path()).expect("scan");
        assert_eq!(files.len(), 1);
    }
}
