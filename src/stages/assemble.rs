//! Assembly stage: build the consensus sequence from downloaded reads.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::context::RunContext;
use crate::executor::{CommandExecutor, CommandLine, Redirection};
use crate::metadata::{
    remove_transient, unix_time, write_failure_marker, MetadataRecord, StageTiming,
    ASSEMBLE_TIMING_FILE,
};
use crate::scheduler::StageHandler;

use super::{Assembled, Downloaded};

/// Default assembly tool.
pub const DEFAULT_ASSEMBLE_TOOL: &str = "sars2-onecodex";

/// Marker file written when assembly fails.
pub const ASSEMBLY_FAILURE_MARKER: &str = "assembly.failure";

/// Assembles one sample's reads into `<accession>.fasta`.
///
/// Writes the sample's `RUNTIME` timing file and first `meta.json`
/// regardless of outcome; a failed assembly additionally writes the failure
/// marker and drops the sample. The downloaded fastq files are deleted
/// either way; they are the pipeline's largest transient artifact.
pub struct AssembleStage {
    ctx: Arc<RunContext>,
    executor: Arc<dyn CommandExecutor>,
    tool: String,
    /// Thread count passed to the assembler.
    app_threads: usize,
    /// Read-depth cap passed to the assembler, when set.
    max_depth: Option<u32>,
    /// Ask the assembler to delete reads it has consumed.
    delete_reads: bool,
}

impl AssembleStage {
    pub fn new(ctx: Arc<RunContext>, executor: Arc<dyn CommandExecutor>, app_threads: usize) -> Self {
        Self {
            ctx,
            executor,
            tool: DEFAULT_ASSEMBLE_TOOL.to_string(),
            app_threads,
            max_depth: None,
            delete_reads: true,
        }
    }

    /// Overrides the assembly tool name.
    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = tool.into();
        self
    }

    /// Caps the read depth the assembler uses.
    pub fn with_max_depth(mut self, depth: Option<u32>) -> Self {
        self.max_depth = depth;
        self
    }

    /// Controls whether the assembler deletes consumed reads itself.
    pub fn with_delete_reads(mut self, delete: bool) -> Self {
        self.delete_reads = delete;
        self
    }

    fn command(&self, item: &Downloaded) -> CommandLine {
        let mut cmd = CommandLine::new(&self.tool);
        if let Some(depth) = self.max_depth {
            cmd = cmd.arg("--max-depth").arg(depth.to_string());
        }
        cmd = cmd.args(
            item.fastq_files
                .iter()
                .map(|p| p.to_string_lossy().into_owned()),
        );
        cmd = cmd
            .arg(&item.sample.id)
            .arg(item.sample.output_dir().to_string_lossy())
            .arg("--threads")
            .arg(self.app_threads.to_string());
        if self.delete_reads {
            cmd = cmd.arg("--delete-reads");
        }
        cmd
    }
}

impl StageHandler for AssembleStage {
    type Input = Downloaded;
    type Output = Assembled;

    fn name(&self) -> &'static str {
        "assemble"
    }

    fn process(&self, item: Downloaded) -> Option<Assembled> {
        let sample = &item.sample;
        let out_dir = sample.output_dir().to_path_buf();

        debug!(sample = %sample.id, files = item.fastq_files.len(), "assembling");
        let cmd = self.command(&item);
        let logs = Redirection::truncate(&out_dir, "assemble");

        let start = unix_time();
        let result = self.executor.run(&cmd, &logs, None);
        let timing = StageTiming::since(start);

        if let Err(e) = timing.write(&out_dir, ASSEMBLE_TIMING_FILE) {
            warn!(sample = %sample.id, error = %e, "cannot write assembly timing file");
        }

        // The record is written even for failed assemblies; partial copies
        // are diagnostic only and the final write happens after annotation.
        let mut record = MetadataRecord::new(sample, timing, &self.ctx);
        record.download_elapsed = Some(item.timing.elapsed);
        if let Err(e) = record.write(&out_dir) {
            warn!(sample = %sample.id, error = %e, "cannot write metadata record");
        }

        remove_transient(item.fastq_files.iter().cloned());

        let code = match result {
            Ok(code) => code,
            Err(e) => {
                error!(sample = %sample.id, error = %e, "assembly tool did not run");
                write_failure_marker(
                    &out_dir.join(ASSEMBLY_FAILURE_MARKER),
                    &format!("{} of {} did not run: {e}", self.tool, sample.id),
                );
                return None;
            }
        };
        if code != 0 {
            warn!(sample = %sample.id, code, "assembly failed");
            write_failure_marker(
                &out_dir.join(ASSEMBLY_FAILURE_MARKER),
                &format!("Nonzero returncode {code} from assembly of {}", sample.id),
            );
            return None;
        }

        debug!(sample = %sample.id, elapsed = timing.elapsed, "assembly complete");
        Some(Assembled {
            sample: item.sample,
            record,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use crate::sample::Sample;

    fn test_context() -> Arc<RunContext> {
        Arc::new(RunContext {
            host: "node01".to_string(),
            slurm_job: None,
            slurm_task: None,
            slurm_cluster: None,
            node_id: None,
            scratch_dir: PathBuf::from("/scratch"),
            ncbi_dir: None,
            container_metadata: None,
        })
    }

    #[test]
    fn test_command_shape() {
        let ctx = test_context();
        let stage = AssembleStage::new(ctx, Arc::new(crate::executor::SystemExecutor), 4)
            .with_max_depth(Some(8000));
        let item = Downloaded {
            sample: Sample::new("SRR0000001", 1, Path::new("/out")),
            fastq_files: vec![
                PathBuf::from("/scratch/task-1/r_1.fastq"),
                PathBuf::from("/scratch/task-1/r_2.fastq"),
            ],
            timing: StageTiming {
                start: 0.0,
                end: 1.0,
                elapsed: 1.0,
            },
        };

        let cmd = stage.command(&item);
        assert_eq!(
            cmd.to_string(),
            "sars2-onecodex --max-depth 8000 /scratch/task-1/r_1.fastq \
             /scratch/task-1/r_2.fastq SRR0000001 /out/SRR0000/SRR0000001 \
             --threads 4 --delete-reads"
        );
    }

    #[test]
    fn test_command_without_optional_flags() {
        let ctx = test_context();
        let stage = AssembleStage::new(ctx, Arc::new(crate::executor::SystemExecutor), 2)
            .with_delete_reads(false);
        let item = Downloaded {
            sample: Sample::new("SRR0000001", 1, Path::new("/out")),
            fastq_files: vec![PathBuf::from("/scratch/task-1/r.fastq")],
            timing: StageTiming {
                start: 0.0,
                end: 1.0,
                elapsed: 1.0,
            },
        };

        let cmd = stage.command(&item);
        let rendered = cmd.to_string();
        assert!(!rendered.contains("--max-depth"));
        assert!(!rendered.contains("--delete-reads"));
        assert!(rendered.contains("--threads 2"));
    }
}
