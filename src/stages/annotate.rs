//! Annotation stage: produce the final annotated genome object.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::executor::{CommandExecutor, CommandLine, Redirection};
use crate::metadata::{
    unix_time, write_failure_marker, StageTiming, ANNOTATE_TIMING_FILE,
};
use crate::sample::Sample;
use crate::scheduler::StageHandler;

use super::Assembled;

/// Default tool building the raw genome object from the assembly.
pub const DEFAULT_CREATE_TOOL: &str = "p3x-create-sars-gto";
/// Default annotation tool.
pub const DEFAULT_ANNOTATE_TOOL: &str = "p3x-annotate-vigor4";

/// Marker file written when annotation fails.
pub const ANNOTATION_FAILURE_MARKER: &str = "annotation.failure";

/// Annotates one assembled sample in two steps: build the raw genome
/// object from the assembly and its download metadata, then annotate it
/// into the final `<accession>.gto`.
///
/// Annotation failure is not terminal for the sample: the raw genome
/// object is copied to the final artifact path so downstream consumers
/// always find a usable file, with the failure marker recording what
/// happened. This is the last stage, so it also writes the sample's final
/// `meta.json`.
pub struct AnnotateStage {
    executor: Arc<dyn CommandExecutor>,
    create_tool: String,
    annotate_tool: String,
}

impl AnnotateStage {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            create_tool: DEFAULT_CREATE_TOOL.to_string(),
            annotate_tool: DEFAULT_ANNOTATE_TOOL.to_string(),
        }
    }

    /// Overrides the genome-object creation tool name.
    pub fn with_create_tool(mut self, tool: impl Into<String>) -> Self {
        self.create_tool = tool.into();
        self
    }

    /// Overrides the annotation tool name.
    pub fn with_annotate_tool(mut self, tool: impl Into<String>) -> Self {
        self.annotate_tool = tool.into();
        self
    }

    fn create_command(&self, sample: &Sample) -> CommandLine {
        CommandLine::new(&self.create_tool)
            .arg(sample.artifact("fasta").to_string_lossy())
            .arg(sample.artifact("json").to_string_lossy())
            .arg(sample.artifact("raw.gto").to_string_lossy())
    }

    fn annotate_command(&self, sample: &Sample) -> CommandLine {
        CommandLine::new(&self.annotate_tool)
            .arg("-i")
            .arg(sample.artifact("raw.gto").to_string_lossy())
            .arg("-o")
            .arg(sample.terminal_artifact().to_string_lossy())
    }

    /// Runs one annotation step; returns whether it succeeded, recording a
    /// marker on failure.
    fn run_step(
        &self,
        sample: &Sample,
        cmd: &CommandLine,
        logs: &Redirection,
        cwd: Option<&Path>,
    ) -> bool {
        let out_dir = sample.output_dir();
        let code = match self.executor.run(cmd, logs, cwd) {
            Ok(code) => code,
            Err(e) => {
                error!(sample = %sample.id, tool = cmd.program(), error = %e, "annotation tool did not run");
                write_failure_marker(
                    &out_dir.join(ANNOTATION_FAILURE_MARKER),
                    &format!("{} of {} did not run: {e}", cmd.program(), sample.id),
                );
                return false;
            }
        };
        if code != 0 {
            warn!(sample = %sample.id, tool = cmd.program(), code, "annotation failed");
            write_failure_marker(
                &out_dir.join(ANNOTATION_FAILURE_MARKER),
                &format!("Nonzero returncode {code} from annotation of {}", sample.id),
            );
            return false;
        }
        true
    }
}

impl StageHandler for AnnotateStage {
    type Input = Assembled;
    type Output = ();

    fn name(&self) -> &'static str {
        "annotate"
    }

    fn process(&self, item: Assembled) -> Option<()> {
        let Assembled { sample, mut record } = item;
        let out_dir = sample.output_dir().to_path_buf();

        debug!(sample = %sample.id, "annotating");
        let start = unix_time();

        let succeeded = self.run_step(
            &sample,
            &self.create_command(&sample),
            &Redirection::truncate(&out_dir, "annotate"),
            None,
        ) && self.run_step(
            &sample,
            &self.annotate_command(&sample),
            &Redirection::append(&out_dir, "annotate"),
            Some(out_dir.as_path()),
        );

        let timing = StageTiming::since(start);
        if let Err(e) = timing.write(&out_dir, ANNOTATE_TIMING_FILE) {
            warn!(sample = %sample.id, error = %e, "cannot write annotation timing file");
        }

        if !succeeded {
            copy_fallback_artifact(&sample);
        }

        record.annotation_elapsed = Some(timing.elapsed);
        if let Err(e) = record.write(&out_dir) {
            warn!(sample = %sample.id, error = %e, "cannot write metadata record");
        }

        if succeeded {
            debug!(sample = %sample.id, elapsed = timing.elapsed, "annotation complete");
            Some(())
        } else {
            None
        }
    }
}

/// Copies the raw genome object to the terminal artifact path.
///
/// Best we can do after a failed annotation: downstream consumers still
/// find a structurally valid, if unannotated, genome object.
fn copy_fallback_artifact(sample: &Sample) {
    let raw = sample.artifact("raw.gto");
    if !raw.exists() {
        warn!(sample = %sample.id, "no raw genome object to fall back to");
        return;
    }
    if let Err(e) = fs::copy(&raw, sample.terminal_artifact()) {
        error!(sample = %sample.id, error = %e, "cannot copy fallback artifact");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_shapes() {
        let stage = AnnotateStage::new(Arc::new(crate::executor::SystemExecutor));
        let sample = Sample::new("SRR0000001", 1, Path::new("/out"));

        assert_eq!(
            stage.create_command(&sample).to_string(),
            "p3x-create-sars-gto /out/SRR0000/SRR0000001/SRR0000001.fasta \
             /out/SRR0000/SRR0000001/SRR0000001.json \
             /out/SRR0000/SRR0000001/SRR0000001.raw.gto"
        );
        assert_eq!(
            stage.annotate_command(&sample).to_string(),
            "p3x-annotate-vigor4 -i /out/SRR0000/SRR0000001/SRR0000001.raw.gto \
             -o /out/SRR0000/SRR0000001/SRR0000001.gto"
        );
    }

    #[test]
    fn test_fallback_copies_raw_gto() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let sample = Sample::new("SRR0000001", 1, tmp.path());
        sample.create_output_dir().expect("mkdir");
        fs::write(sample.artifact("raw.gto"), b"raw genome object").expect("write raw");

        copy_fallback_artifact(&sample);

        let fallback = fs::read(sample.terminal_artifact()).expect("read fallback");
        assert_eq!(fallback, b"raw genome object");
    }

    #[test]
    fn test_fallback_without_raw_gto_is_noop() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let sample = Sample::new("SRR0000001", 1, tmp.path());
        sample.create_output_dir().expect("mkdir");

        copy_fallback_artifact(&sample);
        assert!(!sample.terminal_artifact().exists());
    }
}
