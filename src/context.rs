//! Run-wide execution context.
//!
//! Host name, SLURM identifiers, scratch locations, and the optional
//! container label block are read exactly once at startup and passed
//! explicitly into workers and metadata construction. Worker bodies never
//! consult the environment themselves.

use std::fs::File;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, warn};

/// Default path of the Singularity label file inside a container image.
pub const DEFAULT_CONTAINER_LABELS: &str = "/.singularity.d/labels.json";

/// Immutable context captured once at process start.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Host name this process runs on.
    pub host: String,
    /// `SLURM_JOB_ID`, when running under the scheduler.
    pub slurm_job: Option<String>,
    /// `SLURM_ARRAY_TASK_ID`, when running as an array task.
    pub slurm_task: Option<String>,
    /// `SLURM_CLUSTER_NAME`.
    pub slurm_cluster: Option<String>,
    /// `SLURM_NODEID` within the job's node list.
    pub node_id: Option<u32>,
    /// Scratch directory for transient per-sample fastq data.
    pub scratch_dir: PathBuf,
    /// NCBI prefetch cache directory, if one is configured; the `.sra`
    /// files the download tool drops there are deleted after each download.
    pub ncbi_dir: Option<PathBuf>,
    /// Container label block, read verbatim from the label file when
    /// present; merged into every sample's metadata record.
    pub container_metadata: Option<serde_json::Value>,
}

impl RunContext {
    /// Captures the context from the environment.
    ///
    /// `scratch_dir` comes from the CLI but is overridden by the
    /// `SCRATCH_DIR` environment variable when set (compute nodes export
    /// their local scratch there). `ncbi_dir` falls back to the directory
    /// named in `~/.ncbi/user-settings.mkfg`.
    pub fn capture(
        scratch_dir: PathBuf,
        ncbi_dir: Option<PathBuf>,
        container_labels: &Path,
    ) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        let scratch_dir = std::env::var_os("SCRATCH_DIR")
            .map(PathBuf::from)
            .unwrap_or(scratch_dir);

        let node_id = std::env::var("SLURM_NODEID")
            .ok()
            .and_then(|v| v.parse().ok());

        Self {
            host,
            slurm_job: std::env::var("SLURM_JOB_ID").ok(),
            slurm_task: std::env::var("SLURM_ARRAY_TASK_ID").ok(),
            slurm_cluster: std::env::var("SLURM_CLUSTER_NAME").ok(),
            node_id,
            scratch_dir,
            ncbi_dir: ncbi_dir.or_else(discover_ncbi_dir),
            container_metadata: read_container_labels(container_labels),
        }
    }

    /// The 1-based array task index, when running as an array task.
    pub fn array_task_index(&self) -> Option<usize> {
        self.slurm_task.as_deref().and_then(|v| v.parse().ok())
    }

    /// Whether this node coordinates distributed runs.
    ///
    /// Node 0 of the job's node list publishes the shared work list; a
    /// process with no node id (not under SLURM) acts as its own
    /// coordinator.
    pub fn is_coordinator(&self) -> bool {
        self.node_id.unwrap_or(0) == 0
    }
}

/// Reads the container label block, if the label file exists.
fn read_container_labels(path: &Path) -> Option<serde_json::Value> {
    if !path.exists() {
        return None;
    }
    let fh = match File::open(path) {
        Ok(fh) => fh,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot open container label file");
            return None;
        }
    };
    match serde_json::from_reader(fh) {
        Ok(labels) => Some(labels),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot parse container label file");
            None
        }
    }
}

/// Finds the NCBI prefetch cache directory from the user's SRA toolkit
/// configuration (`~/.ncbi/user-settings.mkfg`).
fn discover_ncbi_dir() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    let config = Path::new(&home).join(".ncbi/user-settings.mkfg");
    let text = std::fs::read_to_string(&config).ok()?;

    let re = Regex::new(r#"/repository/user/default-path\s*=\s*"(.*)""#)
        .ok()?;
    let dir = re.captures(&text)?.get(1)?.as_str();
    debug!(dir, "found NCBI cache directory");
    Some(PathBuf::from(dir))
}
