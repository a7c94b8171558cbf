//! Pipeline configuration.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::scheduler::Topology;

/// Errors that can occur during configuration validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration field has an invalid value.
    #[error("Invalid value for {field}: {message}")]
    InvalidValue {
        field: &'static str,
        message: String,
    },
}

/// Configuration for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Inputs
    /// Tab-separated sample definitions file; accession in the first column.
    pub defs_file: PathBuf,
    /// Output directory base; samples write to sharded subdirectories.
    pub output_dir: PathBuf,

    // Partitioning (task-array mode)
    /// Base offset into the definitions file.
    pub offset: usize,
    /// Entries per array task; `None` processes the whole file.
    pub per_job: Option<usize>,

    // Worker pools
    /// Download worker threads.
    pub download_workers: usize,
    /// Assembly worker threads.
    pub assemble_workers: usize,
    /// Annotation worker threads.
    pub annotate_workers: usize,
    /// Thread count passed to the assembler per invocation.
    pub app_threads: usize,
    /// Capacity of the bounded download→assemble queue.
    pub compute_queue_size: usize,
    /// CPU placement strategy.
    pub topology: Topology,

    // Distributed mode
    /// Redis host for cross-node distribution; `None` runs node-local.
    pub redis_host: Option<String>,
    /// Name of the shared Redis work list.
    pub redis_list: String,
    /// How long non-coordinating nodes wait before their first pop, giving
    /// the coordinator time to finish publishing.
    pub publish_grace: Duration,

    // Tool options
    /// Read-depth cap passed to the assembler, when set.
    pub max_depth: Option<u32>,
    /// Ask the assembler to delete reads it has consumed.
    pub delete_reads: bool,
}

impl PipelineConfig {
    /// Creates a configuration with defaults for everything but the paths.
    pub fn new(defs_file: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            defs_file: defs_file.into(),
            output_dir: output_dir.into(),
            offset: 0,
            per_job: None,
            download_workers: 4,
            assemble_workers: 4,
            annotate_workers: 4,
            app_threads: 4,
            compute_queue_size: 4,
            topology: Topology::None,
            redis_host: None,
            redis_list: crate::scheduler::distributed::DEFAULT_LIST_NAME.to_string(),
            publish_grace: Duration::from_secs(5),
            max_depth: None,
            delete_reads: true,
        }
    }

    /// Sets the task-array partition parameters.
    pub fn with_partition(mut self, offset: usize, per_job: usize) -> Self {
        self.offset = offset;
        self.per_job = Some(per_job);
        self
    }

    /// Sets the download worker count.
    pub fn with_download_workers(mut self, workers: usize) -> Self {
        self.download_workers = workers;
        self
    }

    /// Sets the assembly worker count.
    pub fn with_assemble_workers(mut self, workers: usize) -> Self {
        self.assemble_workers = workers;
        self
    }

    /// Sets the annotation worker count.
    pub fn with_annotate_workers(mut self, workers: usize) -> Self {
        self.annotate_workers = workers;
        self
    }

    /// Sets the per-invocation assembler thread count.
    pub fn with_app_threads(mut self, threads: usize) -> Self {
        self.app_threads = threads;
        self
    }

    /// Sets the bounded compute-queue capacity.
    pub fn with_compute_queue_size(mut self, size: usize) -> Self {
        self.compute_queue_size = size;
        self
    }

    /// Sets the CPU placement strategy.
    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    /// Enables distributed mode against the given Redis host.
    pub fn with_redis_host(mut self, host: impl Into<String>) -> Self {
        self.redis_host = Some(host.into());
        self
    }

    /// Sets the grace period non-coordinating nodes wait at startup.
    pub fn with_publish_grace(mut self, grace: Duration) -> Self {
        self.publish_grace = grace;
        self
    }

    /// Sets the assembler read-depth cap.
    pub fn with_max_depth(mut self, depth: Option<u32>) -> Self {
        self.max_depth = depth;
        self
    }

    /// Whether this run distributes work over Redis.
    pub fn is_distributed(&self) -> bool {
        self.redis_host.is_some()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(field: &'static str, value: usize) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    message: "must be at least 1".to_string(),
                });
            }
            Ok(())
        }

        positive("download_workers", self.download_workers)?;
        positive("assemble_workers", self.assemble_workers)?;
        positive("annotate_workers", self.annotate_workers)?;
        positive("app_threads", self.app_threads)?;
        positive("compute_queue_size", self.compute_queue_size)?;
        if let Some(per_job) = self.per_job {
            positive("per_job", per_job)?;
        }
        Ok(())
    }
}
