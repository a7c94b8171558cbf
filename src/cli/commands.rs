//! CLI command definitions.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use crate::context::{RunContext, DEFAULT_CONTAINER_LABELS};
use crate::pipeline::{PipelineConfig, PipelineOrchestrator};
use crate::scheduler::Topology;

/// Pipelined SRA download, assembly, and annotation runner.
#[derive(Parser)]
#[command(name = "srapipe")]
#[command(about = "Run pipelined SRA download, assembly and annotation")]
#[command(version)]
#[command(
    long_about = "srapipe pushes batches of SRA samples through download, assembly and \
annotation worker pools connected by blocking queues.\n\nUnder a SLURM array job, \
--offset and --per-job select each task's slice of the definitions file. With \
--redis-host, one coordinating node publishes the work list to Redis and every \
node's download workers pop from it.\n\nExample usage:\n  srapipe run sra-defs.tsv \
/output/base --n-computes 18 --compute-queue-size 3"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the pipeline over a sample definitions file.
    Run(RunArgs),
}

/// Arguments for `srapipe run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// File of SRA identifiers to process (first tab-separated column).
    pub sra_def_file: PathBuf,

    /// Output directory base.
    pub output_dir: PathBuf,

    /// Base offset into the definitions file for task-array partitioning.
    #[arg(long, default_value = "0")]
    pub offset: usize,

    /// Entries per array task; omit to process the whole file.
    #[arg(long)]
    pub per_job: Option<usize>,

    /// Scratch directory for transient fastq data (SCRATCH_DIR overrides).
    #[arg(long, default_value = "/scratch")]
    pub scratch: PathBuf,

    /// Number of download threads.
    #[arg(long, default_value = "4")]
    pub n_downloads: usize,

    /// Number of compute (assembly) threads.
    #[arg(long, default_value = "4")]
    pub n_computes: usize,

    /// Number of annotation threads; defaults to the compute thread count.
    #[arg(long)]
    pub n_annotates: Option<usize>,

    /// Number of threads each assembler invocation may use.
    #[arg(long, default_value = "4")]
    pub n_app_threads: usize,

    /// Size of the bounded download→assembly queue.
    #[arg(long, default_value = "4")]
    pub compute_queue_size: usize,

    /// CPU placement strategy for worker threads.
    #[arg(long, value_enum, default_value_t = Topology::None)]
    pub topology: Topology,

    /// Use Redis at the given host for cross-node job distribution.
    #[arg(long)]
    pub redis_host: Option<String>,

    /// Name of the shared Redis work list.
    #[arg(long, default_value = "sra")]
    pub redis_list: String,

    /// Seconds non-coordinating nodes wait for the coordinator to publish.
    #[arg(long, default_value = "5")]
    pub publish_grace: u64,

    /// Read-depth cap passed to the assembler.
    #[arg(long)]
    pub max_depth: Option<u32>,

    /// NCBI prefetch cache directory (default: from ~/.ncbi configuration).
    #[arg(long)]
    pub ncbi_dir: Option<PathBuf>,

    /// Container label file merged into each sample's metadata record.
    #[arg(long, default_value = DEFAULT_CONTAINER_LABELS)]
    pub container_labels: PathBuf,
}

/// Parses the command line.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs the parsed command.
pub fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_pipeline(args),
    }
}

fn run_pipeline(args: RunArgs) -> anyhow::Result<()> {
    let ctx = Arc::new(RunContext::capture(
        args.scratch,
        args.ncbi_dir,
        &args.container_labels,
    ));
    info!(host = %ctx.host, node_id = ?ctx.node_id, "starting pipeline run");

    let mut config = PipelineConfig::new(args.sra_def_file, args.output_dir)
        .with_download_workers(args.n_downloads)
        .with_assemble_workers(args.n_computes)
        .with_annotate_workers(args.n_annotates.unwrap_or(args.n_computes))
        .with_app_threads(args.n_app_threads)
        .with_compute_queue_size(args.compute_queue_size)
        .with_topology(args.topology)
        .with_publish_grace(Duration::from_secs(args.publish_grace))
        .with_max_depth(args.max_depth);
    if let Some(per_job) = args.per_job {
        config = config.with_partition(args.offset, per_job);
    }
    config.redis_list = args.redis_list;
    if let Some(host) = args.redis_host {
        config = config.with_redis_host(host);
    }

    let summary = PipelineOrchestrator::new(config, ctx).run()?;
    info!(
        loaded = summary.loaded,
        completed = summary.completed(),
        failed = summary.failed(),
        "run finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run_command() {
        let cli = Cli::try_parse_from([
            "srapipe",
            "run",
            "defs.tsv",
            "/out",
            "--n-computes",
            "18",
            "--compute-queue-size",
            "3",
            "--topology",
            "wide",
        ])
        .expect("parse");

        let Commands::Run(args) = cli.command;
        assert_eq!(args.sra_def_file, PathBuf::from("defs.tsv"));
        assert_eq!(args.n_computes, 18);
        assert_eq!(args.compute_queue_size, 3);
        assert_eq!(args.topology, Topology::Wide);
        assert!(args.redis_host.is_none());
    }

    #[test]
    fn test_cli_requires_paths() {
        assert!(Cli::try_parse_from(["srapipe", "run"]).is_err());
    }

    #[test]
    fn test_cli_distributed_flags() {
        let cli = Cli::try_parse_from([
            "srapipe",
            "run",
            "defs.tsv",
            "/out",
            "--redis-host",
            "10.0.0.1",
            "--publish-grace",
            "10",
        ])
        .expect("parse");

        let Commands::Run(args) = cli.command;
        assert_eq!(args.redis_host.as_deref(), Some("10.0.0.1"));
        assert_eq!(args.publish_grace, 10);
        assert_eq!(args.redis_list, "sra");
    }
}
