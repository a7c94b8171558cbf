//! Pipeline orchestrator: wiring, startup, and sequential stage shutdown.

use std::sync::Arc;
use std::thread;

use thiserror::Error;
use tracing::{debug, info};

use crate::context::RunContext;
use crate::executor::{CommandExecutor, SystemExecutor};
use crate::sample::{load_definitions, LoadError, Partition, Sample};
use crate::scheduler::worker_pool::StageStats;
use crate::scheduler::{
    AffinitySet, AffinityStrategy, DistributedQueue, DistributedQueueError, ItemSource, PoolError,
    StagePool, StageQueue,
};
use crate::stages::{AnnotateStage, Assembled, AssembleStage, Downloaded, DownloadStage};

use super::config::{ConfigError, PipelineConfig};

/// Errors that can fail a whole pipeline run.
///
/// Per-sample tool failures are not among these: they are absorbed at the
/// worker boundary and recorded as on-disk failure markers.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The sample definitions file could not be read.
    #[error("Definition error: {0}")]
    Load(#[from] LoadError),

    /// The shared Redis work list is unusable.
    #[error("Distributed queue error: {0}")]
    Distributed(#[from] DistributedQueueError),

    /// A stage pool failed to start or shut down cleanly.
    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),
}

/// Per-stage statistics for one completed run.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSummary {
    /// Samples loaded from the definitions file (after resume filtering).
    pub loaded: usize,
    pub download: StageStats,
    pub assemble: StageStats,
    pub annotate: StageStats,
}

impl PipelineSummary {
    /// Samples that made it through every stage.
    pub fn completed(&self) -> u64 {
        self.annotate.forwarded
    }

    /// Samples dropped by a stage failure along the way.
    pub fn failed(&self) -> u64 {
        self.download.dropped() + self.assemble.dropped() + self.annotate.dropped()
    }
}

/// Coordinates one full pipeline run.
pub struct PipelineOrchestrator {
    config: PipelineConfig,
    ctx: Arc<RunContext>,
    executor: Arc<dyn CommandExecutor>,
}

impl PipelineOrchestrator {
    /// Creates an orchestrator running the real external tools.
    pub fn new(config: PipelineConfig, ctx: Arc<RunContext>) -> Self {
        Self::with_executor(config, ctx, Arc::new(SystemExecutor))
    }

    /// Creates an orchestrator with a custom command executor.
    pub fn with_executor(
        config: PipelineConfig,
        ctx: Arc<RunContext>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            config,
            ctx,
            executor,
        }
    }

    /// Runs the pipeline to completion.
    ///
    /// Startup problems (bad definitions file, unreachable Redis, invalid
    /// configuration) fail fast before any sample is processed. Once the
    /// pools are running, the only exit path is the drain/sentinel/join
    /// sequence, stage by stage in pipeline order.
    pub fn run(&self) -> Result<PipelineSummary, PipelineError> {
        self.config.validate()?;

        let samples = self.load_samples()?;
        let loaded = samples.len();
        info!(loaded, "loaded sample definitions");
        for sample in &samples {
            debug!(run_index = sample.run_index, sample = %sample.id, "queued");
        }

        let source = self.download_source(samples)?;

        let compute_queue = Arc::new(StageQueue::bounded(self.config.compute_queue_size));
        let annotate_queue = Arc::new(StageQueue::unbounded());

        // Affinity slots are handed out in pool-startup order so no two
        // workers overlap.
        let strategy = AffinityStrategy::new(self.config.topology);
        let mut next_slot = 0usize;
        let mut assign = |workers: usize| -> Vec<AffinitySet> {
            let sets = (next_slot..next_slot + workers)
                .map(|slot| strategy.assign(slot))
                .collect();
            next_slot += workers;
            sets
        };

        let mut download_pool = StagePool::start(
            Arc::new(DownloadStage::new(
                Arc::clone(&self.ctx),
                Arc::clone(&self.executor),
            )),
            source,
            Some(Arc::clone(&compute_queue)),
            assign(self.config.download_workers),
        )?;

        let assemble_source: Arc<dyn ItemSource<Downloaded>> = compute_queue.clone();
        let mut assemble_pool = StagePool::start(
            Arc::new(
                AssembleStage::new(
                    Arc::clone(&self.ctx),
                    Arc::clone(&self.executor),
                    self.config.app_threads,
                )
                .with_max_depth(self.config.max_depth)
                .with_delete_reads(self.config.delete_reads),
            ),
            assemble_source,
            Some(Arc::clone(&annotate_queue)),
            assign(self.config.assemble_workers),
        )?;

        let annotate_source: Arc<dyn ItemSource<Assembled>> = annotate_queue.clone();
        let mut annotate_pool = StagePool::start(
            Arc::new(AnnotateStage::new(Arc::clone(&self.executor))),
            annotate_source,
            None,
            assign(self.config.annotate_workers),
        )?;

        // Strictly sequential stage shutdown: a stage's sentinels go in
        // only after everything feeding it has shut down.
        let download = download_pool.drain_and_join()?;
        info!(
            processed = download.processed,
            failed = download.dropped(),
            "downloads done"
        );
        let assemble = assemble_pool.drain_and_join()?;
        info!(
            processed = assemble.processed,
            failed = assemble.dropped(),
            "assemblies done"
        );
        let annotate = annotate_pool.drain_and_join()?;
        info!(
            processed = annotate.processed,
            failed = annotate.dropped(),
            "annotations done"
        );

        let summary = PipelineSummary {
            loaded,
            download,
            assemble,
            annotate,
        };
        info!(
            loaded = summary.loaded,
            completed = summary.completed(),
            failed = summary.failed(),
            "pipeline complete"
        );
        Ok(summary)
    }

    /// Loads the sample definitions, applying the task-array partition in
    /// node-local mode.
    ///
    /// Distributed runs load the whole file: the shared list partitions
    /// work dynamically across nodes.
    fn load_samples(&self) -> Result<Vec<Sample>, PipelineError> {
        let partition = if self.config.is_distributed() {
            None
        } else {
            self.config.per_job.map(|per_job| {
                let task_index = self.ctx.array_task_index().unwrap_or(1);
                Partition {
                    offset: self.config.offset,
                    per_job,
                    task_index,
                }
            })
        };
        if let Some(p) = &partition {
            info!(range = ?p.range(), "processing task-array partition");
        }

        Ok(load_definitions(
            &self.config.defs_file,
            &self.config.output_dir,
            partition.as_ref(),
        )?)
    }

    /// Builds the download stage's item source: the shared Redis list in
    /// distributed mode, a pre-seeded local queue otherwise.
    fn download_source(
        &self,
        samples: Vec<Sample>,
    ) -> Result<Arc<dyn ItemSource<Sample>>, PipelineError> {
        if let Some(host) = &self.config.redis_host {
            let queue = Arc::new(DistributedQueue::connect(host, &self.config.redis_list)?);
            if self.ctx.is_coordinator() {
                queue.publish(&samples)?;
            } else {
                // Give the coordinator time to finish publishing before an
                // empty pop can be read as "no more work".
                info!(grace = ?self.config.publish_grace, "waiting for coordinator to publish");
                thread::sleep(self.config.publish_grace);
            }
            let source: Arc<dyn ItemSource<Sample>> = queue;
            Ok(source)
        } else {
            let queue = Arc::new(StageQueue::unbounded());
            for sample in samples {
                queue.put(sample);
            }
            let source: Arc<dyn ItemSource<Sample>> = queue;
            Ok(source)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_context() -> Arc<RunContext> {
        Arc::new(RunContext {
            host: "node01".to_string(),
            slurm_job: None,
            slurm_task: Some("2".to_string()),
            slurm_cluster: None,
            node_id: None,
            scratch_dir: PathBuf::from("/scratch"),
            ncbi_dir: None,
            container_metadata: None,
        })
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let config = PipelineConfig::new("missing.tsv", "/out").with_download_workers(0);
        let orchestrator = PipelineOrchestrator::new(config, test_context());
        let err = orchestrator.run().expect_err("invalid config");
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_missing_defs_file_fails_fast() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let config = PipelineConfig::new(tmp.path().join("missing.tsv"), tmp.path());
        let orchestrator = PipelineOrchestrator::new(config, test_context());
        let err = orchestrator.run().expect_err("missing defs");
        assert!(matches!(err, PipelineError::Load(_)));
    }

    #[test]
    fn test_unreachable_redis_fails_fast() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let defs = tmp.path().join("defs.tsv");
        std::fs::write(&defs, "SRR0000001\n").expect("write defs");

        let config =
            PipelineConfig::new(defs, tmp.path()).with_redis_host("redis://127.0.0.1:1/");
        let orchestrator = PipelineOrchestrator::new(config, test_context());
        let err = orchestrator.run().expect_err("unreachable redis");
        assert!(matches!(err, PipelineError::Distributed(_)));
    }

    #[test]
    fn test_partition_used_in_local_mode_only() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let defs = tmp.path().join("defs.tsv");
        let lines: Vec<String> = (1..=9).map(|i| format!("SRR{:07}", i)).collect();
        std::fs::write(&defs, lines.join("\n")).expect("write defs");

        // SLURM task 2 with per_job 3 selects indices 4..=6.
        let config = PipelineConfig::new(&defs, tmp.path()).with_partition(0, 3);
        let orchestrator = PipelineOrchestrator::new(config, test_context());
        let samples = orchestrator.load_samples().expect("load");
        let indices: Vec<usize> = samples.iter().map(|s| s.run_index).collect();
        assert_eq!(indices, vec![4, 5, 6]);

        // Distributed mode ignores the partition; Redis splits the work.
        let config = PipelineConfig::new(&defs, tmp.path())
            .with_partition(0, 3)
            .with_redis_host("10.0.0.1");
        let orchestrator = PipelineOrchestrator::new(config, test_context());
        let samples = orchestrator.load_samples().expect("load");
        assert_eq!(samples.len(), 9);
    }
}
