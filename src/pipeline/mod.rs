//! Pipeline wiring and orchestration.
//!
//! The orchestrator owns the whole run: it loads the sample definitions,
//! chooses the download source (local queue or shared Redis list), computes
//! per-worker CPU affinities, starts the three stage pools, and shuts the
//! stages down strictly in pipeline order once their inputs have drained.
//!
//! # Pipeline Flow
//!
//! 1. **Load**: read the definitions file, skip already-completed samples
//! 2. **Seed**: put every sample on the input queue (or publish to Redis
//!    from the coordinating node)
//! 3. **Run**: download, assemble, and annotate pools process concurrently,
//!    connected by blocking queues; the bounded download→assemble queue
//!    provides backpressure
//! 4. **Shutdown**: each stage in order is drained, handed one sentinel per
//!    worker, and joined
//!
//! # Example
//!
//! ```rust,ignore
//! use srapipe::context::RunContext;
//! use srapipe::pipeline::{PipelineConfig, PipelineOrchestrator};
//! use std::sync::Arc;
//!
//! let config = PipelineConfig::new("sra-defs.tsv", "/output/base")
//!     .with_download_workers(4)
//!     .with_assemble_workers(18)
//!     .with_compute_queue_size(3);
//!
//! let ctx = Arc::new(RunContext::capture(
//!     "/scratch".into(),
//!     None,
//!     std::path::Path::new(srapipe::context::DEFAULT_CONTAINER_LABELS),
//! ));
//! let summary = PipelineOrchestrator::new(config, ctx).run()?;
//! println!("annotated {} samples", summary.annotate.forwarded);
//! ```

pub mod config;
pub mod orchestrator;

// Re-export main types for convenience
pub use config::{ConfigError, PipelineConfig};
pub use orchestrator::{PipelineError, PipelineOrchestrator, PipelineSummary};
