//! Stage queues, worker pools, CPU affinity, and distributed work feeding.
//!
//! This module provides the coordination layer between pipeline stages:
//!
//! - **StageQueue**: blocking bounded/unbounded FIFO with a join barrier
//! - **DistributedQueue**: Redis-backed shared work list for multi-node runs
//! - **StagePool**: a pool of named worker threads driving one stage
//! - **affinity**: per-worker CPU pinning strategies
//!
//! # Architecture
//!
//! ```text
//!  definitions ──► input queue ──► download pool ──► compute queue (bounded)
//!       (or Redis shared list)                              │
//!                                                           ▼
//!            annotate pool ◄── annotate queue ◄── assemble pool
//! ```
//!
//! Each stage's queue receives exactly one shutdown sentinel per attached
//! worker after everything upstream of it has fully drained, so every worker
//! exits exactly once and the orchestrator can join them deterministically.

pub mod affinity;
pub mod distributed;
pub mod queue;
pub mod worker_pool;

// Re-export main types for convenience
pub use affinity::{AffinitySet, AffinityStrategy, Topology};
pub use distributed::{DistributedQueue, DistributedQueueError};
pub use queue::{Message, StageQueue};
pub use worker_pool::{Fetched, ItemSource, PoolError, StageHandler, StagePool, StageState};
