//! Redis-backed shared work list for multi-node runs.
//!
//! In distributed mode one coordinating node (SLURM node 0) publishes every
//! sample once into a named Redis list; download workers on all nodes,
//! coordinator included, pop from that list instead of a local queue.
//!
//! # Contract
//!
//! `RPOP` is atomic, so no two workers on any node ever receive the same
//! sample. An empty pop means "no more work" and ends the worker's loop.
//! That reading is only safe once the coordinator has finished publishing;
//! the orchestrator holds non-coordinating nodes back for a fixed grace
//! period before their first pop. This is a known weak guarantee, not a
//! synchronization barrier.
//!
//! An unreachable Redis server is a hard startup error; it must never be
//! mistaken for an empty queue.

use std::sync::Mutex;

use redis::Commands;
use thiserror::Error;
use tracing::{debug, info};

use crate::sample::Sample;

/// Default name of the shared work list.
pub const DEFAULT_LIST_NAME: &str = "sra";

/// Errors that can occur during shared-list operations.
#[derive(Debug, Error)]
pub enum DistributedQueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to serialize or deserialize a sample.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Shared cross-node work list holding JSON-serialized samples.
///
/// One connection per process, shared by all download workers; each
/// operation holds the connection lock only for the duration of one Redis
/// command.
pub struct DistributedQueue {
    conn: Mutex<redis::Connection>,
    list_name: String,
}

impl std::fmt::Debug for DistributedQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedQueue")
            .field("list_name", &self.list_name)
            .finish_non_exhaustive()
    }
}

impl DistributedQueue {
    /// Connects to Redis at `host` and binds to the named list.
    ///
    /// `host` may be a bare host name or a full `redis://` URL. The
    /// connection is verified with a PING so an unreachable server fails
    /// the run at startup.
    pub fn connect(host: &str, list_name: &str) -> Result<Self, DistributedQueueError> {
        let url = if host.contains("://") {
            host.to_string()
        } else {
            format!("redis://{host}/")
        };

        let client = redis::Client::open(url.as_str())
            .map_err(|e| DistributedQueueError::ConnectionFailed(e.to_string()))?;
        let mut conn = client
            .get_connection()
            .map_err(|e| DistributedQueueError::ConnectionFailed(e.to_string()))?;

        redis::cmd("PING")
            .query::<String>(&mut conn)
            .map_err(|e| DistributedQueueError::ConnectionFailed(e.to_string()))?;

        info!(url = %url, list = list_name, "connected to Redis work list");
        Ok(Self {
            conn: Mutex::new(conn),
            list_name: list_name.to_string(),
        })
    }

    /// Publishes the full work list, replacing any previous contents.
    ///
    /// Called once, by the coordinating node only, before workers start
    /// popping. Returns the number of samples pushed.
    pub fn publish(&self, samples: &[Sample]) -> Result<usize, DistributedQueueError> {
        let serialized: Result<Vec<String>, _> =
            samples.iter().map(serde_json::to_string).collect();
        let serialized = serialized?;

        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.del::<_, ()>(&self.list_name)?;

        let mut pipe = redis::pipe();
        for entry in &serialized {
            pipe.lpush(&self.list_name, entry);
        }
        pipe.query::<()>(&mut conn)?;

        info!(count = samples.len(), list = %self.list_name, "published work list");
        Ok(samples.len())
    }

    /// Pops one sample, or `None` when the list is empty.
    pub fn pop(&self) -> Result<Option<Sample>, DistributedQueueError> {
        let entry: Option<String> = {
            let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.rpop(&self.list_name, None)?
        };

        match entry {
            Some(data) => {
                let sample: Sample = serde_json::from_str(&data)?;
                debug!(sample = %sample.id, "popped from work list");
                Ok(Some(sample))
            }
            None => Ok(None),
        }
    }

    /// Number of samples still waiting in the list.
    pub fn len(&self) -> Result<usize, DistributedQueueError> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        Ok(conn.llen(&self.list_name)?)
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> Result<bool, DistributedQueueError> {
        Ok(self.len()? == 0)
    }

    /// The name of the shared list.
    pub fn list_name(&self) -> &str {
        &self.list_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_wire_format_roundtrip() {
        let sample = Sample::new("SRR14093730", 12, Path::new("/out"));
        let wire = serde_json::to_string(&sample).expect("serialize");
        let parsed: Sample = serde_json::from_str(&wire).expect("deserialize");
        assert_eq!(parsed, sample);
    }

    #[test]
    fn test_unreachable_server_fails_fast() {
        // Nothing listens on this port; connect must fail rather than
        // behave as an empty queue.
        let err = DistributedQueue::connect("redis://127.0.0.1:1/", DEFAULT_LIST_NAME)
            .expect_err("connect should fail");
        assert!(matches!(
            err,
            DistributedQueueError::ConnectionFailed(_)
        ));
    }

    #[test]
    fn test_error_display() {
        let err = DistributedQueueError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("refused"));
    }
}
