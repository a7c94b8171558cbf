//! Generic per-stage worker pool.
//!
//! One `StagePool` drives one pipeline stage: a fixed number of named OS
//! threads, each optionally pinned to its CPU affinity set, each repeatedly
//! pulling one item from the stage's source, processing it through the
//! stage's handler, and forwarding the result downstream. All three stages
//! run on this one engine; the differences between them live entirely in
//! their [`StageHandler`] implementations.
//!
//! # Lifecycle
//!
//! A stage moves through `NotStarted → Running → Draining → ShutDown`.
//! [`StagePool::start`] spawns the workers (`Running`);
//! [`StagePool::drain_and_join`] waits until every item fed to the stage has
//! been fully processed (`Draining`), injects exactly one shutdown sentinel
//! per worker, and joins the threads (`ShutDown`). The orchestrator drains
//! stages strictly in pipeline order, so a stage's sentinels are only
//! injected once nothing upstream can produce more work for it.
//!
//! # Sources
//!
//! A stage pulls from an [`ItemSource`]: either a local [`StageQueue`] or,
//! for the download stage of a distributed run, the shared Redis list. The
//! Redis source has no sentinels; an empty pop ends each worker's loop,
//! so its drain step degenerates to joining the threads.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, error, info, info_span, warn};

use super::affinity::{pin_current_thread, AffinitySet};
use super::distributed::DistributedQueue;
use super::queue::{Message, StageQueue};
use crate::sample::Sample;

/// Errors that can occur in a stage pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A worker thread could not be spawned.
    #[error("cannot spawn worker thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    /// A worker thread panicked; its items may be unaccounted for.
    #[error("worker thread {name} panicked")]
    WorkerPanicked { name: String },
}

/// Lifecycle state of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    NotStarted,
    Running,
    Draining,
    ShutDown,
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageState::NotStarted => write!(f, "not-started"),
            StageState::Running => write!(f, "running"),
            StageState::Draining => write!(f, "draining"),
            StageState::ShutDown => write!(f, "shut-down"),
        }
    }
}

/// What a worker's fetch produced.
pub enum Fetched<T> {
    /// One unit of work.
    Item(T),
    /// No more work will ever arrive; the worker exits its loop.
    Exhausted,
}

/// Where a stage's workers pull items from.
pub trait ItemSource<T: Send>: Send + Sync {
    /// Blocks for the next item, or reports the source exhausted.
    fn fetch(&self) -> Fetched<T>;

    /// Marks the most recently fetched item fully processed.
    fn item_done(&self);

    /// Blocks until every item fed to this source has been marked done.
    fn wait_idle(&self);

    /// Tells `workers` pending fetches that no more work is coming.
    fn request_stop(&self, workers: usize);
}

impl<T: Send> ItemSource<T> for StageQueue<T> {
    fn fetch(&self) -> Fetched<T> {
        match self.get() {
            Message::Item(item) => Fetched::Item(item),
            Message::Shutdown => Fetched::Exhausted,
        }
    }

    fn item_done(&self) {
        self.task_done();
    }

    fn wait_idle(&self) {
        self.join();
    }

    fn request_stop(&self, workers: usize) {
        for _ in 0..workers {
            self.put_shutdown();
        }
    }
}

impl ItemSource<Sample> for DistributedQueue {
    /// An empty pop is exhaustion; the coordinator finished publishing
    /// before workers started, so an empty list means the run is done.
    /// A Redis error after startup also ends the worker rather than
    /// retrying forever.
    fn fetch(&self) -> Fetched<Sample> {
        match self.pop() {
            Ok(Some(sample)) => Fetched::Item(sample),
            Ok(None) => Fetched::Exhausted,
            Err(e) => {
                error!(error = %e, "Redis pop failed, stopping worker");
                Fetched::Exhausted
            }
        }
    }

    fn item_done(&self) {}

    fn wait_idle(&self) {}

    fn request_stop(&self, _workers: usize) {}
}

/// One stage's processing logic.
///
/// Handlers run the stage's external tool and absorb its failures: a
/// tool failure is recorded on disk (marker file, logs) and expressed as
/// `None`, dropping the item from the pipeline. Nothing a handler does may
/// panic the worker on a per-item basis.
pub trait StageHandler: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    /// Stage name, used for thread names and logging.
    fn name(&self) -> &'static str;

    /// Processes one item; `None` removes the item from the pipeline.
    fn process(&self, item: Self::Input) -> Option<Self::Output>;
}

/// Counters shared between a pool and its workers.
#[derive(Debug, Default)]
struct SharedCounts {
    processed: AtomicU64,
    forwarded: AtomicU64,
}

/// Summary of one stage after shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageStats {
    /// Number of workers the stage ran.
    pub workers: usize,
    /// Items the stage pulled and processed.
    pub processed: u64,
    /// Items forwarded downstream (processed minus dropped).
    pub forwarded: u64,
}

impl StageStats {
    /// Items dropped by failure policy.
    pub fn dropped(&self) -> u64 {
        self.processed - self.forwarded
    }
}

/// A pool of worker threads driving one pipeline stage.
pub struct StagePool<I: Send> {
    name: &'static str,
    source: Arc<dyn ItemSource<I>>,
    handles: Vec<(String, JoinHandle<()>)>,
    counts: Arc<SharedCounts>,
    state: StageState,
}

impl<I: Send + 'static> StagePool<I> {
    /// Spawns one worker per affinity set and starts processing.
    ///
    /// `affinities` determines the worker count; pass unpinned sets for the
    /// `none` topology. Workers forward each processed item to `downstream`
    /// when the stage has one.
    pub fn start<H>(
        handler: Arc<H>,
        source: Arc<dyn ItemSource<I>>,
        downstream: Option<Arc<StageQueue<H::Output>>>,
        affinities: Vec<AffinitySet>,
    ) -> Result<Self, PoolError>
    where
        H: StageHandler<Input = I>,
    {
        let name = handler.name();
        let counts = Arc::new(SharedCounts::default());
        let mut handles = Vec::with_capacity(affinities.len());

        for (i, affinity) in affinities.into_iter().enumerate() {
            let worker_name = format!("{name}-{i}");
            let handler = Arc::clone(&handler);
            let source = Arc::clone(&source);
            let downstream = downstream.clone();
            let counts = Arc::clone(&counts);
            let thread_name = worker_name.clone();

            let handle = thread::Builder::new()
                .name(worker_name.clone())
                .spawn(move || {
                    worker_loop(&thread_name, affinity, handler, source, downstream, counts)
                })
                .map_err(|source| PoolError::Spawn {
                    name: worker_name.clone(),
                    source,
                })?;
            handles.push((worker_name, handle));
        }

        info!(stage = name, workers = handles.len(), "stage pool started");
        Ok(Self {
            name,
            source,
            handles,
            counts,
            state: StageState::Running,
        })
    }

    /// Drains the stage and shuts its workers down.
    ///
    /// Blocks until every item fed to the stage has been marked done, then
    /// injects exactly one sentinel per worker and joins the threads. Must
    /// only be called after every upstream stage has shut down; otherwise
    /// late puts could race the sentinels.
    pub fn drain_and_join(&mut self) -> Result<StageStats, PoolError> {
        self.state = StageState::Draining;
        info!(stage = self.name, state = %self.state, "draining stage");
        self.source.wait_idle();
        self.source.request_stop(self.handles.len());

        let mut first_panic = None;
        let workers = self.handles.len();
        for (name, handle) in self.handles.drain(..) {
            if handle.join().is_err() && first_panic.is_none() {
                first_panic = Some(name);
            }
        }
        self.state = StageState::ShutDown;
        info!(stage = self.name, state = %self.state, "stage shut down");

        if let Some(name) = first_panic {
            return Err(PoolError::WorkerPanicked { name });
        }
        Ok(StageStats {
            workers,
            processed: self.counts.processed.load(Ordering::SeqCst),
            forwarded: self.counts.forwarded.load(Ordering::SeqCst),
        })
    }

    /// The stage's name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of workers in the pool.
    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StageState {
        self.state
    }
}

/// The per-worker loop: pin, then pull/process/forward until exhausted.
fn worker_loop<H>(
    worker_name: &str,
    affinity: AffinitySet,
    handler: Arc<H>,
    source: Arc<dyn ItemSource<H::Input>>,
    downstream: Option<Arc<StageQueue<H::Output>>>,
    counts: Arc<SharedCounts>,
) where
    H: StageHandler,
{
    let span = info_span!("worker", name = worker_name);
    let _guard = span.enter();

    if !affinity.is_empty() {
        match pin_current_thread(&affinity) {
            Ok(()) => debug!(affinity = %affinity, "pinned worker"),
            Err(e) => warn!(affinity = %affinity, error = %e, "CPU pinning failed, continuing unpinned"),
        }
    }

    loop {
        match source.fetch() {
            Fetched::Item(item) => {
                counts.processed.fetch_add(1, Ordering::SeqCst);
                if let Some(output) = handler.process(item) {
                    counts.forwarded.fetch_add(1, Ordering::SeqCst);
                    if let Some(queue) = &downstream {
                        queue.put(output);
                    }
                }
                source.item_done();
            }
            Fetched::Exhausted => break,
        }
    }
    debug!("worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Doubles even numbers, drops odd ones.
    struct EvenDoubler {
        seen: Mutex<Vec<u32>>,
    }

    impl StageHandler for EvenDoubler {
        type Input = u32;
        type Output = u32;

        fn name(&self) -> &'static str {
            "even-doubler"
        }

        fn process(&self, item: u32) -> Option<u32> {
            self.seen
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(item);
            (item % 2 == 0).then_some(item * 2)
        }
    }

    fn unpinned(workers: usize) -> Vec<AffinitySet> {
        (0..workers).map(|_| AffinitySet::unpinned()).collect()
    }

    #[test]
    fn test_pool_processes_and_forwards() {
        let input: Arc<StageQueue<u32>> = Arc::new(StageQueue::unbounded());
        let output: Arc<StageQueue<u32>> = Arc::new(StageQueue::unbounded());
        let handler = Arc::new(EvenDoubler {
            seen: Mutex::new(Vec::new()),
        });

        let mut pool = StagePool::start(
            Arc::clone(&handler),
            Arc::clone(&input) as Arc<dyn ItemSource<u32>>,
            Some(Arc::clone(&output)),
            unpinned(3),
        )
        .expect("start pool");
        assert_eq!(pool.state(), StageState::Running);
        assert_eq!(pool.worker_count(), 3);

        for i in 0..10 {
            input.put(i);
        }
        let stats = pool.drain_and_join().expect("drain");

        assert_eq!(pool.state(), StageState::ShutDown);
        assert_eq!(stats.processed, 10);
        assert_eq!(stats.forwarded, 5);
        assert_eq!(stats.dropped(), 5);

        // All even inputs arrive doubled downstream, none twice.
        let mut results = Vec::new();
        for _ in 0..5 {
            match output.get() {
                Message::Item(v) => results.push(v),
                Message::Shutdown => panic!("unexpected sentinel"),
            }
        }
        results.sort_unstable();
        assert_eq!(results, vec![0, 4, 8, 12, 16]);
        assert!(output.is_empty());
    }

    #[test]
    fn test_drain_with_no_items() {
        let input: Arc<StageQueue<u32>> = Arc::new(StageQueue::unbounded());
        let handler = Arc::new(EvenDoubler {
            seen: Mutex::new(Vec::new()),
        });

        let mut pool = StagePool::start(
            handler,
            Arc::clone(&input) as Arc<dyn ItemSource<u32>>,
            None,
            unpinned(2),
        )
        .expect("start pool");

        let stats = pool.drain_and_join().expect("drain");
        assert_eq!(stats.processed, 0);
        assert_eq!(stats.workers, 2);
    }

    /// Source that hands out a fixed number of items, then reports
    /// exhaustion, the shape of the distributed adapter.
    struct CountdownSource {
        remaining: AtomicUsize,
    }

    impl ItemSource<u32> for CountdownSource {
        fn fetch(&self) -> Fetched<u32> {
            let mut current = self.remaining.load(Ordering::SeqCst);
            loop {
                if current == 0 {
                    return Fetched::Exhausted;
                }
                match self.remaining.compare_exchange(
                    current,
                    current - 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => return Fetched::Item(current as u32),
                    Err(actual) => current = actual,
                }
            }
        }

        fn item_done(&self) {}
        fn wait_idle(&self) {}
        fn request_stop(&self, _workers: usize) {}
    }

    #[test]
    fn test_pool_on_exhaustible_source() {
        let source = Arc::new(CountdownSource {
            remaining: AtomicUsize::new(20),
        });
        let output: Arc<StageQueue<u32>> = Arc::new(StageQueue::unbounded());
        let handler = Arc::new(EvenDoubler {
            seen: Mutex::new(Vec::new()),
        });

        let mut pool = StagePool::start(
            Arc::clone(&handler),
            source as Arc<dyn ItemSource<u32>>,
            Some(Arc::clone(&output)),
            unpinned(4),
        )
        .expect("start pool");

        let stats = pool.drain_and_join().expect("drain");
        assert_eq!(stats.processed, 20);
        // Each item was fetched exactly once across all workers.
        let seen = handler.seen.lock().unwrap_or_else(|e| e.into_inner());
        let mut sorted: Vec<u32> = seen.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (1..=20).collect::<Vec<u32>>());
    }
}
