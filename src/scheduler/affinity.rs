//! Worker CPU affinity assignment and pinning.
//!
//! Each worker thread is assigned a fixed set of CPU ids before pool
//! startup and pins itself once at thread start; assignments are never
//! renegotiated. Two placement strategies are provided:
//!
//! - `simple`: sequential CPU ids, one (or a small block) per worker, for
//!   conventional multi-core nodes
//! - `wide`: a fixed-stride set spanning the hardware threads of one
//!   physical core, for many-core parts where the OS numbers sibling
//!   hardware threads a whole socket apart (e.g. 68-core KNL nodes)
//!
//! `none` disables pinning; platforms without `sched_setaffinity` always
//! behave as `none`.

use std::fmt;
use std::io;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Default CPU id stride between hardware threads of one core (`wide`).
const DEFAULT_CORE_STRIDE: usize = 64;
/// Default hardware threads per physical core (`wide`).
const DEFAULT_THREADS_PER_CORE: usize = 4;

/// CPU placement strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// Sequential CPU ids per worker.
    Simple,
    /// Fixed-stride hardware-thread sets per worker.
    Wide,
    /// No pinning.
    None,
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topology::Simple => write!(f, "simple"),
            Topology::Wide => write!(f, "wide"),
            Topology::None => write!(f, "none"),
        }
    }
}

/// The ordered CPU set one worker thread is pinned to for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AffinitySet(Vec<usize>);

impl AffinitySet {
    /// An empty set, meaning "do not pin".
    pub fn unpinned() -> Self {
        Self::default()
    }

    /// The CPU ids in this set.
    pub fn cpus(&self) -> &[usize] {
        &self.0
    }

    /// Whether this set requests no pinning.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<usize>> for AffinitySet {
    fn from(cpus: Vec<usize>) -> Self {
        Self(cpus)
    }
}

impl fmt::Display for AffinitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, cpu) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{cpu}")?;
        }
        write!(f, "]")
    }
}

/// Computes per-worker affinity sets for a chosen topology.
///
/// Workers across all pools share one sequence of slots; the orchestrator
/// hands out slot numbers in pool-startup order so no two workers overlap.
#[derive(Debug, Clone, Copy)]
pub struct AffinityStrategy {
    topology: Topology,
    /// CPU ids given to each `simple` worker.
    cpus_per_worker: usize,
    /// CPU id distance between sibling hardware threads (`wide`).
    core_stride: usize,
    /// Hardware threads per physical core (`wide`).
    threads_per_core: usize,
}

impl AffinityStrategy {
    /// Creates a strategy with default topology parameters.
    pub fn new(topology: Topology) -> Self {
        Self {
            topology,
            cpus_per_worker: 1,
            core_stride: DEFAULT_CORE_STRIDE,
            threads_per_core: DEFAULT_THREADS_PER_CORE,
        }
    }

    /// Sets how many sequential CPUs each `simple` worker receives.
    pub fn with_cpus_per_worker(mut self, cpus: usize) -> Self {
        self.cpus_per_worker = cpus.max(1);
        self
    }

    /// Sets the `wide` stride between sibling hardware threads.
    pub fn with_core_stride(mut self, stride: usize) -> Self {
        self.core_stride = stride.max(1);
        self
    }

    /// Sets the `wide` hardware-thread count per core.
    pub fn with_threads_per_core(mut self, threads: usize) -> Self {
        self.threads_per_core = threads.max(1);
        self
    }

    /// The affinity set for worker slot `slot` (0-based, global across
    /// pools).
    pub fn assign(&self, slot: usize) -> AffinitySet {
        match self.topology {
            Topology::Simple => {
                let first = slot * self.cpus_per_worker;
                AffinitySet((first..first + self.cpus_per_worker).collect())
            }
            Topology::Wide => AffinitySet(
                (0..self.threads_per_core)
                    .map(|k| slot + k * self.core_stride + 1)
                    .collect(),
            ),
            Topology::None => AffinitySet::unpinned(),
        }
    }
}

/// Pins the calling thread to the given CPU set.
///
/// An empty set is a no-op. Failures are reported so the worker can log
/// and continue unpinned.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(set: &AffinitySet) -> io::Result<()> {
    if set.is_empty() {
        return Ok(());
    }

    // SAFETY: cpu_set_t is a plain bitmask; CPU_ZERO/CPU_SET only write
    // within it, and sched_setaffinity reads it.
    unsafe {
        let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut cpuset);
        for &cpu in set.cpus() {
            if cpu >= libc::CPU_SETSIZE as usize {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("CPU id {cpu} out of range"),
                ));
            }
            libc::CPU_SET(cpu, &mut cpuset);
        }
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpuset) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Pinning is unsupported on this platform; always succeeds as a no-op.
#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_set: &AffinitySet) -> io::Result<()> {
    Ok(())
}
