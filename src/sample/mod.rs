//! SRA sample definitions and the definition-file loader.
//!
//! A [`Sample`] is one unit of work flowing through the pipeline: an SRA
//! accession, the 1-based index of its line in the definitions file, and the
//! sharded output directory derived from the accession. The loader reads the
//! tab-separated definitions file, applies optional SLURM task-array
//! partitioning, and skips samples whose final artifact already exists so an
//! interrupted run can be resubmitted as-is.

pub mod definition;
pub mod loader;

// Re-export main types for convenience
pub use definition::Sample;
pub use loader::{load_definitions, LoadError, Partition};
