//! Command-line interface for srapipe.
//!
//! Provides the `run` command that drives the three-stage pipeline over a
//! sample definitions file, node-locally or distributed over Redis.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands, RunArgs};
