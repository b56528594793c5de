//! Command-line interface for jobforge.
//!
//! Provides commands for running a dispatcher, enqueueing jobs, one-shot
//! recovery and inspecting queue and job state.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
