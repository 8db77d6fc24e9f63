//! Command-line interface for bids-app-wrapper.
//!
//! Provides commands for running a wrapped app on one row, previewing the
//! command it would run, and listing the known datatypes.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
