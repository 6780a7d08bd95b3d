//! CLI module for the converge tool.
//!
//! This module provides the command-line interface for editing desired
//! state and driving reconciliation.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, ScopeArgs, StateCommands};
pub use output::OutputFormatter;
