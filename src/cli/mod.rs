//! Command-line interface definitions and helpers.
//!
//! This module contains all CLI argument parsing and subcommand handlers.

mod args;
mod commands;

pub use args::{Args, Command, ConfigAction, ExportArgs, RecordArgs};
pub use commands::{export, handle_config_action, list_cameras, record};
