//! Command-line interface definitions.
//!
//! - `Cli`, `Commands`: CLI argument definitions via clap
//! - `Display`: formatted terminal output

mod commands;
mod display;

pub use commands::{Cli, Commands, OutputFormat, StartArgs, StatusFilterArg};
pub use display::Display;
