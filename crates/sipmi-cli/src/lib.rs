//! CLI for the SIP server management interface.
//!
//! This crate provides the `sipmi` command-line interface.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod signals;

pub use cli::Cli;
pub use error::{CliError, CliResult};
