//! # Shell Module
//!
//! Entry point and CLI logic for the `burrow` binary.
//!
//! ## Sub-modules
//!
//! - **`cli`**: argument parsing and subcommand dispatch

pub mod cli;

pub use cli::{Cli, Command, run};
