//! # Burrow
//!
//! Runs a full Linux userland on a device without root. Two halves:
//!
//! - **Environment bootstrap**: [`bootstrap::Bootstrapper`] turns bundled
//!   assets (a user-space sandbox binary, its loader and libraries, and a
//!   gzip tar rootfs) into a ready [`environment::Environment`], marked done
//!   by a `.setup_complete` file.
//! - **Session orchestration**: [`session::SessionEngine`] keeps an ordered
//!   collection of PTY-backed terminal sessions, tracks the active one, and
//!   retries a sandboxed session through a plain shell once if the sandbox
//!   cannot execute.
//!
//! [`controller::Controller`] ties the two together; [`shell`] is the CLI.

#[cfg(not(unix))]
compile_error!("burrow needs PTYs and POSIX permissions; only unix targets are supported");

pub mod assets;
pub mod bootstrap;
pub mod command;
pub mod config;
pub mod controller;
pub mod diagnostics;
pub mod environment;
pub mod session;
pub mod shell;
pub mod utils;

pub use bootstrap::{BootstrapError, BootstrapReport, Bootstrapper};
pub use config::BurrowConfig;
pub use controller::{Controller, SessionMode};
pub use environment::Environment;
pub use session::{SessionEngine, SessionId, SessionRequest};
