//! # Burrow CLI
//!
//! Command-line definition and the `run` entry point used by the binary.

use crate::{
    config::BurrowConfig,
    controller::{Controller, SessionMode},
    session::{SessionEvent, exit_banner},
    utils::logging::init_logging,
};
use anyhow::{Context, Result};
use burrow_common::bootstrap_state::BootstrapState;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Burrow: a Linux userland in a user-space sandbox, plus terminal sessions
/// running inside it.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to burrow.toml (defaults to the per-user config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Log to stderr instead of the rolling log file
    #[arg(long, global = true)]
    pub log_to_stderr: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Extract the bundled assets and rootfs, unless already done
    Setup {
        /// Override the setup timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Print the setup report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete everything setup extracted
    Reset,
    /// Show where the environment lives and whether it is ready
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Open a terminal session and bridge it to this terminal
    Shell {
        /// Run on the host instead of inside the sandbox
        #[arg(long)]
        no_sandbox: bool,
        /// Command to run instead of a login shell
        #[arg(last = true)]
        command: Vec<String>,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    init_logging(log_level, !cli.log_to_stderr)?;

    let config = match &cli.config {
        Some(path) => BurrowConfig::load(path),
        None => BurrowConfig::load_default(),
    }
    .context("Failed to load configuration")?;

    match cli.command {
        Command::Setup { timeout, json } => run_setup(config, timeout, json).await,
        Command::Reset => {
            let mut controller = Controller::from_config(config)?;
            controller.reset().await?;
            println!("Reset {}", controller.environment().base_path().display());
            Ok(())
        }
        Command::Status { json } => {
            let controller = Controller::from_config(config)?;
            let status = controller.environment().status();
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("base:  {}", status.base_path.display());
                match &status.completed_at {
                    Some(at) => println!("setup: complete ({at})"),
                    None => println!("setup: not done"),
                }
                for dir in &status.missing_directories {
                    println!("missing: {}", dir.display());
                }
            }
            Ok(())
        }
        Command::Shell {
            no_sandbox,
            command,
        } => {
            let code = run_shell(config, no_sandbox, command).await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
    }
}

async fn run_setup(mut config: BurrowConfig, timeout: Option<u64>, json: bool) -> Result<()> {
    if let Some(secs) = timeout {
        config.setup_timeout_secs = secs;
    }
    config.validate()?;
    let controller = Controller::from_config(config)?;

    let progress = spawn_progress_printer(&controller);
    let result = controller.ensure_environment().await;
    progress.abort();

    match result.context("Setup failed")? {
        Some(report) if json => println!("{}", serde_json::to_string_pretty(&report)?),
        Some(report) => println!(
            "Setup complete: {} files, {} directories, {} bytes in {}ms",
            report.extraction.files,
            report.extraction.directories,
            report.extraction.bytes,
            report.duration_ms
        ),
        None => println!("Already set up"),
    }
    Ok(())
}

/// Echo bootstrap stage changes to stderr while setup runs.
fn spawn_progress_printer(controller: &Controller) -> tokio::task::JoinHandle<()> {
    let mut updates = controller.bootstrap_state().subscribe();
    tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let state = updates.borrow_and_update().clone();
            match state {
                BootstrapState::Running { stage } => eprintln!("==> {stage}"),
                BootstrapState::Failed { error } => eprintln!("==> failed: {error}"),
                BootstrapState::Ready => eprintln!("==> ready"),
                BootstrapState::Pending => {}
            }
        }
    })
}

/// Bridge host stdin lines into the active session and its output to
/// stdout. Returns the exit code of the session the bridge ended on.
async fn run_shell(mut config: BurrowConfig, no_sandbox: bool, command: Vec<String>) -> Result<i32> {
    // One-shot: the bridge ends with the session
    config.respawn_on_empty = false;
    let sentinel = config.fallback_exit_code;

    let mode = match (command.is_empty(), no_sandbox) {
        (true, false) => SessionMode::Sandboxed,
        (true, true) => SessionMode::HostShell,
        (false, _) => SessionMode::Command {
            argv: command,
            sandboxed: !no_sandbox,
        },
    };
    let mut controller = Controller::from_config(config)?.with_mode(mode);
    if !no_sandbox {
        controller.ensure_environment().await.context("Setup failed")?;
    }

    controller.open_default_session();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut stdin_open = true;

    let code = loop {
        tokio::select! {
            line = stdin.next_line(), if stdin_open => match line? {
                Some(line) => {
                    if let Some(active) = controller.engine().active_session() {
                        controller.engine().write_input(active.id(), &format!("{line}\n"));
                    }
                }
                None => stdin_open = false,
            },
            event = controller.step() => {
                let active = controller.engine().active_session().map(|s| s.id());
                match event {
                    SessionEvent::Output { id, text } if Some(id) == active => {
                        stdout.write_all(text.as_bytes()).await?;
                        stdout.flush().await?;
                    }
                    SessionEvent::Exited { id, code } if Some(id) == active => {
                        stdout.write_all(exit_banner(code).as_bytes()).await?;
                        stdout.flush().await?;
                        let falls_back = controller
                            .engine()
                            .session(id)
                            .is_some_and(|s| s.request().sandboxed && !s.request().is_fallback())
                            && code == sentinel;
                        if !falls_back {
                            break code;
                        }
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break 130;
            }
        }
    };

    controller.shutdown();
    Ok(code)
}
