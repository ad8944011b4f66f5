//! Diagnostics sink for the bootstrap pipeline
//!
//! The pipeline reports notable transitions (stage boundaries, extraction
//! totals, probe outcomes) to an injected [`DiagnosticsSink`]. Sinks cannot
//! fail: `record` returns nothing, so no sink can change whether setup
//! succeeds.
//!
//! ## Key Components
//!
//! - [`BootstrapEvent`]: what happened
//! - [`TracingDiagnostics`]: forwards events to `tracing` (the default)
//! - [`ChannelDiagnostics`]: pushes events into an mpsc channel for a UI or a test
//! - [`NoOpDiagnostics`]: discards everything
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use burrow::diagnostics::{BootstrapEvent, DiagnosticsSink, TracingDiagnostics};
//! use burrow_common::bootstrap_state::BootstrapStage;
//!
//! #[tokio::main]
//! async fn main() {
//!     let sink: Box<dyn DiagnosticsSink> = Box::new(TracingDiagnostics);
//!     sink.record(BootstrapEvent::StageStarted {
//!         stage: BootstrapStage::ExtractRootfs,
//!     })
//!     .await;
//! }
//! ```

use async_trait::async_trait;
use burrow_common::bootstrap_state::BootstrapStage;
use std::fmt;
use tokio::sync::mpsc;

/// Notable transitions during a bootstrap run.
#[derive(Debug, Clone, PartialEq)]
pub enum BootstrapEvent {
    StageStarted {
        stage: BootstrapStage,
    },
    StageCompleted {
        stage: BootstrapStage,
        duration_ms: u64,
    },
    /// One binary asset was written
    AssetExtracted {
        name: String,
        bytes: usize,
    },
    /// Totals for the rootfs unpack
    RootfsExtracted {
        files: usize,
        directories: usize,
        bytes: u64,
    },
    /// Non-fatal problem; setup continues
    Warning {
        stage: BootstrapStage,
        message: String,
    },
    /// Fatal problem; the run ends with an error
    Failed {
        stage: BootstrapStage,
        error: String,
    },
    Completed {
        timestamp: String,
        duration_ms: u64,
    },
}

impl fmt::Display for BootstrapEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapEvent::StageStarted { stage } => write!(f, "[{stage}] started"),
            BootstrapEvent::StageCompleted { stage, duration_ms } => {
                write!(f, "[{stage}] completed in {duration_ms}ms")
            }
            BootstrapEvent::AssetExtracted { name, bytes } => {
                write!(f, "[extract-binaries] wrote {name} ({bytes} bytes)")
            }
            BootstrapEvent::RootfsExtracted {
                files,
                directories,
                bytes,
            } => write!(
                f,
                "[extract-rootfs] unpacked {files} files, {directories} directories, {bytes} bytes"
            ),
            BootstrapEvent::Warning { stage, message } => {
                write!(f, "[{stage}] warning: {message}")
            }
            BootstrapEvent::Failed { stage, error } => write!(f, "[{stage}] FAILED: {error}"),
            BootstrapEvent::Completed {
                timestamp,
                duration_ms,
            } => write!(f, "setup completed at {timestamp} after {duration_ms}ms"),
        }
    }
}

/// Receives bootstrap diagnostics.
#[async_trait]
pub trait DiagnosticsSink: Send + Sync {
    async fn record(&self, event: BootstrapEvent);
}

/// Writes each event to the `tracing` log at a level matching its severity.
pub struct TracingDiagnostics;

#[async_trait]
impl DiagnosticsSink for TracingDiagnostics {
    async fn record(&self, event: BootstrapEvent) {
        match &event {
            BootstrapEvent::Warning { .. } => tracing::warn!("bootstrap: {event}"),
            BootstrapEvent::Failed { .. } => tracing::error!("bootstrap: {event}"),
            BootstrapEvent::Completed { .. } | BootstrapEvent::RootfsExtracted { .. } => {
                tracing::info!("bootstrap: {event}")
            }
            _ => tracing::debug!("bootstrap: {event}"),
        }
    }
}

/// Forwards events into an unbounded channel. A dropped receiver is ignored.
pub struct ChannelDiagnostics {
    sender: mpsc::UnboundedSender<BootstrapEvent>,
}

impl ChannelDiagnostics {
    pub fn new(sender: mpsc::UnboundedSender<BootstrapEvent>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl DiagnosticsSink for ChannelDiagnostics {
    async fn record(&self, event: BootstrapEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("diagnostics receiver dropped");
        }
    }
}

pub struct NoOpDiagnostics;

#[async_trait]
impl DiagnosticsSink for NoOpDiagnostics {
    async fn record(&self, _event: BootstrapEvent) {}
}

/// Create a channel-backed sink and the receiving end.
pub fn channel_diagnostics() -> (
    Box<dyn DiagnosticsSink>,
    mpsc::UnboundedReceiver<BootstrapEvent>,
) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Box::new(ChannelDiagnostics::new(sender)), receiver)
}
