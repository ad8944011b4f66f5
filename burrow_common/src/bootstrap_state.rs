//! Observable bootstrap state for the environment setup.
//!
//! The controller owns one [`BootstrapStateMachine`] and moves it through the
//! setup stages; front ends subscribe and re-render on every change. Uses
//! `tokio::sync::watch` so observers never poll.
//!
//! # Example
//!
//! ```rust,ignore
//! use burrow_common::bootstrap_state::{BootstrapStage, BootstrapStateMachine};
//!
//! let sm = BootstrapStateMachine::new();
//! sm.enter_stage(BootstrapStage::ExtractBinaries).unwrap();
//! sm.enter_stage(BootstrapStage::ExtractRootfs).unwrap();
//! sm.transition_to_ready().unwrap();
//!
//! sm.wait_for_ready().await.unwrap();
//! ```

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// The four ordered stages of a bootstrap run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BootstrapStage {
    ExtractBinaries,
    ExtractRootfs,
    FixPermissions,
    WriteMarker,
}

impl BootstrapStage {
    pub const ALL: [BootstrapStage; 4] = [
        BootstrapStage::ExtractBinaries,
        BootstrapStage::ExtractRootfs,
        BootstrapStage::FixPermissions,
        BootstrapStage::WriteMarker,
    ];

    /// Short label used in logs and progress displays.
    pub fn label(self) -> &'static str {
        match self {
            BootstrapStage::ExtractBinaries => "extract-binaries",
            BootstrapStage::ExtractRootfs => "extract-rootfs",
            BootstrapStage::FixPermissions => "fix-permissions",
            BootstrapStage::WriteMarker => "write-marker",
        }
    }
}

impl fmt::Display for BootstrapStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Bootstrap lifecycle states.
#[derive(Debug, Clone, PartialEq)]
pub enum BootstrapState {
    /// No setup has run in this process yet
    Pending,

    /// A setup run is in progress
    Running { stage: BootstrapStage },

    /// The environment is ready for sessions
    Ready,

    /// The last setup run failed; a retry or reset is needed
    Failed { error: String },
}

impl BootstrapState {
    pub fn is_ready(&self) -> bool {
        matches!(self, BootstrapState::Ready)
    }

    /// Ready and Failed end a run. Both can be left again through `reset`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BootstrapState::Ready | BootstrapState::Failed { .. })
    }

    pub fn stage(&self) -> Option<BootstrapStage> {
        match self {
            BootstrapState::Running { stage } => Some(*stage),
            _ => None,
        }
    }
}

/// Bootstrap state machine backed by a watch channel.
#[derive(Clone)]
pub struct BootstrapStateMachine {
    sender: Arc<watch::Sender<BootstrapState>>,
    // Keep a receiver so sends never fail for lack of subscribers
    _receiver: watch::Receiver<BootstrapState>,
}

impl BootstrapStateMachine {
    /// Create a state machine in the Pending state
    pub fn new() -> Self {
        Self::with_state(BootstrapState::Pending)
    }

    /// Create a state machine that is already Ready (marker found on disk)
    pub fn new_ready() -> Self {
        Self::with_state(BootstrapState::Ready)
    }

    fn with_state(state: BootstrapState) -> Self {
        let (sender, receiver) = watch::channel(state);
        Self {
            sender: Arc::new(sender),
            _receiver: receiver,
        }
    }

    pub fn current(&self) -> BootstrapState {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<BootstrapState> {
        self.sender.subscribe()
    }

    /// Enter `stage`. Allowed from Pending (first stage only) or from an
    /// earlier stage of the same run.
    pub fn enter_stage(&self, stage: BootstrapStage) -> Result<(), &'static str> {
        let mut transitioned = false;
        self.sender.send_if_modified(|state| {
            let allowed = match state {
                BootstrapState::Pending => stage == BootstrapStage::ExtractBinaries,
                BootstrapState::Running { stage: current } => *current < stage,
                _ => false,
            };
            if allowed {
                *state = BootstrapState::Running { stage };
                transitioned = true;
            }
            allowed
        });
        if transitioned {
            Ok(())
        } else {
            Err("Stages must start from Pending and advance in order")
        }
    }

    /// Running(WriteMarker) -> Ready
    pub fn transition_to_ready(&self) -> Result<(), &'static str> {
        let mut transitioned = false;
        self.sender.send_if_modified(|state| {
            if matches!(
                state,
                BootstrapState::Running {
                    stage: BootstrapStage::WriteMarker
                }
            ) {
                *state = BootstrapState::Ready;
                transitioned = true;
                true
            } else {
                false
            }
        });
        if transitioned {
            Ok(())
        } else {
            Err("Can only become Ready after the marker stage")
        }
    }

    /// Any non-terminal state -> Failed
    pub fn transition_to_failed(&self, error: String) -> Result<(), &'static str> {
        let mut transitioned = false;
        self.sender.send_if_modified(|state| {
            if !state.is_terminal() {
                *state = BootstrapState::Failed {
                    error: error.clone(),
                };
                transitioned = true;
                true
            } else {
                false
            }
        });
        if transitioned {
            Ok(())
        } else {
            Err("Cannot fail from a terminal state")
        }
    }

    /// Return to Pending after a reset or before a retry. A run in progress
    /// cannot be reset.
    pub fn reset(&self) -> Result<(), &'static str> {
        let mut transitioned = false;
        self.sender.send_if_modified(|state| {
            if state.is_terminal() {
                *state = BootstrapState::Pending;
                transitioned = true;
                true
            } else {
                false
            }
        });
        if transitioned || self.current() == BootstrapState::Pending {
            Ok(())
        } else {
            Err("Cannot reset while a setup run is in progress")
        }
    }

    /// Wait until Ready. Returns the failure message if the run fails.
    pub async fn wait_for_ready(&self) -> Result<(), String> {
        let mut rx = self.sender.subscribe();
        loop {
            {
                let state = rx.borrow_and_update();
                match &*state {
                    BootstrapState::Ready => return Ok(()),
                    BootstrapState::Failed { error } => return Err(error.clone()),
                    _ => {}
                }
            }
            if rx.changed().await.is_err() {
                return Err("State machine dropped".to_string());
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.sender.borrow().is_ready()
    }
}

impl Default for BootstrapStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
