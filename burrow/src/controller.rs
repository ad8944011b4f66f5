//! Wires the bootstrap pipeline to the session engine.
//!
//! The controller owns everything one terminal host needs: configuration,
//! the resolved environment, the bootstrap state machine and the engine. It
//! runs setup once (bounded by the configured timeout), opens the default
//! sandboxed session, and reopens one when the last session is closed if
//! `respawn_on_empty` is set.

use crate::{
    assets::{AssetSource, DirectoryAssets},
    bootstrap::{BootstrapError, BootstrapReport, Bootstrapper},
    command::build_sandbox_invocation,
    config::BurrowConfig,
    diagnostics::DiagnosticsSink,
    environment::{Environment, FixedPathSupplier, HostPathSupplier, ProjectDirsSupplier},
    session::{EngineSettings, SessionEngine, SessionEvent, SessionId, SessionRequest},
};
use anyhow::{Context, Result};
use burrow_common::bootstrap_state::BootstrapStateMachine;
use std::sync::Arc;

/// How the default session is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMode {
    /// The sandbox invocation from the command builder
    Sandboxed,
    /// A plain host shell, bypassing the sandbox
    HostShell,
    /// An explicit command; sandboxed runs it inside the guest shell
    Command { argv: Vec<String>, sandboxed: bool },
}

pub struct Controller {
    config: BurrowConfig,
    env: Environment,
    bootstrapper: Bootstrapper,
    state: BootstrapStateMachine,
    engine: SessionEngine,
    mode: SessionMode,
}

impl Controller {
    /// Resolve the environment and asset source from `config`.
    pub fn from_config(config: BurrowConfig) -> Result<Self> {
        let supplier: Box<dyn HostPathSupplier> = match &config.base_dir {
            Some(dir) => Box::new(FixedPathSupplier::new(dir)),
            None => Box::new(ProjectDirsSupplier),
        };
        let env = Environment::resolve(supplier.as_ref())
            .context("Failed to prepare the environment base directory")?;
        let assets = Arc::new(DirectoryAssets::new(config.resolve_assets_dir()));
        Ok(Self::new(config, env, assets))
    }

    pub fn new(config: BurrowConfig, env: Environment, assets: Arc<dyn AssetSource>) -> Self {
        let state = if env.setup_complete() {
            BootstrapStateMachine::new_ready()
        } else {
            BootstrapStateMachine::new()
        };
        let bootstrapper = Bootstrapper::new(env.clone(), assets).with_state(state.clone());
        let engine = SessionEngine::new(&env, EngineSettings::from(&config));
        Self {
            config,
            env,
            bootstrapper,
            state,
            engine,
            mode: SessionMode::Sandboxed,
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        self.bootstrapper = self.bootstrapper.with_diagnostics(diagnostics);
        self
    }

    pub fn with_mode(mut self, mode: SessionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn config(&self) -> &BurrowConfig {
        &self.config
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    pub fn bootstrap_state(&self) -> &BootstrapStateMachine {
        &self.state
    }

    pub fn bootstrapper(&self) -> &Bootstrapper {
        &self.bootstrapper
    }

    pub fn engine(&self) -> &SessionEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut SessionEngine {
        &mut self.engine
    }

    /// Run setup unless the marker already exists. Returns the report of the
    /// run, or `None` when nothing had to be done.
    pub async fn ensure_environment(&self) -> Result<Option<BootstrapReport>, BootstrapError> {
        if self.env.setup_complete() {
            tracing::debug!("Environment already set up at {:?}", self.env.base_path());
            return Ok(None);
        }
        let report = self
            .bootstrapper
            .prepare_with_timeout(self.config.setup_timeout())
            .await?;
        Ok(Some(report))
    }

    /// The request the current mode starts sessions with.
    pub fn default_request(&self) -> SessionRequest {
        match &self.mode {
            SessionMode::Sandboxed => build_sandbox_invocation(&self.env).into(),
            SessionMode::HostShell => SessionRequest::new([self.config.fallback_shell.clone()])
                .working_dir(self.env.home_path()),
            SessionMode::Command { argv, sandboxed: false } => {
                SessionRequest::new(argv.clone()).working_dir(self.env.home_path())
            }
            SessionMode::Command { argv, sandboxed: true } => {
                let mut request: SessionRequest = build_sandbox_invocation(&self.env).into();
                // Replace the trailing login flag with `-c <command>`
                request.argv.pop();
                request.argv.push("-c".to_string());
                request
                    .argv
                    .push(crate::session::quote_command_line(argv));
                request
            }
        }
    }

    pub fn open_default_session(&mut self) -> SessionId {
        let request = self.default_request();
        self.engine.create_session(request)
    }

    pub fn close_session(&mut self, id: SessionId) {
        self.engine.close_session(id);
        self.respawn_if_empty();
    }

    /// Apply one engine event, then the empty-collection policy.
    pub async fn step(&mut self) -> SessionEvent {
        let event = self.engine.handle_next_event().await;
        self.respawn_if_empty();
        event
    }

    /// Remove the environment's extracted contents. Sessions are shut down
    /// first since they run out of the rootfs.
    pub async fn reset(&mut self) -> Result<()> {
        self.engine.shutdown();
        self.bootstrapper
            .reset()
            .await
            .with_context(|| format!("Failed to reset {:?}", self.env.base_path()))
    }

    pub fn shutdown(&mut self) {
        self.engine.shutdown();
    }

    fn respawn_if_empty(&mut self) {
        if self.config.respawn_on_empty && self.engine.is_empty() && self.state.is_ready() {
            tracing::info!("Last session closed, opening a new default session");
            self.open_default_session();
        }
    }
}
