//! # Session Orchestration Engine
//!
//! Owns the ordered collection of terminal sessions and the index of the
//! active one. All mutation happens through `&mut self` on a single control
//! task; PTY pumps and exit waiters talk back through one event channel that
//! the control task drains with [`SessionEngine::handle_next_event`].
//!
//! ## Lifecycle
//!
//! `Starting → Running → Exited(code)`, then removed by
//! [`SessionEngine::close_session`]. Spawn failures take the exit path with
//! code 126 (not executable) or 127 (anything else).
//!
//! ## Shell fallback
//!
//! A sandboxed session that exits with the sentinel code gets exactly one
//! retry: after a short delay the same command line is started through
//! `<shell> -c`, unsandboxed. The retry is never retried.
//!
//! ## Observers
//!
//! [`SessionEngine::subscribe`] hands out a generation counter that bumps on
//! create, close, active change and exit.

mod pty;
mod terminal;
mod types;

pub use pty::{EXIT_NOT_EXECUTABLE, EXIT_SPAWN_FAILED};
pub use terminal::{TerminalBuffer, Utf8Decoder};
pub use types::{
    LifecycleState, SessionEvent, SessionId, SessionRequest, escape_shell_argument,
};
pub(crate) use types::quote_command_line;

use crate::{config::BurrowConfig, environment::Environment};
use portable_pty::PtySize;
use pty::{ProcessHandle, SessionPipes, SpawnSpec};
use std::{collections::BTreeMap, fmt, path::PathBuf, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};

/// Prefix added to a session's title once its process is gone.
pub const EXITED_TITLE_PREFIX: &str = "[exited] ";

/// `PATH` in the base environment. Fixed, never read from the host.
pub const BASE_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

pub fn exit_banner(code: i32) -> String {
    format!("\r\n[Process exited with code {code}]\r\n")
}

/// Engine tunables, usually derived from [`BurrowConfig`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub fallback_exit_code: i32,
    pub fallback_delay: Duration,
    pub fallback_shell: String,
    pub scrollback_bytes: usize,
    pub cols: u16,
    pub rows: u16,
    /// How long an exit waits for remaining output
    pub exit_drain: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&BurrowConfig::default())
    }
}

impl From<&BurrowConfig> for EngineSettings {
    fn from(config: &BurrowConfig) -> Self {
        Self {
            fallback_exit_code: config.fallback_exit_code,
            fallback_delay: Duration::from_millis(config.fallback_delay_ms),
            fallback_shell: config.fallback_shell.clone(),
            scrollback_bytes: config.scrollback_bytes,
            cols: config.terminal_cols,
            rows: config.terminal_rows,
            exit_drain: Duration::from_millis(config.exit_drain_ms),
        }
    }
}

/// Messages from pumps and timers to the control task.
pub(crate) enum EngineEvent {
    Spawned { id: SessionId, handle: ProcessHandle },
    SpawnFailed { id: SessionId, code: i32, error: String },
    Output { id: SessionId, text: String },
    Exited { id: SessionId, code: i32 },
    FallbackDue { request: SessionRequest },
}

/// One terminal session.
pub struct Session {
    id: SessionId,
    title: String,
    state: LifecycleState,
    request: SessionRequest,
    terminal: TerminalBuffer,
    input: mpsc::UnboundedSender<Vec<u8>>,
    size: watch::Sender<PtySize>,
    process: Option<ProcessHandle>,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn request(&self) -> &SessionRequest {
        &self.request
    }

    pub fn terminal(&self) -> &TerminalBuffer {
        &self.terminal
    }

    pub fn text(&self) -> &str {
        self.terminal.text()
    }

    fn kill(&mut self) {
        if let Some(mut process) = self.process.take()
            && let Err(e) = process.killer.kill()
        {
            tracing::debug!("Killing session {} failed: {e}", self.id);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

pub struct SessionEngine {
    sessions: Vec<Session>,
    active: Option<usize>,
    next_id: u64,
    settings: EngineSettings,
    home: PathBuf,
    base_env: BTreeMap<String, String>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    generation: watch::Sender<u64>,
    /// Pending shell fallback timers
    fallbacks: Vec<JoinHandle<()>>,
}

impl SessionEngine {
    pub fn new(env: &Environment, settings: EngineSettings) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (generation, _) = watch::channel(0);
        Self {
            sessions: Vec::new(),
            active: None,
            next_id: 1,
            settings,
            home: env.home_path().to_path_buf(),
            base_env: base_environment(env),
            events_tx,
            events_rx,
            generation,
            fallbacks: Vec::new(),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Append a session for `request`, make it active and start its process
    /// in the background. Never fails; spawn errors surface as an exit.
    pub fn create_session(&mut self, request: SessionRequest) -> SessionId {
        let id = SessionId(self.next_id);
        self.next_id += 1;

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (size_tx, size_rx) = watch::channel(PtySize {
            rows: self.settings.rows,
            cols: self.settings.cols,
            pixel_width: 0,
            pixel_height: 0,
        });

        let mut env = self.base_env.clone();
        env.extend(request.env.clone());
        let spec = SpawnSpec {
            argv: request.argv.clone(),
            env,
            cwd: request
                .working_dir
                .clone()
                .unwrap_or_else(|| self.home.clone()),
        };

        tracing::info!(
            "Creating session {id} ({}){}",
            request.command_line(),
            if request.is_fallback() { " as fallback" } else { "" }
        );
        self.sessions.push(Session {
            id,
            title: request.display_title(),
            state: LifecycleState::Starting,
            request,
            terminal: TerminalBuffer::new(self.settings.scrollback_bytes),
            input: input_tx,
            size: size_tx,
            process: None,
        });
        self.active = Some(self.sessions.len() - 1);
        self.notify();

        let events = self.events_tx.clone();
        let drain = self.settings.exit_drain;
        let pipes = SessionPipes {
            input: input_rx,
            size: size_rx,
        };
        tokio::task::spawn_blocking(move || pty::spawn_session(id, spec, pipes, events, drain));

        id
    }

    /// Kill and remove a session. Unknown ids are ignored.
    pub fn close_session(&mut self, id: SessionId) {
        let Some(index) = self.index_of(id) else {
            return;
        };
        let mut session = self.sessions.remove(index);
        session.kill();
        tracing::info!("Closed session {id}");

        if let Some(active) = self.active
            && index <= active
        {
            self.active = if self.sessions.is_empty() {
                None
            } else {
                Some(active.saturating_sub(1).min(self.sessions.len() - 1))
            };
        }
        self.notify();
    }

    /// Switch the active session. Notifies only if the active index changes.
    pub fn set_active_session(&mut self, id: SessionId) {
        let Some(index) = self.index_of(id) else {
            return;
        };
        if self.active != Some(index) {
            self.active = Some(index);
            self.notify();
        }
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn active_index(&self) -> Option<usize> {
        self.active
    }

    pub fn active_session(&self) -> Option<&Session> {
        self.active.and_then(|i| self.sessions.get(i))
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Generation counter bumped on every observable change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Queue keystrokes for a session. Input sent before the process is up
    /// is delivered once it starts. Returns false for unknown or exited ids.
    pub fn write_input(&self, id: SessionId, data: &str) -> bool {
        match self.session(id) {
            Some(session) if !matches!(session.state, LifecycleState::Exited(_)) => {
                session.input.send(data.as_bytes().to_vec()).is_ok()
            }
            _ => false,
        }
    }

    pub fn resize(&self, id: SessionId, cols: u16, rows: u16) -> bool {
        let Some(session) = self.session(id) else {
            return false;
        };
        session.size.send_modify(|size| {
            size.cols = cols;
            size.rows = rows;
        });
        true
    }

    /// Wait for the next event from a session's pumps and apply it.
    /// Cancel safe: an event is either fully applied or still queued.
    pub async fn handle_next_event(&mut self) -> SessionEvent {
        // The engine holds a sender, so the channel never closes
        let Some(event) = self.events_rx.recv().await else {
            return SessionEvent::Ignored;
        };
        self.apply(event)
    }

    /// Apply events until none arrive for `quiet`.
    pub async fn settle(&mut self, quiet: Duration) {
        while tokio::time::timeout(quiet, self.handle_next_event())
            .await
            .is_ok()
        {}
    }

    /// Apply events until `done` holds or `limit` elapses. Returns whether
    /// `done` held.
    pub async fn run_until<F>(&mut self, limit: Duration, mut done: F) -> bool
    where
        F: FnMut(&SessionEngine) -> bool,
    {
        let deadline = Instant::now() + limit;
        while !done(self) {
            if tokio::time::timeout_at(deadline, self.handle_next_event())
                .await
                .is_err()
            {
                return done(self);
            }
        }
        true
    }

    /// Kill every process, cancel pending fallbacks and clear the collection.
    pub fn shutdown(&mut self) {
        self.kill_all();
        let had_sessions = !self.sessions.is_empty();
        self.sessions.clear();
        self.active = None;
        if had_sessions {
            self.notify();
        }
    }

    fn apply(&mut self, event: EngineEvent) -> SessionEvent {
        match event {
            EngineEvent::Spawned { id, mut handle } => {
                let Some(session) = self.session_mut(id) else {
                    // Closed while starting
                    if let Err(e) = handle.killer.kill() {
                        tracing::debug!("Killing orphaned session {id} failed: {e}");
                    }
                    return SessionEvent::Ignored;
                };
                session.state = LifecycleState::Running;
                session.process = Some(handle);
                SessionEvent::Started(id)
            }
            EngineEvent::SpawnFailed { id, code, error } => {
                if let Some(session) = self.session_mut(id) {
                    session.terminal.append(&format!("{error}\r\n"));
                }
                self.mark_exited(id, code)
            }
            EngineEvent::Output { id, text } => match self.session_mut(id) {
                Some(session) => {
                    session.terminal.append(&text);
                    SessionEvent::Output { id, text }
                }
                None => SessionEvent::Ignored,
            },
            EngineEvent::Exited { id, code } => self.mark_exited(id, code),
            EngineEvent::FallbackDue { request } => {
                let id = self.create_session(request);
                SessionEvent::FallbackStarted(id)
            }
        }
    }

    fn mark_exited(&mut self, id: SessionId, code: i32) -> SessionEvent {
        let sentinel = self.settings.fallback_exit_code;
        let shell = self.settings.fallback_shell.clone();
        let Some(session) = self.session_mut(id) else {
            return SessionEvent::Ignored;
        };
        session.state = LifecycleState::Exited(code);
        session.process = None;
        session.terminal.append(&exit_banner(code));
        session.title = format!("{EXITED_TITLE_PREFIX}{}", session.title);
        tracing::info!("Session {id} exited with code {code}");

        let fallback = (session.request.sandboxed
            && !session.request.is_fallback()
            && code == sentinel)
            .then(|| session.request.fallback(&shell));
        self.notify();

        if let Some(request) = fallback {
            tracing::warn!(
                "Session {id} exited with {code}; retrying through {shell} in {}ms",
                self.settings.fallback_delay.as_millis()
            );
            let events = self.events_tx.clone();
            let delay = self.settings.fallback_delay;
            self.fallbacks.retain(|timer| !timer.is_finished());
            self.fallbacks.push(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = events.send(EngineEvent::FallbackDue { request });
            }));
        }

        SessionEvent::Exited { id, code }
    }

    fn index_of(&self, id: SessionId) -> Option<usize> {
        self.sessions.iter().position(|s| s.id == id)
    }

    fn session_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    fn notify(&self) {
        self.generation.send_modify(|generation| *generation += 1);
    }
}

impl SessionEngine {
    /// Kill live sessions plus any process whose start was already queued
    /// but not yet applied. Fallbacks not yet due never start; ones already
    /// queued are dropped with the rest of the queue.
    fn kill_all(&mut self) {
        for timer in self.fallbacks.drain(..) {
            timer.abort();
        }
        for session in &mut self.sessions {
            session.kill();
        }
        while let Ok(event) = self.events_rx.try_recv() {
            if let EngineEvent::Spawned { mut handle, .. } = event {
                let _ = handle.killer.kill();
            }
        }
    }
}

impl Drop for SessionEngine {
    fn drop(&mut self) {
        self.kill_all();
    }
}

/// Variables every session starts from, before its own overlay.
fn base_environment(env: &Environment) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("HOME".to_string(), env.home_path().display().to_string()),
        ("TERM".to_string(), "xterm-256color".to_string()),
        ("LANG".to_string(), "en_US.UTF-8".to_string()),
        ("PATH".to_string(), BASE_PATH.to_string()),
        ("TMPDIR".to_string(), env.tmp_path().display().to_string()),
    ])
}
