use serde::Serialize;
use std::{collections::BTreeMap, fmt, path::PathBuf};

/// Identifies a session for the lifetime of the engine. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SessionId(pub(crate) u64);

impl SessionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    /// Id assigned, process not spawned yet
    Starting,
    Running,
    Exited(i32),
}

impl LifecycleState {
    pub fn exit_code(self) -> Option<i32> {
        match self {
            LifecycleState::Exited(code) => Some(code),
            _ => None,
        }
    }
}

/// What to run in a new session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRequest {
    pub argv: Vec<String>,
    /// Applied on top of the engine's base environment
    pub env: BTreeMap<String, String>,
    /// Defaults to the environment's home directory
    pub working_dir: Option<PathBuf>,
    pub title: Option<String>,
    /// Eligible for the shell fallback when it exits with the sentinel code
    pub sandboxed: bool,
    pub(crate) is_fallback: bool,
}

impl SessionRequest {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            working_dir: None,
            title: None,
            sandboxed: false,
            is_fallback: false,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: BTreeMap<String, String>) -> Self {
        self.env.extend(vars);
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn sandboxed(mut self, sandboxed: bool) -> Self {
        self.sandboxed = sandboxed;
        self
    }

    pub fn is_fallback(&self) -> bool {
        self.is_fallback
    }

    /// argv rendered as one shell-quoted line.
    pub fn command_line(&self) -> String {
        quote_command_line(&self.argv)
    }

    /// Explicit title, else the program's file name.
    pub fn display_title(&self) -> String {
        if let Some(title) = &self.title {
            return title.clone();
        }
        self.argv
            .first()
            .map(|program| {
                program
                    .rsplit('/')
                    .next()
                    .unwrap_or(program.as_str())
                    .to_string()
            })
            .unwrap_or_else(|| "session".to_string())
    }

    /// The one retry for a sandboxed request: the same command line through
    /// `shell -c`, unsandboxed, never eligible for another fallback.
    pub(crate) fn fallback(&self, shell: &str) -> Self {
        Self {
            argv: vec![shell.to_string(), "-c".to_string(), self.command_line()],
            env: self.env.clone(),
            working_dir: self.working_dir.clone(),
            title: Some(self.display_title()),
            sandboxed: false,
            is_fallback: true,
        }
    }
}

/// Single-quote an argument for POSIX shells.
pub fn escape_shell_argument(value: &str) -> String {
    if value.contains('\'') {
        format!("'{}'", value.replace('\'', "'\"'\"'"))
    } else {
        format!("'{}'", value)
    }
}

pub(crate) fn quote_command_line(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| escape_shell_argument(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

/// What [`super::SessionEngine::handle_next_event`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Started(SessionId),
    Output { id: SessionId, text: String },
    Exited { id: SessionId, code: i32 },
    /// A fallback session was created
    FallbackStarted(SessionId),
    /// The event referred to a session that is already gone
    Ignored,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_shell_argument() {
        assert_eq!(escape_shell_argument("simple"), "'simple'");
        assert_eq!(escape_shell_argument("it's"), "'it'\"'\"'s'");
        assert_eq!(escape_shell_argument(""), "''");
    }

    #[test]
    fn test_display_title_uses_file_name() {
        assert_eq!(SessionRequest::new(["/bin/bash", "-l"]).display_title(), "bash");
        assert_eq!(
            SessionRequest::new(["sh"]).title("build").display_title(),
            "build"
        );
        assert_eq!(SessionRequest::new(Vec::<String>::new()).display_title(), "session");
    }

    #[test]
    fn test_fallback_wraps_command_line_once() {
        let request = SessionRequest::new(["/data/proot", "-r", "/data/usr", "echo hi"])
            .env("TERM", "xterm-256color")
            .working_dir("/data/home")
            .sandboxed(true);

        let fallback = request.fallback("/bin/sh");
        assert_eq!(
            fallback.argv,
            vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "'/data/proot' '-r' '/data/usr' 'echo hi'".to_string(),
            ]
        );
        assert_eq!(fallback.env, request.env);
        assert_eq!(fallback.working_dir, request.working_dir);
        assert!(!fallback.sandboxed);
        assert!(fallback.is_fallback());
    }
}
