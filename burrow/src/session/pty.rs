//! PTY process wiring for one session.
//!
//! Everything here runs off the control task. Results come back as
//! [`EngineEvent`]s on one unbounded channel, so per-session output always
//! arrives before that session's exit.

use super::{EngineEvent, SessionId, terminal::Utf8Decoder};
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::{
    collections::BTreeMap,
    io::{self, Read, Write},
    path::PathBuf,
    sync::mpsc as std_mpsc,
    time::Duration,
};
use tokio::sync::{mpsc, watch};

/// Exit code reported when the program exists but may not be executed.
pub const EXIT_NOT_EXECUTABLE: i32 = 126;
/// Exit code reported for any other spawn failure.
pub const EXIT_SPAWN_FAILED: i32 = 127;

const READ_CHUNK: usize = 8192;

/// Fully resolved process description.
#[derive(Debug, Clone)]
pub(crate) struct SpawnSpec {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
}

/// Handle the engine keeps once the process is up.
pub(crate) struct ProcessHandle {
    pub killer: Box<dyn ChildKiller + Send + Sync>,
}

/// Channels the engine holds for a session from the moment it is created.
pub(crate) struct SessionPipes {
    pub input: mpsc::UnboundedReceiver<Vec<u8>>,
    pub size: watch::Receiver<PtySize>,
}

/// Open a PTY, spawn the process and start the pumps. Blocking; the engine
/// calls this from `spawn_blocking`. Failures are reported as
/// [`EngineEvent::SpawnFailed`].
pub(crate) fn spawn_session(
    id: SessionId,
    spec: SpawnSpec,
    pipes: SessionPipes,
    events: mpsc::UnboundedSender<EngineEvent>,
    exit_drain: Duration,
) {
    if let Err(e) = try_spawn(id, spec, pipes, &events, exit_drain) {
        let code = spawn_exit_code(&e);
        tracing::warn!("Session {id} failed to start ({code}): {e:#}");
        let _ = events.send(EngineEvent::SpawnFailed {
            id,
            code,
            error: format!("{e:#}"),
        });
    }
}

fn try_spawn(
    id: SessionId,
    spec: SpawnSpec,
    pipes: SessionPipes,
    events: &mpsc::UnboundedSender<EngineEvent>,
    exit_drain: Duration,
) -> anyhow::Result<()> {
    let Some(program) = spec.argv.first() else {
        anyhow::bail!("empty argv");
    };

    let mut command = CommandBuilder::new(program);
    command.args(&spec.argv[1..]);
    command.env_clear();
    for (key, value) in &spec.env {
        command.env(key, value);
    }
    command.cwd(&spec.cwd);

    let size = *pipes.size.borrow();
    let pair = native_pty_system().openpty(size)?;
    let mut child = pair.slave.spawn_command(command)?;
    // Only the child keeps the slave side open, so EOF on the reader means
    // every process attached to the terminal is gone
    drop(pair.slave);

    let reader = pair.master.try_clone_reader()?;
    let writer = pair.master.take_writer()?;
    let killer = child.clone_killer();
    let pid = child.process_id();
    tracing::debug!("Session {id} spawned {program} (pid {pid:?})");

    if events
        .send(EngineEvent::Spawned {
            id,
            handle: ProcessHandle { killer },
        })
        .is_err()
    {
        // Engine gone; nobody will ever close this session
        let _ = child.kill();
        return Ok(());
    }

    let (done_tx, done_rx) = std_mpsc::channel();
    spawn_reader(id, reader, events.clone(), done_tx);
    spawn_writer(id, writer, pipes.input);
    tokio::spawn(resize_loop(id, pair.master, pipes.size));

    let exit_events = events.clone();
    std::thread::spawn(move || {
        let code = match child.wait() {
            Ok(status) => status.exit_code() as i32,
            Err(e) => {
                tracing::warn!("Waiting on session {id} failed: {e}");
                EXIT_SPAWN_FAILED
            }
        };
        // Let the reader drain so the exit banner lands after the last output
        if done_rx.recv_timeout(exit_drain).is_err() {
            tracing::debug!("Session {id} output still open after exit");
        }
        let _ = exit_events.send(EngineEvent::Exited { id, code });
    });

    Ok(())
}

fn spawn_reader(
    id: SessionId,
    mut reader: Box<dyn Read + Send>,
    events: mpsc::UnboundedSender<EngineEvent>,
    done: std_mpsc::Sender<()>,
) {
    std::thread::spawn(move || {
        let mut decoder = Utf8Decoder::new();
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let text = decoder.decode(&buf[..n]);
                    if !text.is_empty() && events.send(EngineEvent::Output { id, text }).is_err()
                    {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // Linux reports EIO once the slave side is closed
                Err(e) => {
                    tracing::trace!("Session {id} reader finished: {e}");
                    break;
                }
            }
        }
        let tail = decoder.finish();
        if !tail.is_empty() {
            let _ = events.send(EngineEvent::Output { id, text: tail });
        }
        let _ = done.send(());
    });
}

fn spawn_writer(
    id: SessionId,
    mut writer: Box<dyn Write + Send>,
    mut input: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    std::thread::spawn(move || {
        while let Some(bytes) = input.blocking_recv() {
            if let Err(e) = writer.write_all(&bytes).and_then(|()| writer.flush()) {
                tracing::debug!("Session {id} input dropped: {e}");
                break;
            }
        }
    });
}

/// Owns the master side. Ends, closing the master, when the engine drops the
/// session's size sender.
async fn resize_loop(
    id: SessionId,
    master: Box<dyn MasterPty + Send>,
    mut size: watch::Receiver<PtySize>,
) {
    while size.changed().await.is_ok() {
        let next = *size.borrow_and_update();
        if let Err(e) = master.resize(next) {
            tracing::debug!("Session {id} resize to {}x{} failed: {e}", next.cols, next.rows);
        }
    }
}

/// 126 when the program was found but could not be executed, 127 otherwise.
fn spawn_exit_code(err: &anyhow::Error) -> i32 {
    let denied = err.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .is_some_and(|io| io.kind() == io::ErrorKind::PermissionDenied)
    });
    let message = format!("{err:#}").to_lowercase();
    if denied || message.contains("permission denied") || message.contains("not executable") {
        EXIT_NOT_EXECUTABLE
    } else {
        EXIT_SPAWN_FAILED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_exit_code() {
        let denied = anyhow::Error::new(io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(spawn_exit_code(&denied), EXIT_NOT_EXECUTABLE);

        let wrapped = anyhow::anyhow!("Unable to spawn /x because it is not executable");
        assert_eq!(spawn_exit_code(&wrapped), EXIT_NOT_EXECUTABLE);

        let missing = anyhow::Error::new(io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(spawn_exit_code(&missing), EXIT_SPAWN_FAILED);
        assert_eq!(spawn_exit_code(&anyhow::anyhow!("empty argv")), EXIT_SPAWN_FAILED);
    }
}
