mod common;

use burrow::{
    environment::Environment,
    session::{
        EXITED_TITLE_PREFIX, LifecycleState, SessionEngine, SessionEvent, SessionRequest,
        exit_banner,
    },
};
use common::fast_settings;
use std::{os::unix::fs::PermissionsExt, time::Duration};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(15);

fn engine(temp: &TempDir) -> SessionEngine {
    let env = Environment::at(temp.path());
    env.create_skeleton().unwrap();
    SessionEngine::new(&env, fast_settings())
}

fn all_exited(engine: &SessionEngine) -> bool {
    engine
        .sessions()
        .iter()
        .all(|s| matches!(s.state(), LifecycleState::Exited(_)))
}

#[tokio::test]
async fn test_exit_banner_and_title() {
    let temp = TempDir::new().unwrap();
    let mut engine = engine(&temp);
    let id = engine.create_session(SessionRequest::new(["/bin/sh", "-c", "printf done; exit 3"]));

    assert!(
        engine
            .run_until(WAIT, |e| e.session(id).is_some_and(|s| s.state().exit_code().is_some()))
            .await
    );
    let session = engine.session(id).unwrap();
    assert_eq!(session.state(), LifecycleState::Exited(3));
    assert!(session.text().contains("done"), "{:?}", session.text());
    assert!(session.text().ends_with(&exit_banner(3)));
    assert_eq!(session.title(), format!("{EXITED_TITLE_PREFIX}sh"));
}

#[tokio::test]
async fn test_observers_see_create_and_exit() {
    let temp = TempDir::new().unwrap();
    let mut engine = engine(&temp);
    let mut observer = engine.subscribe();

    engine.create_session(SessionRequest::new(["/bin/sh", "-c", "exit 0"]));
    assert!(observer.has_changed().unwrap());
    observer.borrow_and_update();

    assert!(engine.run_until(WAIT, all_exited).await);
    assert!(observer.has_changed().unwrap());
}

#[tokio::test]
async fn test_env_overlay_and_working_dir() {
    let temp = TempDir::new().unwrap();
    let mut engine = engine(&temp);
    let work = temp.path().join("work");
    std::fs::create_dir_all(&work).unwrap();

    let id = engine.create_session(
        SessionRequest::new(["/bin/sh", "-c", "echo \"$GREETING:$TERM\"; pwd"])
            .env("GREETING", "hello")
            .working_dir(&work),
    );
    assert!(engine.run_until(WAIT, all_exited).await);

    let session = engine.session(id).unwrap();
    let lines: Vec<&str> = session.terminal().lines().collect();
    assert!(lines.contains(&"hello:xterm-256color"), "{lines:?}");
    let work = work.canonicalize().unwrap();
    assert!(
        lines.iter().any(|line| std::path::Path::new(line) == work),
        "{lines:?}"
    );
}

#[tokio::test]
async fn test_input_reaches_the_process() {
    let temp = TempDir::new().unwrap();
    let mut engine = engine(&temp);
    let id = engine.create_session(SessionRequest::new(["/bin/sh", "-c", "read line; echo \"got $line\""]));

    assert!(engine.write_input(id, "ping\n"));
    assert!(engine.run_until(WAIT, all_exited).await);

    let session = engine.session(id).unwrap();
    assert!(
        session.terminal().lines().any(|line| line == "got ping"),
        "{:?}",
        session.text()
    );
    assert!(!engine.write_input(id, "late\n"), "exited sessions take no input");
}

#[tokio::test]
async fn test_resize_reaches_the_terminal() {
    let temp = TempDir::new().unwrap();
    let mut engine = engine(&temp);
    let id = engine.create_session(SessionRequest::new(["/bin/sh", "-c", "sleep 0.3; stty size"]));

    assert!(engine.resize(id, 100, 40));
    assert!(engine.run_until(WAIT, all_exited).await);

    let session = engine.session(id).unwrap();
    assert!(
        session.terminal().lines().any(|line| line.trim() == "40 100"),
        "{:?}",
        session.text()
    );
}

#[tokio::test]
async fn test_sentinel_exit_falls_back_exactly_once() {
    let temp = TempDir::new().unwrap();
    let mut engine = engine(&temp);
    let first = engine.create_session(
        SessionRequest::new(["/bin/sh", "-c", "exit 126"])
            .env("MARK", "kept")
            .sandboxed(true),
    );

    let mut fallbacks = 0;
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        let Ok(event) = tokio::time::timeout(Duration::from_secs(1), engine.handle_next_event()).await
        else {
            if engine.sessions().len() == 2 && all_exited(&engine) {
                break;
            }
            continue;
        };
        if matches!(event, SessionEvent::FallbackStarted(_)) {
            fallbacks += 1;
        }
    }

    assert_eq!(fallbacks, 1);
    assert_eq!(engine.sessions().len(), 2);
    let retry = &engine.sessions()[1];
    assert_ne!(retry.id(), first);
    assert_eq!(retry.request().argv[..2], ["/bin/sh".to_string(), "-c".to_string()]);
    assert_eq!(retry.request().argv[2], "'/bin/sh' '-c' 'exit 126'");
    assert_eq!(retry.request().env.get("MARK").map(String::as_str), Some("kept"));
    assert!(!retry.request().sandboxed);
    assert!(retry.request().is_fallback());
    assert_eq!(retry.state(), LifecycleState::Exited(126));
    assert_eq!(engine.active_index(), Some(1));
}

#[tokio::test]
async fn test_other_exit_codes_do_not_fall_back() {
    let temp = TempDir::new().unwrap();
    let mut engine = engine(&temp);
    engine.create_session(SessionRequest::new(["/bin/sh", "-c", "exit 1"]).sandboxed(true));
    engine.create_session(SessionRequest::new(["/bin/sh", "-c", "exit 126"]));

    assert!(engine.run_until(WAIT, all_exited).await);
    engine.settle(Duration::from_millis(300)).await;
    assert_eq!(engine.sessions().len(), 2);
}

#[tokio::test]
async fn test_unexecutable_sandbox_binary_falls_back() {
    let temp = TempDir::new().unwrap();
    let binary = temp.path().join("sandbox");
    std::fs::write(&binary, "#!/bin/sh\necho unreachable\n").unwrap();
    std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o644)).unwrap();

    let mut engine = engine(&temp);
    let first = engine.create_session(
        SessionRequest::new([binary.display().to_string()]).sandboxed(true),
    );

    assert!(
        engine
            .run_until(WAIT, |e| e.sessions().len() == 2 && all_exited(e))
            .await
    );
    assert_eq!(
        engine.session(first).unwrap().state(),
        LifecycleState::Exited(126)
    );
    assert!(engine.sessions()[1].request().is_fallback());
}

#[tokio::test]
async fn test_close_running_session_kills_it() {
    let temp = TempDir::new().unwrap();
    let mut engine = engine(&temp);
    let id = engine.create_session(SessionRequest::new(["/bin/sh", "-c", "sleep 30"]));
    assert!(
        engine
            .run_until(WAIT, |e| e
                .session(id)
                .is_some_and(|s| s.state() == LifecycleState::Running))
            .await
    );

    engine.close_session(id);
    assert!(engine.session(id).is_none());
    assert_eq!(engine.active_index(), None);

    // The exit arrives for a session that no longer exists
    engine.settle(Duration::from_millis(500)).await;
    assert!(engine.is_empty());
}
