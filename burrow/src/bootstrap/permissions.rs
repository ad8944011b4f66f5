//! Make sure the sandbox executable can run.
//!
//! Two independent attempts: a direct chmod, and a `--help` smoke test. Either
//! one succeeding is good enough, and neither failing stops setup.

use serde::Serialize;
use std::{
    collections::BTreeMap,
    os::unix::fs::PermissionsExt,
    path::Path,
    process::Stdio,
    time::Duration,
};
use tokio::{process::Command, time::timeout};

/// Exit codes the sandbox binary uses for "bad usage". Getting one back
/// still proves the kernel let us execute it.
pub const USAGE_EXIT_CODES: &[i32] = &[1, 2];

pub const EXECUTABLE_MODE: u32 = 0o755;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PermissionReport {
    pub chmod_ok: bool,
    /// Exit code of the smoke test, if it ran to completion
    pub probe_exit_code: Option<i32>,
    pub warnings: Vec<String>,
}

impl PermissionReport {
    pub fn probe_ok(&self) -> bool {
        self.probe_exit_code
            .is_some_and(|code| code == 0 || USAGE_EXIT_CODES.contains(&code))
    }

    /// At least one of the two checks passed.
    pub fn runnable(&self) -> bool {
        self.chmod_ok || self.probe_ok()
    }
}

pub async fn mark_executable(path: &Path) -> std::io::Result<()> {
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(EXECUTABLE_MODE)).await
}

/// Run both checks against `binary`. `env` is passed to the smoke test so the
/// binary can find its libraries.
pub async fn ensure_runnable(
    binary: &Path,
    env: &BTreeMap<String, String>,
    probe_timeout: Duration,
) -> PermissionReport {
    let mut report = PermissionReport::default();

    match mark_executable(binary).await {
        Ok(()) => report.chmod_ok = true,
        Err(e) => report
            .warnings
            .push(format!("chmod {EXECUTABLE_MODE:o} on {binary:?} failed: {e}")),
    }

    let mut command = Command::new(binary);
    command
        .arg("--help")
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    match command.spawn() {
        Ok(mut child) => match timeout(probe_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                report.probe_exit_code = status.code();
                if !report.probe_ok() {
                    report
                        .warnings
                        .push(format!("{binary:?} --help exited with {status}"));
                }
            }
            Ok(Err(e)) => report
                .warnings
                .push(format!("waiting for {binary:?} --help failed: {e}")),
            Err(_) => report.warnings.push(format!(
                "{binary:?} --help did not exit within {}ms",
                probe_timeout.as_millis()
            )),
        },
        Err(e) => report
            .warnings
            .push(format!("could not execute {binary:?}: {e}")),
    }

    report
}
