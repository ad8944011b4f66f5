//! Sandbox invocation for the default session.
//!
//! Pure: builds argv and environment from resolved paths, touches nothing.

use crate::{
    assets::{SANDBOX_BINARY, SANDBOX_LOADER},
    environment::Environment,
    session::{BASE_PATH, SessionRequest, quote_command_line},
};
use std::{collections::BTreeMap, path::PathBuf};

/// Guest mount point for the extracted libraries.
pub const GUEST_LIB_DIR: &str = "/opt/burrow/lib";
/// Guest mount point for the sandbox binary directory.
pub const GUEST_BIN_DIR: &str = "/opt/burrow/bin";
pub const GUEST_HOME: &str = "/root";
pub const GUEST_SHELL: &[&str] = &["/bin/bash", "--login"];
/// Host storage mount points bound through unchanged.
pub const STORAGE_MOUNTS: &[&str] = &["/storage", "/sdcard"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl SandboxInvocation {
    /// Program followed by args.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect()
    }

    pub fn command_line(&self) -> String {
        quote_command_line(&self.argv())
    }
}

impl From<SandboxInvocation> for SessionRequest {
    fn from(invocation: SandboxInvocation) -> Self {
        SessionRequest::new(invocation.argv())
            .envs(invocation.env)
            .title("burrow")
            .sandboxed(true)
    }
}

pub fn build_sandbox_invocation(env: &Environment) -> SandboxInvocation {
    let bin_dir = env.sandbox_bin_path();
    let lib_dir = env.lib_path();
    let path = |p: &std::path::Path| p.display().to_string();

    let mut args: Vec<String> = vec![
        "--kill-on-exit".into(),
        "--link2symlink".into(),
        "-0".into(),
        "-r".into(),
        path(env.rootfs_path()),
    ];
    let mut bind = |mount: String| {
        args.push("-b".into());
        args.push(mount);
    };
    for system in ["/dev", "/proc", "/sys"] {
        bind(system.to_string());
    }
    bind(format!("{}:/tmp", path(env.tmp_path())));
    for storage in STORAGE_MOUNTS {
        bind(storage.to_string());
    }
    bind(format!("{}:{GUEST_HOME}", path(env.home_path())));
    bind(format!("{}:{GUEST_LIB_DIR}", path(lib_dir)));
    bind(format!("{}:{GUEST_BIN_DIR}", path(bin_dir)));
    args.extend(["-w".to_string(), GUEST_HOME.to_string()]);
    args.extend(GUEST_SHELL.iter().map(|s| s.to_string()));

    let vars = [
        ("HOME", GUEST_HOME.to_string()),
        ("PATH", format!("{BASE_PATH}:{GUEST_BIN_DIR}")),
        ("TERM", "xterm-256color".to_string()),
        ("LANG", "en_US.UTF-8".to_string()),
        ("LC_ALL", "en_US.UTF-8".to_string()),
        ("LD_LIBRARY_PATH", path(lib_dir)),
        ("PROOT_LOADER", path(&bin_dir.join(SANDBOX_LOADER))),
        ("PROOT_TMP_DIR", path(env.tmp_path())),
        // Host preload libraries break inside the guest
        ("LD_PRELOAD", String::new()),
    ];

    SandboxInvocation {
        program: bin_dir.join(SANDBOX_BINARY),
        args,
        env: vars
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
    }
}
