//! # Environment Bootstrap Pipeline
//!
//! Turns an empty [`Environment`] into one sessions can run in. Four stages,
//! in order:
//!
//! 1. **extract-binaries**: copy the sandbox executable, its loader and its
//!    libraries out of the asset bundle. Any failure aborts the run.
//! 2. **extract-rootfs**: gunzip and untar the rootfs on a blocking worker.
//!    Any failure aborts the run.
//! 3. **fix-permissions**: chmod plus a `--help` smoke test. Warnings only.
//! 4. **write-marker**: write `.setup_complete` with a timestamp. Last.
//!
//! The marker is the only thing the rest of the system trusts. A run that
//! fails or times out never writes it; partial files are left for the next
//! run to overwrite or for [`Bootstrapper::reset`] to remove. At most one
//! extraction worker writes into the rootfs at a time, and a timed-out run
//! waits for its worker to stop before reporting the timeout.

mod archive;
mod error;
mod permissions;

pub use archive::{ExtractionSummary, unpack_rootfs, unpack_rootfs_cancellable};
pub use error::BootstrapError;
pub use permissions::{PermissionReport, USAGE_EXIT_CODES, ensure_runnable, mark_executable};

use crate::{
    assets::{AssetSource, AssetTarget, BINARY_ASSETS, ROOTFS_ARCHIVE, SANDBOX_BINARY},
    diagnostics::{BootstrapEvent, DiagnosticsSink, TracingDiagnostics},
    environment::Environment,
};
use burrow_common::bootstrap_state::{BootstrapStage, BootstrapStateMachine};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::sync::Mutex;

/// What a successful run did.
#[derive(Debug, Clone, Serialize)]
pub struct BootstrapReport {
    pub extraction: ExtractionSummary,
    pub permissions: PermissionReport,
    /// Timestamp written into the marker
    pub completed_at: String,
    pub duration_ms: u64,
}

/// Runs the bootstrap pipeline for one environment.
#[derive(Clone)]
pub struct Bootstrapper {
    env: Environment,
    assets: Arc<dyn AssetSource>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    state: Option<BootstrapStateMachine>,
    probe_timeout: Duration,
    /// Held by the extraction worker for as long as it runs
    worker: Arc<Mutex<()>>,
    cancel: Arc<AtomicBool>,
}

impl Bootstrapper {
    pub fn new(env: Environment, assets: Arc<dyn AssetSource>) -> Self {
        Self {
            env,
            assets,
            diagnostics: Arc::new(TracingDiagnostics),
            state: None,
            probe_timeout: Duration::from_secs(10),
            worker: Arc::new(Mutex::new(())),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Publish stage transitions on `state`.
    pub fn with_state(mut self, state: BootstrapStateMachine) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// Run all four stages. Calling this again on a completed environment
    /// rewrites the same files in place.
    pub async fn prepare(&self) -> Result<BootstrapReport, BootstrapError> {
        let started = Instant::now();
        // A retry or a rerun starts a fresh pass through the stages
        if let Some(state) = &self.state
            && state.current().is_terminal()
        {
            let _ = state.reset();
        }
        let mut stage = BootstrapStage::ExtractBinaries;
        let result = self.run_stages(&mut stage, started).await;
        if let Err(e) = &result {
            self.fail(stage, e).await;
        }
        result
    }

    /// [`Self::prepare`] under a wall-clock limit. On expiry the run is
    /// dropped before the marker stage, so the environment stays incomplete,
    /// and an extraction worker still running is cancelled and awaited.
    pub async fn prepare_with_timeout(
        &self,
        limit: Duration,
    ) -> Result<BootstrapReport, BootstrapError> {
        match tokio::time::timeout(limit, self.prepare()).await {
            Ok(result) => result,
            Err(_) => {
                self.stop_worker().await;
                let err = BootstrapError::SetupTimeout(limit);
                let stage = self
                    .state
                    .as_ref()
                    .and_then(|s| s.current().stage())
                    .unwrap_or(BootstrapStage::ExtractRootfs);
                self.fail(stage, &err).await;
                Err(err)
            }
        }
    }

    async fn run_stages(
        &self,
        stage: &mut BootstrapStage,
        started: Instant,
    ) -> Result<BootstrapReport, BootstrapError> {
        self.env
            .create_skeleton()
            .map_err(|e| BootstrapError::io(self.env.base_path(), e))?;

        *stage = BootstrapStage::ExtractBinaries;
        let t = self.begin(*stage).await;
        self.extract_binaries().await?;
        self.end(*stage, t).await;

        *stage = BootstrapStage::ExtractRootfs;
        let t = self.begin(*stage).await;
        let extraction = self.extract_rootfs().await?;
        self.diagnostics
            .record(BootstrapEvent::RootfsExtracted {
                files: extraction.files,
                directories: extraction.directories,
                bytes: extraction.bytes,
            })
            .await;
        self.end(*stage, t).await;

        *stage = BootstrapStage::FixPermissions;
        let t = self.begin(*stage).await;
        let permissions = ensure_runnable(
            &self.sandbox_binary(),
            &self.probe_env(),
            self.probe_timeout,
        )
        .await;
        for warning in &permissions.warnings {
            self.diagnostics
                .record(BootstrapEvent::Warning {
                    stage: *stage,
                    message: warning.clone(),
                })
                .await;
        }
        self.end(*stage, t).await;

        *stage = BootstrapStage::WriteMarker;
        let t = self.begin(*stage).await;
        let completed_at = self.write_marker().await?;
        self.end(*stage, t).await;

        if let Some(state) = &self.state
            && let Err(e) = state.transition_to_ready()
        {
            tracing::warn!("Bootstrap state not updated: {e}");
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        self.diagnostics
            .record(BootstrapEvent::Completed {
                timestamp: completed_at.clone(),
                duration_ms,
            })
            .await;

        Ok(BootstrapReport {
            extraction,
            permissions,
            completed_at,
            duration_ms,
        })
    }

    async fn extract_binaries(&self) -> Result<(), BootstrapError> {
        for asset in BINARY_ASSETS {
            let bytes =
                self.assets
                    .load(asset.name)
                    .await
                    .map_err(|source| BootstrapError::AssetMissing {
                        name: asset.name.to_string(),
                        source,
                    })?;

            let dir = match asset.target {
                AssetTarget::SandboxBin => self.env.sandbox_bin_path(),
                AssetTarget::Lib => self.env.lib_path(),
            };
            let dest = dir.join(asset.name);
            tokio::fs::write(&dest, &bytes)
                .await
                .map_err(|e| BootstrapError::io(&dest, e))?;
            if asset.executable {
                mark_executable(&dest)
                    .await
                    .map_err(|e| BootstrapError::io(&dest, e))?;
            }

            self.diagnostics
                .record(BootstrapEvent::AssetExtracted {
                    name: asset.name.to_string(),
                    bytes: bytes.len(),
                })
                .await;
        }
        Ok(())
    }

    async fn extract_rootfs(&self) -> Result<ExtractionSummary, BootstrapError> {
        let archive =
            self.assets
                .load(ROOTFS_ARCHIVE)
                .await
                .map_err(|source| BootstrapError::AssetMissing {
                    name: ROOTFS_ARCHIVE.to_string(),
                    source,
                })?;
        let dest = self.env.rootfs_path().to_path_buf();
        tracing::info!(
            "Unpacking {} ({} bytes) into {:?}",
            ROOTFS_ARCHIVE,
            archive.len(),
            dest
        );
        let running = self.worker.clone().lock_owned().await;
        self.cancel.store(false, Ordering::Release);
        let cancel = self.cancel.clone();
        tokio::task::spawn_blocking(move || {
            let _running = running;
            unpack_rootfs_cancellable(archive.as_slice(), &dest, &cancel)
        })
        .await?
    }

    /// Cancel the extraction worker, if any, and wait until it has stopped.
    async fn stop_worker(&self) {
        self.cancel.store(true, Ordering::Release);
        let _idle = self.worker.lock().await;
        tracing::debug!("No extraction worker running");
    }

    async fn write_marker(&self) -> Result<String, BootstrapError> {
        let timestamp = chrono::Local::now().to_rfc3339();
        let path = self.env.marker_path();
        tokio::fs::write(&path, format!("{timestamp}\n"))
            .await
            .map_err(|e| BootstrapError::io(&path, e))?;
        Ok(timestamp)
    }

    /// Delete the marker and everything extracted, then recreate the empty
    /// skeleton. `home` and `tmp` are kept. Stops any extraction in flight
    /// first.
    pub async fn reset(&self) -> io::Result<()> {
        self.stop_worker().await;
        let env = self.env.clone();
        tokio::task::spawn_blocking(move || reset_environment(&env))
            .await
            .map_err(io::Error::other)??;
        if let Some(state) = &self.state
            && let Err(e) = state.reset()
        {
            tracing::warn!("Bootstrap state not reset: {e}");
        }
        Ok(())
    }

    fn sandbox_binary(&self) -> PathBuf {
        self.env.sandbox_bin_path().join(SANDBOX_BINARY)
    }

    fn probe_env(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(
            "LD_LIBRARY_PATH".to_string(),
            self.env.lib_path().display().to_string(),
        )])
    }

    async fn begin(&self, stage: BootstrapStage) -> Instant {
        if let Some(state) = &self.state
            && let Err(e) = state.enter_stage(stage)
        {
            tracing::warn!("Bootstrap state not updated for {stage}: {e}");
        }
        self.diagnostics
            .record(BootstrapEvent::StageStarted { stage })
            .await;
        Instant::now()
    }

    async fn end(&self, stage: BootstrapStage, started: Instant) {
        self.diagnostics
            .record(BootstrapEvent::StageCompleted {
                stage,
                duration_ms: started.elapsed().as_millis() as u64,
            })
            .await;
    }

    async fn fail(&self, stage: BootstrapStage, err: &BootstrapError) {
        if let Some(state) = &self.state {
            // Already terminal when the timeout fires after a failure
            let _ = state.transition_to_failed(err.to_string());
        }
        self.diagnostics
            .record(BootstrapEvent::Failed {
                stage,
                error: err.to_string(),
            })
            .await;
    }
}

fn reset_environment(env: &Environment) -> io::Result<()> {
    match std::fs::remove_file(env.marker_path()) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }
    for dir in [env.rootfs_path(), env.sandbox_bin_path(), env.lib_path()] {
        remove_tree(dir)?;
    }
    env.create_skeleton()?;
    tracing::info!("Environment at {:?} reset", env.base_path());
    Ok(())
}

/// `remove_dir_all`, retried once after making every directory writable.
/// Rootfs trees contain read-only directories.
fn remove_tree(path: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            make_dirs_writable(path);
            std::fs::remove_dir_all(path)
        }
        Err(e) => Err(e),
    }
}

fn make_dirs_writable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(meta) = std::fs::symlink_metadata(path) else {
        return;
    };
    if !meta.is_dir() {
        return;
    }
    let mode = meta.permissions().mode();
    if mode & 0o700 != 0o700 {
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode | 0o700));
    }
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            make_dirs_writable(&entry.path());
        }
    }
}
