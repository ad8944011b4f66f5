mod common;

use async_trait::async_trait;
use burrow::{
    assets::{AssetSource, MemoryAssets, ROOTFS_ARCHIVE},
    bootstrap::{BootstrapError, Bootstrapper},
    diagnostics::{BootstrapEvent, ChannelDiagnostics, NoOpDiagnostics},
    environment::{Environment, FixedPathSupplier},
    utils::logging::init_test_logging,
};
use burrow_common::bootstrap_state::{BootstrapStage, BootstrapState, BootstrapStateMachine};
use common::{
    ArchiveEntry, SAMPLE_ROOTFS_FILES, SAMPLE_ROOTFS_HARD_LINKS, fake_assets, rootfs_archive,
};
use std::{io, os::unix::fs::PermissionsExt, sync::Arc, time::Duration};
use tempfile::TempDir;
use tokio::sync::mpsc;

fn environment(temp: &TempDir) -> Environment {
    init_test_logging();
    Environment::resolve(&FixedPathSupplier::new(temp.path().join("env"))).unwrap()
}

fn count_files(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .flatten()
        .map(|entry| {
            let kind = entry.file_type().unwrap();
            if kind.is_dir() {
                count_files(&entry.path())
            } else if kind.is_file() {
                1
            } else {
                0
            }
        })
        .sum()
}

/// Serves the rootfs archive only after a long delay.
struct SlowRootfs(MemoryAssets);

#[async_trait]
impl AssetSource for SlowRootfs {
    async fn load(&self, name: &str) -> io::Result<Vec<u8>> {
        if name == ROOTFS_ARCHIVE {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        self.0.load(name).await
    }
}

#[tokio::test]
async fn test_prepare_writes_everything_and_marker() {
    let temp = TempDir::new().unwrap();
    let env = environment(&temp);
    let bootstrapper = Bootstrapper::new(env.clone(), Arc::new(fake_assets()));

    let report = bootstrapper.prepare().await.unwrap();

    assert!(env.setup_complete());
    assert_eq!(report.extraction.files, SAMPLE_ROOTFS_FILES);
    assert_eq!(report.extraction.hard_links, SAMPLE_ROOTFS_HARD_LINKS);
    assert_eq!(report.extraction.symlinks, 1);
    assert_eq!(
        count_files(env.rootfs_path()),
        SAMPLE_ROOTFS_FILES + SAMPLE_ROOTFS_HARD_LINKS
    );
    assert!(report.permissions.runnable());

    let proot = env.sandbox_bin_path().join("proot");
    let mode = std::fs::metadata(&proot).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o755);
    assert!(env.sandbox_bin_path().join("loader").is_file());
    assert!(env.lib_path().join("libtalloc.so.2").is_file());

    let marker = std::fs::read_to_string(env.marker_path()).unwrap();
    assert_eq!(marker.trim(), report.completed_at);
    assert!(chrono::DateTime::parse_from_rfc3339(marker.trim()).is_ok());
}

#[tokio::test]
async fn test_prepare_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let env = environment(&temp);
    let bootstrapper = Bootstrapper::new(env.clone(), Arc::new(fake_assets()));

    let first = bootstrapper.prepare().await.unwrap();
    let second = bootstrapper.prepare().await.unwrap();

    assert_eq!(first.extraction, second.extraction);
    assert_eq!(
        count_files(env.rootfs_path()),
        SAMPLE_ROOTFS_FILES + SAMPLE_ROOTFS_HARD_LINKS
    );
    assert_eq!(
        std::fs::read(env.rootfs_path().join("bin/hi")).unwrap(),
        std::fs::read(env.rootfs_path().join("bin/hello")).unwrap()
    );
    assert_eq!(
        std::fs::read_to_string(env.rootfs_path().join("etc/motd")).unwrap(),
        "welcome\n"
    );
    assert!(env.setup_complete());
}

#[tokio::test]
async fn test_stages_are_reported_in_order() {
    let temp = TempDir::new().unwrap();
    let env = environment(&temp);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let state = BootstrapStateMachine::new();
    let bootstrapper = Bootstrapper::new(env, Arc::new(fake_assets()))
        .with_diagnostics(Arc::new(ChannelDiagnostics::new(tx)))
        .with_state(state.clone());

    bootstrapper.prepare().await.unwrap();
    drop(bootstrapper);

    let mut started = Vec::new();
    let mut last = None;
    while let Ok(event) = rx.try_recv() {
        if let BootstrapEvent::StageStarted { stage } = &event {
            started.push(*stage);
        }
        last = Some(event);
    }
    assert_eq!(started, BootstrapStage::ALL.to_vec());
    assert!(matches!(last, Some(BootstrapEvent::Completed { .. })));
    assert_eq!(state.current(), BootstrapState::Ready);
}

#[tokio::test]
async fn test_missing_asset_aborts_without_marker() {
    let temp = TempDir::new().unwrap();
    let env = environment(&temp);
    let full = fake_assets();
    let assets = MemoryAssets::new()
        .with("proot", full.load("proot").await.unwrap())
        .with(ROOTFS_ARCHIVE, full.load(ROOTFS_ARCHIVE).await.unwrap());
    let state = BootstrapStateMachine::new();
    let bootstrapper = Bootstrapper::new(env.clone(), Arc::new(assets)).with_state(state.clone());

    let err = bootstrapper.prepare().await.unwrap_err();
    match &err {
        BootstrapError::AssetMissing { name, .. } => assert_eq!(name, "loader"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!env.setup_complete());
    assert!(matches!(state.current(), BootstrapState::Failed { .. }));
}

#[tokio::test]
async fn test_corrupt_archive_aborts_without_marker() {
    let temp = TempDir::new().unwrap();
    let env = environment(&temp);
    let mut assets = fake_assets();
    assets.insert(ROOTFS_ARCHIVE, b"\x1f\x8b garbage".to_vec());
    let bootstrapper = Bootstrapper::new(env.clone(), Arc::new(assets));

    let err = bootstrapper.prepare().await.unwrap_err();
    assert!(matches!(err, BootstrapError::ArchiveCorrupt(_)), "{err}");
    assert_eq!(err.error_category(), "ARCHIVE");
    assert!(!env.setup_complete());
}

#[tokio::test]
async fn test_timeout_leaves_environment_incomplete() {
    let temp = TempDir::new().unwrap();
    let env = environment(&temp);
    let state = BootstrapStateMachine::new();
    let bootstrapper = Bootstrapper::new(env.clone(), Arc::new(SlowRootfs(fake_assets())))
        .with_state(state.clone());

    let err = bootstrapper
        .prepare_with_timeout(Duration::from_millis(200))
        .await
        .unwrap_err();

    assert!(matches!(err, BootstrapError::SetupTimeout(_)), "{err}");
    assert!(err.is_retryable());
    assert!(!env.setup_complete());
    assert!(matches!(state.current(), BootstrapState::Failed { .. }));
}

#[tokio::test]
async fn test_timeout_stops_extraction_before_returning() {
    let temp = TempDir::new().unwrap();
    let env = environment(&temp);

    let paths: Vec<String> = (0..1500).map(|i| format!("usr/share/bulk/{i:04}")).collect();
    let data = vec![0u8; 32 * 1024];
    let entries: Vec<ArchiveEntry<'_>> = paths
        .iter()
        .map(|path| ArchiveEntry {
            path: path.as_str(),
            data: data.as_slice(),
            mode: 0o644,
        })
        .collect();
    let mut assets = fake_assets();
    assets.insert(ROOTFS_ARCHIVE, rootfs_archive(&[], &entries));
    let bootstrapper = Bootstrapper::new(env.clone(), Arc::new(assets))
        .with_diagnostics(Arc::new(NoOpDiagnostics));

    let err = bootstrapper
        .prepare_with_timeout(Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(err, BootstrapError::SetupTimeout(_)), "{err}");

    let at_timeout = count_files(env.rootfs_path());
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(count_files(env.rootfs_path()), at_timeout);
    assert!(!env.setup_complete());

    // A retry owns the tree alone and completes it
    let report = bootstrapper.prepare().await.unwrap();
    assert_eq!(report.extraction.files, paths.len());
    assert_eq!(count_files(env.rootfs_path()), paths.len());
}

#[tokio::test]
async fn test_reset_removes_extracted_content_and_keeps_home() {
    let temp = TempDir::new().unwrap();
    let env = environment(&temp);
    let state = BootstrapStateMachine::new();
    let bootstrapper =
        Bootstrapper::new(env.clone(), Arc::new(fake_assets())).with_state(state.clone());
    bootstrapper.prepare().await.unwrap();
    std::fs::write(env.home_path().join(".profile"), "export A=1\n").unwrap();

    // Read-only directories must not block the reset
    let etc = env.rootfs_path().join("etc");
    std::fs::set_permissions(&etc, std::fs::Permissions::from_mode(0o555)).unwrap();

    bootstrapper.reset().await.unwrap();

    assert!(!env.setup_complete());
    assert_eq!(count_files(env.rootfs_path()), 0);
    assert_eq!(count_files(env.sandbox_bin_path()), 0);
    assert!(env.home_path().join(".profile").is_file());
    assert_eq!(state.current(), BootstrapState::Pending);

    // And setup can run again from scratch
    bootstrapper.prepare().await.unwrap();
    assert!(env.setup_complete());
}
