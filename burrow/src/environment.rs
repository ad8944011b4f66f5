//! # Environment Layout
//!
//! Derives the fixed directory tree every other component works against. One
//! writable base directory is supplied by the host; under it live:
//!
//! - `usr`: the unpacked guest rootfs
//! - `home`: the guest user's home, bound to `/root`
//! - `proot`: the sandbox executable and its loader
//! - `lib`: shared libraries the sandbox executable links against
//! - `tmp`: private temp dir, bound to `/tmp`
//! - `.setup_complete`: the idempotency marker
//!
//! The marker on disk is the only record of a completed bootstrap. Nothing is
//! cached in memory, so the answer survives process restarts.

use directories::ProjectDirs;
use serde::Serialize;
use std::{
    io,
    path::{Path, PathBuf},
};

pub const ROOTFS_DIR: &str = "usr";
pub const HOME_DIR: &str = "home";
pub const SANDBOX_BIN_DIR: &str = "proot";
pub const LIB_DIR: &str = "lib";
pub const TMP_DIR: &str = "tmp";
pub const MARKER_FILE: &str = ".setup_complete";

/// Supplies the one writable root the environment lives under.
pub trait HostPathSupplier: Send + Sync {
    /// Resolve the base directory, creating it if needed.
    fn resolve_base_directory(&self) -> io::Result<PathBuf>;
}

/// A base directory chosen up front (config override, tests).
#[derive(Debug, Clone)]
pub struct FixedPathSupplier {
    path: PathBuf,
}

impl FixedPathSupplier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl HostPathSupplier for FixedPathSupplier {
    fn resolve_base_directory(&self) -> io::Result<PathBuf> {
        std::fs::create_dir_all(&self.path)?;
        Ok(self.path.clone())
    }
}

/// The per-user data directory for burrow, as reported by the OS.
#[derive(Debug, Clone, Default)]
pub struct ProjectDirsSupplier;

impl HostPathSupplier for ProjectDirsSupplier {
    fn resolve_base_directory(&self) -> io::Result<PathBuf> {
        let dirs = ProjectDirs::from("com", "Burrow", "burrow").ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                "no home directory available to place the environment in",
            )
        })?;
        let path = dirs.data_dir().join("environment");
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }
}

/// Resolved environment layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    base_path: PathBuf,
    rootfs_path: PathBuf,
    home_path: PathBuf,
    sandbox_bin_path: PathBuf,
    lib_path: PathBuf,
    tmp_path: PathBuf,
}

impl Environment {
    /// Resolve the base directory through `supplier` and create the skeleton.
    pub fn resolve(supplier: &dyn HostPathSupplier) -> io::Result<Self> {
        let base = supplier.resolve_base_directory()?;
        let env = Self::at(base);
        env.create_skeleton()?;
        tracing::debug!("Environment resolved at {:?}", env.base_path);
        Ok(env)
    }

    /// Derive the layout under `base` without touching the filesystem.
    pub fn at(base: impl Into<PathBuf>) -> Self {
        let base_path = base.into();
        Self {
            rootfs_path: base_path.join(ROOTFS_DIR),
            home_path: base_path.join(HOME_DIR),
            sandbox_bin_path: base_path.join(SANDBOX_BIN_DIR),
            lib_path: base_path.join(LIB_DIR),
            tmp_path: base_path.join(TMP_DIR),
            base_path,
        }
    }

    /// Create all five subdirectories. Existing directories are left alone.
    pub fn create_skeleton(&self) -> io::Result<()> {
        for dir in self.directories() {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn directories(&self) -> [&Path; 5] {
        [
            &self.rootfs_path,
            &self.home_path,
            &self.sandbox_bin_path,
            &self.lib_path,
            &self.tmp_path,
        ]
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn rootfs_path(&self) -> &Path {
        &self.rootfs_path
    }

    pub fn home_path(&self) -> &Path {
        &self.home_path
    }

    pub fn sandbox_bin_path(&self) -> &Path {
        &self.sandbox_bin_path
    }

    pub fn lib_path(&self) -> &Path {
        &self.lib_path
    }

    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }

    pub fn marker_path(&self) -> PathBuf {
        self.base_path.join(MARKER_FILE)
    }

    /// True iff the marker file exists right now.
    pub fn setup_complete(&self) -> bool {
        self.marker_path().is_file()
    }

    /// Snapshot for status reporting.
    pub fn status(&self) -> EnvironmentStatus {
        let marker = std::fs::read_to_string(self.marker_path())
            .ok()
            .map(|s| s.trim().to_string());
        EnvironmentStatus {
            base_path: self.base_path.clone(),
            setup_complete: marker.is_some(),
            completed_at: marker,
            missing_directories: self
                .directories()
                .iter()
                .filter(|d| !d.is_dir())
                .map(|d| d.to_path_buf())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentStatus {
    pub base_path: PathBuf,
    pub setup_complete: bool,
    /// Marker contents; informational only
    pub completed_at: Option<String>,
    pub missing_directories: Vec<PathBuf>,
}
