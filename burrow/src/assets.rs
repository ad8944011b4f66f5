//! Bundled assets consumed by the bootstrap pipeline.
//!
//! The set of names is fixed. Where the bytes come from is up to the host:
//! an unpacked asset directory next to the binary, or bytes compiled in.

use async_trait::async_trait;
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
};

/// Sandbox executable.
pub const SANDBOX_BINARY: &str = "proot";
/// Loader the sandbox executable injects into guest processes.
pub const SANDBOX_LOADER: &str = "loader";
/// Compressed rootfs archive (gzip tar).
pub const ROOTFS_ARCHIVE: &str = "rootfs.tar.gz";

/// Where an extracted binary asset lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetTarget {
    SandboxBin,
    Lib,
}

/// One binary asset copied verbatim during extraction.
#[derive(Debug, Clone, Copy)]
pub struct BinaryAsset {
    pub name: &'static str,
    pub target: AssetTarget,
    pub executable: bool,
}

/// Every binary asset, in extraction order.
pub const BINARY_ASSETS: &[BinaryAsset] = &[
    BinaryAsset {
        name: SANDBOX_BINARY,
        target: AssetTarget::SandboxBin,
        executable: true,
    },
    BinaryAsset {
        name: SANDBOX_LOADER,
        target: AssetTarget::SandboxBin,
        executable: true,
    },
    BinaryAsset {
        name: "libtalloc.so.2",
        target: AssetTarget::Lib,
        executable: false,
    },
];

/// Loads an asset by name. Must fail if the asset is absent.
#[async_trait]
pub trait AssetSource: Send + Sync {
    async fn load(&self, name: &str) -> io::Result<Vec<u8>>;
}

/// Assets stored as plain files in one directory.
#[derive(Debug, Clone)]
pub struct DirectoryAssets {
    root: PathBuf,
}

impl DirectoryAssets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl AssetSource for DirectoryAssets {
    async fn load(&self, name: &str) -> io::Result<Vec<u8>> {
        // Asset names are flat file names; anything else is a caller bug
        if name.contains('/') || name == ".." {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid asset name {name:?}"),
            ));
        }
        tokio::fs::read(self.root.join(name)).await
    }
}

/// Assets held in memory, e.g. from `include_bytes!`.
#[derive(Debug, Clone, Default)]
pub struct MemoryAssets {
    entries: HashMap<String, Vec<u8>>,
}

impl MemoryAssets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(name, bytes);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.entries.insert(name.into(), bytes.into());
    }
}

#[async_trait]
impl AssetSource for MemoryAssets {
    async fn load(&self, name: &str) -> io::Result<Vec<u8>> {
        self.entries.get(name).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("asset {name:?} not bundled"))
        })
    }
}
