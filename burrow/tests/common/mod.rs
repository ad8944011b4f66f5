//! Fixtures shared by the integration tests.
#![allow(dead_code)]

use burrow::{
    assets::{MemoryAssets, ROOTFS_ARCHIVE, SANDBOX_BINARY, SANDBOX_LOADER},
    session::EngineSettings,
    utils::logging::init_test_logging,
};
use flate2::{Compression, write::GzEncoder};
use std::time::Duration;

/// Stands in for the sandbox binary: answers `--help`, otherwise skips the
/// sandbox options up to `-w <dir>` and runs the guest command with the host
/// `/bin/sh`.
pub const STAND_IN_SANDBOX: &str = r#"#!/bin/sh
if [ "$1" = "--help" ]; then
  echo "usage: proot [options] command"
  exit 0
fi
while [ $# -gt 0 ]; do
  case "$1" in
    -w) shift 2; break ;;
    *) shift ;;
  esac
done
shift
if [ "$1" = "--login" ]; then
  shift
fi
exec /bin/sh "$@"
"#;

pub struct ArchiveEntry<'a> {
    pub path: &'a str,
    pub data: &'a [u8],
    pub mode: u32,
}

/// Gzip tar with the given directories and regular files.
pub fn rootfs_archive(dirs: &[&str], files: &[ArchiveEntry<'_>]) -> Vec<u8> {
    linked_rootfs_archive(dirs, files, &[], &[])
}

/// Like [`rootfs_archive`], followed by `(path, target)` symlinks and hard
/// links.
pub fn linked_rootfs_archive(
    dirs: &[&str],
    files: &[ArchiveEntry<'_>],
    symlinks: &[(&str, &str)],
    hard_links: &[(&str, &str)],
) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::fast());
    let mut builder = tar::Builder::new(encoder);
    for dir in dirs {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        header.set_cksum();
        builder
            .append_data(&mut header, dir, std::io::empty())
            .unwrap();
    }
    for file in files {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(file.mode);
        header.set_size(file.data.len() as u64);
        header.set_cksum();
        builder
            .append_data(&mut header, file.path, file.data)
            .unwrap();
    }
    for (kind, links) in [
        (tar::EntryType::Symlink, symlinks),
        (tar::EntryType::Link, hard_links),
    ] {
        for (path, target) in links {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(kind);
            header.set_mode(0o777);
            header.set_size(0);
            builder.append_link(&mut header, path, target).unwrap();
        }
    }
    builder.into_inner().unwrap().finish().unwrap()
}

pub fn sample_rootfs() -> Vec<u8> {
    linked_rootfs_archive(
        &["bin", "etc", "usr/share"],
        &[
            ArchiveEntry {
                path: "bin/hello",
                data: b"#!/bin/sh\necho hello\n",
                mode: 0o755,
            },
            ArchiveEntry {
                path: "etc/os-release",
                data: b"NAME=\"Burrow Test\"\n",
                mode: 0o644,
            },
            ArchiveEntry {
                path: "usr/share/motd",
                data: b"welcome\n",
                mode: 0o644,
            },
            ArchiveEntry {
                path: "var/lib/dpkg/status",
                data: b"",
                mode: 0o644,
            },
        ],
        &[("etc/motd", "../usr/share/motd")],
        &[("bin/hi", "bin/hello")],
    )
}

/// Regular file entries in [`sample_rootfs`].
pub const SAMPLE_ROOTFS_FILES: usize = 4;
/// Hard link entries in [`sample_rootfs`]; each is one more file on disk.
pub const SAMPLE_ROOTFS_HARD_LINKS: usize = 1;

pub fn fake_assets() -> MemoryAssets {
    MemoryAssets::new()
        .with(SANDBOX_BINARY, STAND_IN_SANDBOX)
        .with(SANDBOX_LOADER, b"loader".to_vec())
        .with("libtalloc.so.2", b"not really a library".to_vec())
        .with(ROOTFS_ARCHIVE, sample_rootfs())
}

pub fn fast_settings() -> EngineSettings {
    init_test_logging();
    EngineSettings {
        fallback_delay: Duration::from_millis(50),
        exit_drain: Duration::from_millis(300),
        ..EngineSettings::default()
    }
}
