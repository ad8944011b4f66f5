//! Rootfs unpacking.
//!
//! Runs synchronously; the pipeline moves it onto a blocking worker. Entries
//! are written one at a time, in archive order, into a single destination.
//! The worker checks a cancel flag between entries so a timed-out run stops
//! writing before anyone else touches the tree.

use super::BootstrapError;
use flate2::read::GzDecoder;
use serde::Serialize;
use std::{
    fs, io,
    io::Read,
    os::unix::fs::PermissionsExt,
    path::{Component, Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};
use tar::{Archive, EntryType};

/// Counts of what an unpack produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExtractionSummary {
    pub files: usize,
    pub directories: usize,
    pub symlinks: usize,
    pub hard_links: usize,
    /// Devices, fifos and anything else
    pub other: usize,
    /// Entries refused because their path escapes the destination
    pub skipped: usize,
    pub bytes: u64,
}

impl ExtractionSummary {
    fn record(&mut self, kind: EntryType, size: u64) {
        match kind {
            EntryType::Regular | EntryType::Continuous => {
                self.files += 1;
                self.bytes += size;
            }
            EntryType::Directory => self.directories += 1,
            EntryType::Symlink => self.symlinks += 1,
            EntryType::Link => self.hard_links += 1,
            _ => self.other += 1,
        }
    }
}

/// Decompress a gzip tar stream and unpack it into `dest`.
pub fn unpack_rootfs<R: Read>(reader: R, dest: &Path) -> Result<ExtractionSummary, BootstrapError> {
    unpack_rootfs_cancellable(reader, dest, &AtomicBool::new(false))
}

/// [`unpack_rootfs`], stopping with [`BootstrapError::Cancelled`] before the
/// next entry once `cancel` is set.
pub fn unpack_rootfs_cancellable<R: Read>(
    reader: R,
    dest: &Path,
    cancel: &AtomicBool,
) -> Result<ExtractionSummary, BootstrapError> {
    fs::create_dir_all(dest).map_err(|e| BootstrapError::io(dest, e))?;

    let mut archive = Archive::new(GzDecoder::new(reader));
    archive.set_overwrite(true);

    let mut summary = ExtractionSummary::default();
    let entries = archive.entries().map_err(corrupt)?;
    for entry in entries {
        if cancel.load(Ordering::Acquire) {
            tracing::info!("Rootfs unpack cancelled after {:?}", summary);
            return Err(BootstrapError::Cancelled);
        }
        let mut entry = entry.map_err(corrupt)?;
        let kind = entry.header().entry_type();
        let size = entry.header().size().unwrap_or(0);
        let mode = entry.header().mode().unwrap_or(0);
        let raw_path = entry.path().map_err(corrupt)?.into_owned();

        let Some(relative) = contained_path(&raw_path) else {
            tracing::warn!("Skipping archive entry outside the rootfs: {:?}", raw_path);
            summary.skipped += 1;
            continue;
        };
        if relative.as_os_str().is_empty() {
            // The archive's own root ("./")
            continue;
        }

        let target = dest.join(&relative);
        if let Some(parent) = target.parent()
            && !parent.is_dir()
        {
            fs::create_dir_all(parent).map_err(|e| BootstrapError::io(parent, e))?;
        }
        if kind != EntryType::Directory {
            remove_existing(&target).map_err(|e| BootstrapError::io(&target, e))?;
        }

        let unpacked = entry
            .unpack_in(dest)
            .map_err(|e| classify_unpack_error(e, &target))?;
        if !unpacked {
            summary.skipped += 1;
            continue;
        }
        summary.record(kind, size);

        if kind.is_file() && mode & 0o111 != 0 {
            reapply_exec_bits(&target, mode);
        }
    }

    tracing::debug!("Unpacked rootfs into {:?}: {:?}", dest, summary);
    Ok(summary)
}

/// Strip leading `/` and `.` components; refuse anything with `..`.
fn contained_path(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => return None,
        }
    }
    Some(out)
}

/// tar will not replace an existing hard link destination, so a rerun over
/// an unpacked tree clears every non-directory target first.
fn remove_existing(target: &Path) -> io::Result<()> {
    match fs::symlink_metadata(target) {
        Ok(meta) if !meta.is_dir() => match fs::remove_file(target) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        },
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Best effort: the file is already written, a failed chmod only leaves a
/// tool unrunnable inside the guest.
fn reapply_exec_bits(path: &Path, mode: u32) {
    let result = fs::metadata(path).and_then(|meta| {
        let current = meta.permissions().mode();
        let wanted = current | (mode & 0o111);
        if wanted == current {
            Ok(())
        } else {
            fs::set_permissions(path, fs::Permissions::from_mode(wanted))
        }
    });
    if let Err(e) = result {
        tracing::trace!("Could not restore exec bits on {:?}: {}", path, e);
    }
}

fn corrupt(err: io::Error) -> BootstrapError {
    BootstrapError::ArchiveCorrupt(err.to_string())
}

/// Entry data is read lazily from the decoder during unpack, so stream
/// damage surfaces here too.
fn classify_unpack_error(err: io::Error, target: &Path) -> BootstrapError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => {
            corrupt(err)
        }
        _ => BootstrapError::io(target, err),
    }
}
