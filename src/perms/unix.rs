//! POSIX permission semantics
//!
//! Removing a directory entry is governed by the write bit of the directory
//! that holds it. The file's own mode only protects its contents.

use crate::error::LinkError;
use std::fs::{self, Permissions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

const PERMISSION_BITS: u32 = 0o7777;

pub(super) fn set_read_only(path: &Path, read_only: bool) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.file_type().is_symlink() {
        return Ok(());
    }

    let mode = metadata.permissions().mode() & PERMISSION_BITS;
    let new_mode = if read_only {
        mode & 0o500
    } else if metadata.is_dir() {
        // Owner needs rwx to list, add and remove entries.
        mode | 0o700
    } else {
        mode | 0o200
    };

    if new_mode != mode {
        fs::set_permissions(path, Permissions::from_mode(new_mode))?;
    }
    Ok(())
}

pub(super) fn set_executable(path: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if !metadata.is_file() {
        return Ok(());
    }
    let mode = metadata.permissions().mode() & PERMISSION_BITS;
    if mode & 0o100 == 0 {
        fs::set_permissions(path, Permissions::from_mode(mode | 0o100))?;
    }
    Ok(())
}

pub(super) fn is_cross_device(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EXDEV)
}

pub(super) fn hardlink(source: &Path, destination: &Path) -> Result<(), LinkError> {
    fs::hard_link(source, destination).map_err(|e| super::classify_link_error(e, source, destination))
}

/// Unlinking is gated by the parent directory alone, so protected files are
/// left exactly as they are.
pub(super) fn detach_protected(_path: &Path, _metadata: &fs::Metadata) -> io::Result<()> {
    Ok(())
}
