//! Windows permission semantics
//!
//! A read-only file cannot be deleted no matter what its directory allows.
//! The read-only attribute on a directory only marks it as "customized" for
//! Explorer and does not gate entry removal, so directories are left alone.

use crate::error::LinkError;
use std::fs;
use std::io;
use std::path::Path;

/// `ERROR_NOT_SAME_DEVICE`
const ERROR_NOT_SAME_DEVICE: i32 = 17;

pub(super) fn set_read_only(path: &Path, read_only: bool) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.is_dir() || metadata.file_type().is_symlink() {
        return Ok(());
    }

    let mut perms = metadata.permissions();
    if perms.readonly() != read_only {
        perms.set_readonly(read_only);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}

pub(super) fn set_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

pub(super) fn is_cross_device(err: &io::Error) -> bool {
    err.raw_os_error() == Some(ERROR_NOT_SAME_DEVICE)
}

pub(super) fn hardlink(source: &Path, destination: &Path) -> Result<(), LinkError> {
    fs::hard_link(source, destination).map_err(|e| super::classify_link_error(e, source, destination))
}

/// `FILE_READ_ATTRIBUTES | FILE_WRITE_ATTRIBUTES`
const ATTRIBUTE_ACCESS: u32 = 0x0080 | 0x0100;

/// Remove a read-only file's name while keeping its body read-only for any
/// other names linked to it.
///
/// A handle opened before the attribute is cleared keeps the body reachable
/// after the name is gone, and the attribute is restored through it.
pub(super) fn detach_protected(path: &Path, metadata: &fs::Metadata) -> io::Result<()> {
    use std::os::windows::fs::OpenOptionsExt;

    if metadata.file_type().is_symlink() || !metadata.permissions().readonly() {
        return Ok(());
    }

    let body = fs::OpenOptions::new()
        .access_mode(ATTRIBUTE_ACCESS)
        .open(path)?;
    set_read_only(path, false)?;
    let removed = fs::remove_file(path);

    let mut perms = body.metadata()?.permissions();
    perms.set_readonly(true);
    body.set_permissions(perms)?;
    removed
}
