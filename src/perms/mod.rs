//! Permission and hardlink primitives
//!
//! Everything that depends on how a platform protects files lives behind
//! this module. Callers see one surface:
//!
//! - [`set_read_only`] protects or unprotects a single entry
//! - [`hardlink`] adds a second name for an existing file body
//! - [`make_tree_writable`] undoes protection on a whole tree
//! - [`remove_file`] and [`remove_tree`] delete names, leaving shared bodies
//!   protected
//!
//! Hardlinks share one file body, so a mode change made through one name is
//! visible through every other name. Cache entries linked into a sandbox and
//! then protected are therefore protected in the cache as well, and
//! unprotecting one of those names would expose the cache entry and every
//! other sandbox linked to it.
//!
//! | Entry state | POSIX | Windows |
//! |-------------|-------|---------|
//! | dir rw, file ro | file deletable | blocked by file |
//! | dir ro, file rw | blocked by dir | file deletable |
//! | dir ro, file ro | blocked | blocked |

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as platform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as platform;

use crate::error::LinkError;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Set or clear the minimal read-only protection on a file or directory.
///
/// Idempotent: an entry already in the requested state is left untouched.
/// Symlinks are never followed.
pub fn set_read_only(path: &Path, read_only: bool) -> io::Result<()> {
    platform::set_read_only(path, read_only)
}

/// Give the owner execute permission on a regular file (no-op on Windows)
pub fn set_executable(path: &Path) -> io::Result<()> {
    platform::set_executable(path)
}

/// Create `destination` as a second directory entry for `source`'s body.
pub fn hardlink(source: &Path, destination: &Path) -> Result<(), LinkError> {
    platform::hardlink(source, destination)
}

fn classify_link_error(err: io::Error, source: &Path, destination: &Path) -> LinkError {
    if platform::is_cross_device(&err) {
        return LinkError::CrossDevice {
            source_path: source.to_path_buf(),
            destination: destination.to_path_buf(),
        };
    }
    match err.kind() {
        io::ErrorKind::AlreadyExists => LinkError::AlreadyExists(destination.to_path_buf()),
        io::ErrorKind::NotFound if fs::symlink_metadata(source).is_err() => {
            LinkError::NotFound(source.to_path_buf())
        }
        _ => LinkError::Io {
            source_path: source.to_path_buf(),
            destination: destination.to_path_buf(),
            error: err,
        },
    }
}

/// Capability used by the sandbox builder to place cache bodies.
///
/// The host implementation is [`HardLinker`]; tests substitute linkers that
/// simulate volumes the host cannot produce on demand.
pub trait Linker: Send + Sync {
    fn link(&self, source: &Path, destination: &Path) -> Result<(), LinkError>;
}

/// Links with the platform hardlink call
#[derive(Debug, Default, Clone, Copy)]
pub struct HardLinker;

impl Linker for HardLinker {
    fn link(&self, source: &Path, destination: &Path) -> Result<(), LinkError> {
        hardlink(source, destination)
    }
}

fn keep_first(slot: &mut Option<io::Error>, err: io::Error) {
    if slot.is_none() {
        *slot = Some(err);
    }
}

/// Walk `root` depth-first, making every directory writable before listing
/// it and handing every other entry to `on_entry`.
///
/// Failures on individual entries do not stop the walk; the first one is
/// returned at the end.
fn walk_unprotecting<F>(root: &Path, mut on_entry: F) -> io::Result<()>
where
    F: FnMut(&Path, &fs::Metadata) -> io::Result<()>,
{
    let mut first_error = None;
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];

    while let Some(path) = pending.pop() {
        let metadata = match fs::symlink_metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) => {
                keep_first(&mut first_error, e);
                continue;
            }
        };

        if !metadata.is_dir() {
            if let Err(e) = on_entry(&path, &metadata) {
                debug!("Could not release {}: {}", path.display(), e);
                keep_first(&mut first_error, e);
            }
            continue;
        }

        if let Err(e) = set_read_only(&path, false) {
            debug!("Could not make {} writable: {}", path.display(), e);
            keep_first(&mut first_error, e);
        }
        match fs::read_dir(&path) {
            Ok(entries) => {
                for entry in entries {
                    match entry {
                        Ok(entry) => pending.push(entry.path()),
                        Err(e) => keep_first(&mut first_error, e),
                    }
                }
            }
            Err(e) => keep_first(&mut first_error, e),
        }
    }

    first_error.map_or(Ok(()), Err)
}

/// Clear read-only protection on `root` and every entry beneath it.
///
/// Parents are unprotected before their children are listed, so a tree made
/// entirely read-only can still be walked. A file that shares its body with
/// a cache entry is unprotected in the cache too, so sandboxes are torn down
/// with [`remove_tree`] instead.
pub fn make_tree_writable(root: &Path) -> io::Result<()> {
    walk_unprotecting(root, |path, _| set_read_only(path, false))
}

/// Remove one name of a possibly protected file, leaving any other names of
/// its body protected.
pub fn remove_file(path: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    platform::detach_protected(path, &metadata)?;
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Delete a directory tree. A missing root is not an error.
///
/// Directories are unprotected so their entries can be removed. Protected
/// files keep their body's protection: on POSIX unlinking never needs it
/// lifted, and on Windows the name is detached and the body re-protected
/// for the names that remain.
pub fn remove_tree(root: &Path) -> io::Result<()> {
    match fs::symlink_metadata(root) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
        Ok(_) => {}
    }

    if let Err(e) = walk_unprotecting(root, platform::detach_protected) {
        warn!("Some entries under {} stayed protected: {}", root.display(), e);
    }
    fs::remove_dir_all(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, PathBuf, PathBuf) {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("foo");
        let file = dir.join("bar");
        fs::create_dir(&dir).unwrap();
        fs::write(&file, b"bar").unwrap();
        (temp, dir, file)
    }

    #[test]
    fn set_read_only_is_idempotent() {
        let (temp, _dir, file) = fixture();
        set_read_only(&file, true).unwrap();
        set_read_only(&file, true).unwrap();
        assert!(fs::metadata(&file).unwrap().permissions().readonly());
        set_read_only(&file, false).unwrap();
        set_read_only(&file, false).unwrap();
        assert!(!fs::metadata(&file).unwrap().permissions().readonly());
        make_tree_writable(temp.path()).unwrap();
    }

    #[test]
    fn hardlink_shares_mode() {
        let (temp, dir, file) = fixture();
        let link = dir.join("link");
        hardlink(&file, &link).unwrap();
        assert!(!fs::metadata(&link).unwrap().permissions().readonly());

        set_read_only(&file, true).unwrap();
        assert!(fs::metadata(&file).unwrap().permissions().readonly());
        assert!(fs::metadata(&link).unwrap().permissions().readonly());

        set_read_only(&link, false).unwrap();
        assert!(!fs::metadata(&file).unwrap().permissions().readonly());
        make_tree_writable(temp.path()).unwrap();
    }

    #[test]
    fn hardlink_existing_destination() {
        let (_temp, dir, file) = fixture();
        let other = dir.join("other");
        fs::write(&other, b"x").unwrap();
        let err = hardlink(&file, &other).unwrap_err();
        assert!(matches!(err, LinkError::AlreadyExists(p) if p == other));
    }

    #[test]
    fn hardlink_missing_source() {
        let (_temp, dir, _file) = fixture();
        let missing = dir.join("missing");
        let err = hardlink(&missing, &dir.join("link")).unwrap_err();
        assert!(matches!(err, LinkError::NotFound(p) if p == missing));
    }

    #[test]
    fn hardlinker_capability_links() {
        let (_temp, dir, file) = fixture();
        let link = dir.join("via-linker");
        HardLinker.link(&file, &link).unwrap();
        assert_eq!(fs::read(&link).unwrap(), b"bar");
    }

    #[test]
    fn remove_tree_handles_protected_entries() {
        let (temp, dir, file) = fixture();
        let nested = dir.join("nested");
        fs::create_dir(&nested).unwrap();
        fs::write(nested.join("deep"), b"deep").unwrap();
        set_read_only(&nested.join("deep"), true).unwrap();
        set_read_only(&file, true).unwrap();
        set_read_only(&nested, true).unwrap();
        set_read_only(&dir, true).unwrap();

        remove_tree(&dir).unwrap();
        assert!(!dir.exists());
        assert!(temp.path().exists());
    }

    #[test]
    fn remove_tree_keeps_shared_bodies_protected() {
        let temp = TempDir::new().unwrap();
        let entry = temp.path().join("entry");
        fs::write(&entry, b"shared").unwrap();
        set_read_only(&entry, true).unwrap();

        let first = temp.path().join("first");
        let second = temp.path().join("second");
        for tree in [&first, &second] {
            fs::create_dir_all(tree.join("sub")).unwrap();
            hardlink(&entry, &tree.join("sub/file")).unwrap();
        }

        remove_tree(&first).unwrap();
        assert!(!first.exists());
        assert!(fs::metadata(&entry).unwrap().permissions().readonly());
        assert!(fs::metadata(second.join("sub/file")).unwrap().permissions().readonly());
        assert_eq!(fs::read(&entry).unwrap(), b"shared");

        remove_tree(&second).unwrap();
        assert!(fs::metadata(&entry).unwrap().permissions().readonly());
        make_tree_writable(temp.path()).unwrap();
    }

    #[test]
    fn remove_file_leaves_other_names_protected() {
        let (temp, dir, file) = fixture();
        let link = dir.join("link");
        hardlink(&file, &link).unwrap();
        set_read_only(&file, true).unwrap();

        remove_file(&file).unwrap();
        assert!(!file.exists());
        assert!(fs::metadata(&link).unwrap().permissions().readonly());
        assert_eq!(fs::read(&link).unwrap(), b"bar");
        make_tree_writable(temp.path()).unwrap();
    }

    #[test]
    fn remove_tree_missing_root_is_ok() {
        let temp = TempDir::new().unwrap();
        remove_tree(&temp.path().join("never-created")).unwrap();
    }

    #[cfg(unix)]
    mod posix {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn mode(path: &Path) -> u32 {
            fs::symlink_metadata(path).unwrap().permissions().mode()
        }

        fn chmod(path: &Path, mode: u32) {
            fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
        }

        /// Root bypasses directory permission checks, so denial cannot be
        /// observed.
        fn running_as_root() -> bool {
            unsafe { libc::geteuid() == 0 }
        }

        #[test]
        fn modes_follow_owner_bits() {
            let (temp, dir, file) = fixture();
            chmod(&dir, 0o777);
            chmod(&file, 0o664);

            set_read_only(&dir, false).unwrap();
            assert_eq!(mode(&dir), 0o040777);
            set_read_only(&file, true).unwrap();
            assert_eq!(mode(&file), 0o100400);
            set_read_only(&file, false).unwrap();
            assert_eq!(mode(&file), 0o100600);
            set_read_only(&dir, true).unwrap();
            assert_eq!(mode(&dir), 0o040500);
            set_read_only(&dir, false).unwrap();
            assert_eq!(mode(&dir), 0o040700);

            make_tree_writable(temp.path()).unwrap();
        }

        #[test]
        fn read_only_file_in_writable_dir_is_deletable() {
            let (_temp, dir, file) = fixture();
            set_read_only(&dir, false).unwrap();
            set_read_only(&file, true).unwrap();
            fs::remove_file(&file).unwrap();
            assert!(!file.exists());
        }

        #[test]
        fn writable_file_in_read_only_dir_is_not_deletable() {
            let (temp, dir, file) = fixture();
            set_read_only(&dir, true).unwrap();
            set_read_only(&file, false).unwrap();
            assert_eq!(mode(&dir) & 0o777, 0o500);
            assert_eq!(mode(&file) & 0o200, 0o200);
            if running_as_root() {
                eprintln!("skipping denial check: root bypasses directory permissions");
                make_tree_writable(temp.path()).unwrap();
                return;
            }
            let err = fs::remove_file(&file).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);

            // A read-only directory also blocks adding entries.
            assert!(fs::write(dir.join("new"), b"x").is_err());
            make_tree_writable(temp.path()).unwrap();
        }

        #[test]
        fn read_only_file_in_read_only_dir_is_not_deletable() {
            let (temp, dir, file) = fixture();
            set_read_only(&dir, true).unwrap();
            set_read_only(&file, true).unwrap();
            assert_eq!(mode(&dir) & 0o777, 0o500);
            assert_eq!(mode(&file) & 0o222, 0);
            if running_as_root() {
                eprintln!("skipping denial check: root bypasses directory permissions");
                make_tree_writable(temp.path()).unwrap();
                return;
            }
            assert!(fs::remove_file(&file).is_err());
            make_tree_writable(temp.path()).unwrap();
        }

        #[test]
        fn tree_writable_restores_owner_bits() {
            let (temp, dir, file) = fixture();
            set_read_only(&file, true).unwrap();
            set_read_only(&dir, true).unwrap();
            make_tree_writable(temp.path()).unwrap();
            assert_eq!(mode(&dir) & 0o700, 0o700);
            assert_eq!(mode(&file) & 0o200, 0o200);
        }

        #[test]
        fn symlinks_are_not_followed() {
            let (temp, dir, file) = fixture();
            let link = dir.join("sym");
            std::os::unix::fs::symlink(&file, &link).unwrap();
            set_read_only(&link, true).unwrap();
            assert!(!fs::metadata(&file).unwrap().permissions().readonly());
            make_tree_writable(temp.path()).unwrap();
        }

        #[test]
        fn set_executable_adds_owner_exec() {
            let (_temp, _dir, file) = fixture();
            chmod(&file, 0o644);
            set_executable(&file).unwrap();
            assert_eq!(mode(&file) & 0o777, 0o744);
            set_read_only(&file, true).unwrap();
            assert_eq!(mode(&file) & 0o777, 0o500);
        }
    }

    #[cfg(windows)]
    mod win {
        use super::*;

        #[test]
        fn read_only_file_in_writable_dir_is_not_deletable() {
            let (temp, dir, file) = fixture();
            set_read_only(&dir, false).unwrap();
            set_read_only(&file, true).unwrap();
            assert!(fs::remove_file(&file).is_err());
            make_tree_writable(temp.path()).unwrap();
        }

        #[test]
        fn writable_file_in_read_only_dir_is_deletable() {
            let (_temp, dir, file) = fixture();
            set_read_only(&dir, true).unwrap();
            set_read_only(&file, false).unwrap();
            fs::remove_file(&file).unwrap();
        }

        #[test]
        fn read_only_file_in_read_only_dir_is_not_deletable() {
            let (temp, dir, file) = fixture();
            set_read_only(&dir, true).unwrap();
            set_read_only(&file, true).unwrap();
            assert!(fs::remove_file(&file).is_err());
            make_tree_writable(temp.path()).unwrap();
        }
    }
}
