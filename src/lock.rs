//! Single-instance guard
//!
//! At most one nftsync process may reconcile at a time: the baseline steps are
//! separate nft invocations and two interleaved runs could both try to create
//! the same chain. The guard is a lock file holding the owner's pid as plain
//! decimal text.
//!
//! The file is published with its content already in place: the pid goes into
//! a sibling temporary file which is then hard-linked to the lock path. Like
//! `O_EXCL`, `link(2)` fails if the path exists, so a reader never sees a lock
//! without an owner.
//!
//! A lock left behind by a dead process is removed and acquisition is retried
//! exactly once.

use crate::core::error::{Error, Result};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::{Pid, getpid, getuid};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const LOCK_FILE: &str = "nftsync.lock";

/// A lock without a readable pid is only reclaimed once it is this old
const UNREADABLE_GRACE: Duration = Duration::from_secs(5);

/// A lock path candidate; `None` means "not applicable here"
type PathProvider = fn() -> Option<PathBuf>;

/// Candidates in priority order. The first that yields a path whose parent
/// directory exists wins.
const PROVIDERS: [PathProvider; 3] = [system_lock_path, runtime_lock_path, fallback_lock_path];

fn system_lock_path() -> Option<PathBuf> {
    getuid()
        .is_root()
        .then(|| Path::new("/run").join(LOCK_FILE))
}

fn runtime_lock_path() -> Option<PathBuf> {
    std::env::var_os("XDG_RUNTIME_DIR")
        .filter(|dir| !dir.is_empty())
        .map(|dir| PathBuf::from(dir).join(LOCK_FILE))
}

fn fallback_lock_path() -> Option<PathBuf> {
    Some(std::env::temp_dir().join(format!("nftsync-{}.lock", getuid())))
}

/// Resolves the lock path for the current user.
pub fn resolve_lock_path() -> PathBuf {
    PROVIDERS
        .iter()
        .filter_map(|provider| provider())
        .find(|path| path.parent().is_some_and(Path::is_dir))
        .unwrap_or_else(|| std::env::temp_dir().join(LOCK_FILE))
}

/// Whether `pid` names a live process other than this one.
///
/// `EPERM` means the process exists but belongs to someone else.
fn owner_alive(pid: i32) -> bool {
    if pid <= 0 || pid == getpid().as_raw() {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn read_owner(path: &Path) -> Option<i32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Whether the file at `path` was modified within [`UNREADABLE_GRACE`].
///
/// A modification time in the future counts as recent.
fn recently_modified(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map(|mtime| mtime.elapsed().unwrap_or_default())
        .is_ok_and(|age| age < UNREADABLE_GRACE)
}

/// Creates the lock at `path` already holding our pid; fails with
/// `AlreadyExists` if the path is taken.
fn create_exclusive(path: &Path) -> std::io::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let mut temp = tempfile::Builder::new()
        .prefix(".nftsync.lock.")
        .tempfile_in(parent)?;
    write!(temp, "{}", getpid())?;
    temp.as_file().sync_all()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))?;
    }
    // The temporary name is unlinked on drop; the lock path keeps the inode
    std::fs::hard_link(temp.path(), path)
}

/// Held lock; the file is removed on drop
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    /// Acquires the lock at `path`.
    ///
    /// # Errors
    ///
    /// - [`Error::LockContention`] if a live process owns the lock, if the lock
    ///   holds no readable pid but is younger than a few seconds, or if the
    ///   single retry after removing a stale lock loses to another process.
    ///   The reported pid is 0 when the owner is unknown
    /// - [`Error::Io`] for any other filesystem failure
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        match create_exclusive(&path) {
            Ok(()) => return Ok(Self::held(path)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        let owner = read_owner(&path);
        match owner {
            Some(pid) if owner_alive(pid) => return Err(Error::LockContention { pid, path }),
            None if recently_modified(&path) => {
                return Err(Error::LockContention { pid: 0, path });
            }
            _ => {}
        }

        match owner {
            Some(pid) => warn!("Removing stale lock {} (pid {pid} is gone)", path.display()),
            None => warn!("Removing unreadable lock {}", path.display()),
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        match create_exclusive(&path) {
            Ok(()) => Ok(Self::held(path)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(Error::LockContention {
                pid: read_owner(&path).unwrap_or_default(),
                path,
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn held(path: PathBuf) -> Self {
        debug!("Acquired lock {}", path.display());
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Leave the file alone if another process has since replaced it
        if read_owner(&self.path).is_some_and(|pid| pid != getpid().as_raw()) {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != ErrorKind::NotFound
        {
            warn!("Failed to remove lock {}: {e}", self.path.display());
        } else {
            debug!("Released lock {}", self.path.display());
        }
    }
}
