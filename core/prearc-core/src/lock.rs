//! Advisory per-session file locks.
//!
//! Writers that touch a staged session (the receiver, destructive operations)
//! take a lock on a named shadow file under the lock area:
//!
//! ```text
//! <lock_root>/<project>/<timestamp>/<folder>/<filename>
//! ```
//!
//! The lock is a non-blocking `flock(LOCK_EX | LOCK_NB)` on the shadow file.
//! Because `flock` locks belong to the open file description, a second open
//! within the same process conflicts too. A session whose lock directory holds
//! any shadow file counts as still receiving, even if the holder crashed
//! without releasing it.
//!
//! Creating and pruning lock directories is serialized by one process-wide
//! mutex so pruning can never remove a directory a concurrent acquire is
//! about to populate. Release unlinks the shadow file while the flock is still
//! held; an acquire that locks a file no longer reachable at its path (it lost
//! a race with a release in another process) drops it and tries again.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use fs_err as fs;
use tracing::{debug, warn};

use crate::error::{PrearcError, Result};
use crate::types::{is_path_segment, Triple};

/// Attempts at locking a shadow file that keeps being replaced underneath us.
const ACQUIRE_ATTEMPTS: usize = 8;

static LOCK_DIR_GUARD: Mutex<()> = Mutex::new(());

fn lock_dir_guard() -> MutexGuard<'static, ()> {
    match LOCK_DIR_GUARD.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Clone)]
pub struct SessionLockManager {
    lock_root: PathBuf,
}

impl SessionLockManager {
    pub fn new(lock_root: PathBuf) -> Self {
        SessionLockManager { lock_root }
    }

    pub fn lock_root(&self) -> &Path {
        &self.lock_root
    }

    fn project_dir(&self, triple: &Triple) -> PathBuf {
        self.lock_root.join(triple.project_key())
    }

    fn timestamp_dir(&self, triple: &Triple) -> PathBuf {
        self.project_dir(triple).join(&triple.timestamp)
    }

    /// Lock directory for one session.
    pub fn session_lock_dir(&self, triple: &Triple) -> PathBuf {
        self.timestamp_dir(triple).join(&triple.folder)
    }

    /// Takes the advisory lock for `filename` in `triple`, failing immediately if held.
    pub fn lock_file(&self, triple: &Triple, filename: &str) -> Result<SessionFileLock> {
        triple.validate()?;
        if !is_path_segment(filename) {
            return Err(PrearcError::InvalidPathSegment {
                field: "lock file",
                value: filename.to_string(),
            });
        }

        let _guard = lock_dir_guard();

        let dir = self.session_lock_dir(triple);
        let path = dir.join(filename);
        for _ in 0..ACQUIRE_ATTEMPTS {
            fs::create_dir_all(&dir)
                .map_err(|e| PrearcError::io(format!("creating lock dir {}", dir.display()), e))?;
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .map_err(|e| PrearcError::io(format!("opening lock file {}", path.display()), e))?;

            match try_flock_exclusive(&file) {
                Ok(true) if still_linked(&file, &path) => {
                    debug!(session = %triple, filename, "Acquired session file lock");
                    return Ok(SessionFileLock {
                        file: Some(file),
                        path,
                    });
                }
                Ok(true) => {
                    debug!(session = %triple, filename, "Lock file was replaced, retrying");
                }
                Ok(false) => {
                    return Err(PrearcError::SessionFileLock {
                        triple: triple.clone(),
                        filename: filename.to_string(),
                    });
                }
                Err(err) => {
                    warn!(session = %triple, filename, error = %err, "Lock attempt failed");
                    return Err(PrearcError::SessionFileLock {
                        triple: triple.clone(),
                        filename: filename.to_string(),
                    });
                }
            }
        }

        warn!(session = %triple, filename, "Lock file kept changing, giving up");
        Err(PrearcError::SessionFileLock {
            triple: triple.clone(),
            filename: filename.to_string(),
        })
    }

    /// True iff the session's lock directory exists and holds at least one entry.
    pub fn is_session_receiving(&self, triple: &Triple) -> bool {
        if triple.validate().is_err() {
            return false;
        }
        let dir = self.session_lock_dir(triple);
        match std::fs::read_dir(&dir) {
            Ok(mut entries) => entries.next().is_some(),
            Err(_) => false,
        }
    }

    /// Names of the shadow files currently present for `triple`, sorted.
    pub fn held_files(&self, triple: &Triple) -> Vec<String> {
        if triple.validate().is_err() {
            return Vec::new();
        }
        let dir = self.session_lock_dir(triple);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .collect();
        names.sort();
        names
    }

    /// Removes the session, timestamp and project lock directories, each only if empty.
    pub fn clean_lock_dirs(&self, triple: &Triple) {
        if let Err(err) = triple.validate() {
            warn!(session = %triple, error = %err, "Refusing to clean lock dirs");
            return;
        }
        let _guard = lock_dir_guard();

        for dir in [
            self.session_lock_dir(triple),
            self.timestamp_dir(triple),
            self.project_dir(triple),
        ] {
            if !remove_if_empty(&dir) {
                break;
            }
        }
    }
}

/// Returns true when `dir` is gone afterwards, so the caller can move up a level.
fn remove_if_empty(dir: &Path) -> bool {
    let mut entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return true,
        Err(err) => {
            warn!(path = %dir.display(), error = %err, "Failed to inspect lock dir");
            return false;
        }
    };
    if entries.next().is_some() {
        return false;
    }
    match std::fs::remove_dir(dir) {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => {
            warn!(path = %dir.display(), error = %err, "Failed to remove lock dir");
            false
        }
    }
}

/// A held session file lock. Release explicitly; dropping releases too.
#[derive(Debug)]
pub struct SessionFileLock {
    file: Option<File>,
    path: PathBuf,
}

impl SessionFileLock {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the shadow file, then closes it. Cleanup errors are logged, not returned.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };
        let _guard = lock_dir_guard();
        // Unlink while the flock is still held so nobody can open this inode
        // by path and lock it once we close.
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "Failed to delete lock file");
            }
        }
        drop(file);
    }
}

impl Drop for SessionFileLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// True when `path` still names the open `file`.
fn still_linked(file: &File, path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        match (file.metadata(), std::fs::metadata(path)) {
            (Ok(open), Ok(linked)) => open.dev() == linked.dev() && open.ino() == linked.ino(),
            _ => false,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (file, path);
        true
    }
}

fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: `fd` is a valid descriptor owned by `file` for the duration of the call.
        #[allow(unsafe_code)]
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK)
        {
            return Ok(false);
        }
        Err(err)
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(true)
    }
}
