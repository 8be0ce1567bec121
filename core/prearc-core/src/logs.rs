//! Per-session diagnostic log sidecar.
//!
//! Each entry is a file named `<epoch-millis>.log` in the session's log
//! directory. The directory is resolved through the [`SessionLocator`] as the
//! service account, so any caller can leave a note on any session. There is
//! no rotation or retention here.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local, Utc};
use fs_err as fs;
use tracing::debug;

use crate::error::{PrearcError, Result};
use crate::locator::SessionLocator;
use crate::types::{Triple, User};

const LOG_EXTENSION: &str = "log";

#[derive(Clone)]
pub struct SessionLogs {
    locator: SessionLocator,
    account: User,
}

impl SessionLogs {
    pub fn new(locator: SessionLocator) -> Self {
        SessionLogs {
            locator,
            account: User::system(),
        }
    }

    fn dir(&self, triple: &Triple) -> Result<PathBuf> {
        self.locator.log_dir(&self.account, triple, true)
    }

    /// Writes a new entry and returns its ID.
    pub fn append(&self, triple: &Triple, message: &str) -> Result<String> {
        let dir = self.dir(triple)?;
        fs::create_dir_all(&dir)
            .map_err(|e| PrearcError::io(format!("creating log dir {}", dir.display()), e))?;

        let mut millis = Utc::now().timestamp_millis();
        loop {
            let path = dir.join(format!("{millis}.{LOG_EXTENSION}"));
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => {
                    fs::write(&path, message)
                        .map_err(|e| PrearcError::io(format!("writing {}", path.display()), e))?;
                    debug!(session = %triple, id = millis, "Appended prearchive log entry");
                    return Ok(millis.to_string());
                }
                // Two entries in the same millisecond: take the next free ID.
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => millis += 1,
                Err(err) => {
                    return Err(PrearcError::io(format!("creating {}", path.display()), err))
                }
            }
        }
    }

    /// Entry IDs, oldest first.
    pub fn list(&self, triple: &Triple) -> Result<Vec<String>> {
        let dir = self.dir(triple)?;
        let mut ids: Vec<String> = log_files(&dir)?
            .into_iter()
            .filter_map(|(path, _)| entry_id(&path))
            .collect();
        ids.sort_by_key(|id| (id.len(), id.clone()));
        Ok(ids)
    }

    /// Full text of one entry, prefixed with its last-modified time.
    pub fn read(&self, triple: &Triple, id: &str) -> Result<String> {
        let dir = self.dir(triple)?;
        let path = dir.join(format!("{id}.{LOG_EXTENSION}"));
        if id.contains(['/', '\\']) || !path.is_file() {
            return Err(PrearcError::LogNotFound {
                triple: triple.clone(),
                id: id.to_string(),
            });
        }
        render(&path)
    }

    /// The most recently modified entry, if any.
    pub fn last(&self, triple: &Triple) -> Result<Option<String>> {
        let dir = self.dir(triple)?;
        let newest = log_files(&dir)?
            .into_iter()
            .max_by(|(a_path, a_time), (b_path, b_time)| {
                a_time.cmp(b_time).then_with(|| a_path.cmp(b_path))
            });
        match newest {
            Some((path, _)) => render(&path).map(Some),
            None => Ok(None),
        }
    }
}

fn entry_id(path: &Path) -> Option<String> {
    path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
}

fn log_files(dir: &Path) -> Result<Vec<(PathBuf, SystemTime)>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let entries =
        fs::read_dir(dir).map_err(|e| PrearcError::io(format!("listing {}", dir.display()), e))?;
    Ok(entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == LOG_EXTENSION))
        .filter_map(|path| {
            let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok()?;
            Some((path, modified))
        })
        .collect())
}

fn render(path: &Path) -> Result<String> {
    let content = fs::read_to_string(path)
        .map_err(|e| PrearcError::io(format!("reading {}", path.display()), e))?;
    let modified = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| PrearcError::io(format!("stat {}", path.display()), e))?;
    let stamp: DateTime<Local> = modified.into();
    Ok(format!("{}: {}", stamp.format("%Y-%m-%d %H:%M:%S"), content))
}
