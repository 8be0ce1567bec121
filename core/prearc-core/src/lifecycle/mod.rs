//! Prearchive session lifecycle.
//!
//! [`Prearchive`] ties the collaborators together and exposes the operations
//! callers use on a staged session:
//!
//! - status queries ([`Prearchive::get_status`], [`Prearchive::potentially_ready`])
//! - registration and recovery ([`Prearchive::add_session`], [`Prearchive::reset_status`])
//! - archive decisions ([`Prearchive::is_auto_archive`], [`Prearchive::is_overwrite_files`])
//! - guarded work ([`Prearchive::rebuild_session`], [`Prearchive::delete_session`])
//!
//! Everything that mutates staged files runs inside [`Prearchive::run_transition`].

mod build;
mod decision;
mod transition;

pub use build::BuildRequest;
pub use decision::{
    ArchivePolicy, ArchiveRequest, RequestMetadata, REASON_AUTO_ARCHIVE, REASON_STANDARD_UPLOAD,
};
pub use transition::Settle;

use std::path::Path;
use std::sync::Arc;

use fs_err as fs;
use tracing::{debug, info, warn};

use crate::builder::{DirectorySessionBuilder, SessionDocument};
use crate::config::{ConfigProjectDirectory, PrearcConfig};
use crate::error::{PrearcError, Result};
use crate::locator::SessionLocator;
use crate::lock::SessionLockManager;
use crate::logs::SessionLogs;
use crate::services::{Authorizer, GrantAuthorizer, ProjectDirectory, SessionBuilder, SitePreferences};
use crate::status::{self, PrearcStatus, StatusTable};
use crate::store::{SessionStore, SqliteSessionStore};
use crate::types::{SessionRecord, Triple, User};

/// Shadow file taken while a session is being deleted.
pub const DELETE_LOCK_NAME: &str = ".deleting";

pub struct Prearchive {
    store: Arc<dyn SessionStore>,
    projects: Arc<dyn ProjectDirectory>,
    prefs: Arc<dyn SitePreferences>,
    builder: Arc<dyn SessionBuilder>,
    locator: SessionLocator,
    policy: ArchivePolicy,
    locks: SessionLockManager,
    logs: SessionLogs,
    statuses: StatusTable,
}

impl Prearchive {
    pub fn new(
        store: Arc<dyn SessionStore>,
        projects: Arc<dyn ProjectDirectory>,
        prefs: Arc<dyn SitePreferences>,
        auth: Arc<dyn Authorizer>,
        builder: Arc<dyn SessionBuilder>,
        locks: SessionLockManager,
    ) -> Self {
        let locator = SessionLocator::new(projects.clone(), prefs.clone(), auth);
        Prearchive {
            store,
            policy: ArchivePolicy::new(projects.clone(), prefs.clone()),
            projects,
            prefs,
            builder,
            logs: SessionLogs::new(locator.clone()),
            locator,
            locks,
            statuses: StatusTable::new(),
        }
    }

    /// Wires the bundled implementations from a loaded config: SQLite records
    /// under the cache root, config-backed projects and grant-based authorization.
    pub fn from_config(config: PrearcConfig) -> Result<Self> {
        let layout = config.layout();
        let store = SqliteSessionStore::open(&layout.record_db())?;
        let directory = Arc::new(ConfigProjectDirectory::new(config));
        Ok(Self::new(
            Arc::new(store),
            directory.clone(),
            directory,
            Arc::new(GrantAuthorizer),
            Arc::new(DirectorySessionBuilder),
            SessionLockManager::new(layout.lock_root()),
        ))
    }

    pub fn locator(&self) -> &SessionLocator {
        &self.locator
    }

    pub fn locks(&self) -> &SessionLockManager {
        &self.locks
    }

    pub fn logs(&self) -> &SessionLogs {
        &self.logs
    }

    pub fn store(&self) -> &dyn SessionStore {
        self.store.as_ref()
    }

    pub fn statuses(&self) -> &StatusTable {
        &self.statuses
    }

    pub fn policy(&self) -> &ArchivePolicy {
        &self.policy
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    pub fn get_status(&self, triple: &Triple) -> Result<Option<PrearcStatus>> {
        Ok(self.store.get(triple)?.map(|r| r.status))
    }

    pub fn potentially_ready(&self, triple: &Triple) -> Result<bool> {
        Ok(status::potentially_ready(self.get_status(triple)?))
    }

    /// Records for `project` (`None` for unassigned), after checking `user` may see them.
    pub fn list_sessions(&self, user: &User, project: Option<&str>) -> Result<Vec<SessionRecord>> {
        self.locator.prearc_dir(user, project, false)?;
        self.store.list_by_project(project)
    }

    /// Records sitting in a shadow state for longer than `threshold`.
    pub fn stuck_sessions(&self, threshold: chrono::Duration) -> Result<Vec<SessionRecord>> {
        Ok(self
            .store
            .list_all()?
            .into_iter()
            .filter(|r| r.status.is_in_process() && r.age() > threshold)
            .collect())
    }

    pub fn is_auto_archive(&self, request: &ArchiveRequest, metadata: &mut RequestMetadata) -> bool {
        self.policy.is_auto_archive(request, metadata)
    }

    pub fn is_overwrite_files(&self, request: &ArchiveRequest) -> bool {
        self.policy.is_overwrite_files(request)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Registration
    // ─────────────────────────────────────────────────────────────────────

    /// Derives a record from the staged session on disk and registers it.
    ///
    /// A session with a held lock is RECEIVING; one with a built document is
    /// READY; a bare directory is RECEIVING until it is built. `tag` replaces
    /// the document's correlation tag.
    pub fn add_session(&self, triple: &Triple, tag: Option<&str>) -> Result<SessionRecord> {
        let account = User::system();
        let session_dir = self.locator.session_dir(&account, triple, true)?;
        let document_path = self.locator.session_document(&account, triple, true)?;
        let document = SessionDocument::load(&document_path)?;

        if document.is_none() && !session_dir.is_dir() {
            return Err(PrearcError::SessionNotFound(triple.clone()));
        }

        let status = if self.locks.is_session_receiving(triple) {
            PrearcStatus::Receiving
        } else if document.is_some() {
            PrearcStatus::Ready
        } else {
            PrearcStatus::Receiving
        };

        let mut record = SessionRecord::new(triple.clone(), status);
        if let Some(doc) = document {
            record.subject = doc.subject;
            record.source = doc.source;
            record.tag = doc.tag;
        }
        if let Some(tag) = tag.map(str::trim).filter(|t| !t.is_empty()) {
            record.tag = Some(tag.to_string());
        }

        let stored = self.store.insert(record)?;
        info!(session = %triple, status = %stored.status, "Registered prearchive session");
        Ok(stored)
    }

    /// Registers every on-disk session under `project` that has no record yet.
    pub fn discover_sessions(&self, user: &User, project: Option<&str>) -> Result<Vec<SessionRecord>> {
        let mut added = Vec::new();
        for triple in self.locator.scan_sessions(user, project, false)? {
            if self.store.get(&triple)?.is_none() {
                added.push(self.add_session(&triple, None)?);
            }
        }
        debug!(project = ?project, added = added.len(), "Discovered prearchive sessions");
        Ok(added)
    }

    /// Forgets the record and re-derives it from disk, keeping its policy fields.
    ///
    /// Privileged: the interim `_DELETING` write skips authorization. If the
    /// session can no longer be derived, the captured policy is left behind as
    /// a tombstone so a later arrival still inherits it.
    pub fn reset_status(&self, triple: &Triple, tag: Option<&str>) -> Result<SessionRecord> {
        triple.validate()?;
        let captured = self.store.get(triple)?.map(|r| r.policy());
        if captured.is_some() {
            self.unsafe_set_status(triple, PrearcStatus::InProcessDeleting)?;
        }
        self.store.delete_cached_row(triple)?;

        let mut rebuilt = match self.add_session(triple, tag) {
            Ok(record) => record,
            Err(err) => {
                if let Some(policy) = &captured {
                    if let Err(bury_err) = self.store.bury(triple, policy) {
                        warn!(session = %triple, error = %bury_err, "Failed to keep policy after reset");
                    }
                }
                warn!(session = %triple, error = %err, "Reset could not re-derive session");
                return Err(err);
            }
        };
        if let Some(policy) = captured {
            rebuilt.apply_policy(&policy);
            rebuilt = self.store.update(&rebuilt)?;
        }
        info!(session = %triple, status = %rebuilt.status, "Reset prearchive session");
        Ok(rebuilt)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Status writes
    // ─────────────────────────────────────────────────────────────────────

    /// Sets the status after checking `user` may edit the session's project.
    pub fn set_status(&self, user: &User, triple: &Triple, status: PrearcStatus) -> Result<SessionRecord> {
        self.locator
            .prearc_dir(user, triple.project.as_deref(), false)?;
        self.unsafe_set_status(triple, status)
    }

    /// Sets the status with no permission check.
    pub fn unsafe_set_status(&self, triple: &Triple, status: PrearcStatus) -> Result<SessionRecord> {
        let record = transition::write_status(self.store.as_ref(), triple, status)?
            .ok_or_else(|| PrearcError::SessionNotFound(triple.clone()))?;
        debug!(session = %triple, status = %status, "Set prearchive status");
        Ok(record)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Guarded work
    // ─────────────────────────────────────────────────────────────────────

    /// Rebuilds the session document and refreshes the record from it.
    pub fn rebuild_session(&self, triple: &Triple, request: &BuildRequest) -> Result<SessionRecord> {
        let document = self
            .locator
            .session_document(&User::system(), triple, true)?;
        let settled = self.run_transition(triple, PrearcStatus::Building, |record| {
            self.build_session(triple, request)?;
            if let Some(doc) = SessionDocument::load(&document)? {
                record.subject = doc.subject.or(record.subject.take());
                if doc.tag.is_some() {
                    record.tag = doc.tag;
                }
            }
            Ok(Settle::Ready)
        })?;
        settled.ok_or_else(|| PrearcError::SessionNotFound(triple.clone()))
    }

    /// Removes the staged files and soft-deletes the record.
    ///
    /// Refused while any file lock is held for the session.
    pub fn delete_session(&self, user: &User, triple: &Triple) -> Result<()> {
        let session_dir = self.locator.session_dir(user, triple, false)?;
        let document = self.locator.session_document(user, triple, false)?;

        if let Some(filename) = self.locks.held_files(triple).into_iter().next() {
            return Err(PrearcError::SessionFileLock {
                triple: triple.clone(),
                filename,
            });
        }
        let lock = self.locks.lock_file(triple, DELETE_LOCK_NAME)?;

        let result = if self.store.get(triple)?.is_some() {
            self.run_transition(triple, PrearcStatus::Deleting, |_| {
                remove_session_files(&session_dir, &document)?;
                Ok(Settle::Remove)
            })
            .map(|_| ())
        } else {
            remove_session_files(&session_dir, &document)
        };

        lock.release();
        self.locks.clean_lock_dirs(triple);
        result?;

        if let Err(err) = self
            .logs
            .append(triple, &format!("Deleted by {}", user.login))
        {
            warn!(session = %triple, error = %err, "Failed to write session log");
        }
        info!(session = %triple, user = %user.login, "Deleted prearchive session");
        Ok(())
    }
}

fn remove_session_files(session_dir: &Path, document: &Path) -> Result<()> {
    if session_dir.is_dir() {
        fs::remove_dir_all(session_dir)
            .map_err(|e| PrearcError::io(format!("removing {}", session_dir.display()), e))?;
    }
    if document.is_file() {
        fs::remove_file(document)
            .map_err(|e| PrearcError::io(format!("removing {}", document.display()), e))?;
    }
    Ok(())
}
