//! Resolves where a project's staged sessions live on disk.
//!
//! ```text
//! <staging_root>/                      unassigned sessions
//! <staging_root>/<project>/            default project area
//! <override>/                          project with a path override
//!     <timestamp>/<folder>/            session directory
//!     <timestamp>/<folder>.json        session document
//!     <timestamp>/logs/<folder>/       log sidecar
//! ```
//!
//! Overrides written by older deployments may carry an absolute path under a
//! legacy root. Those are rewritten relative to the current root the first
//! time they are looked up.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs_err as fs;
use tracing::{debug, info};

use crate::error::{PrearcError, Result};
use crate::services::{Authorizer, ProjectDirectory, SitePreferences};
use crate::timestamp::is_timestamp_dir;
use crate::types::{is_unassigned, Triple, User, UNASSIGNED};

pub const LOG_DIR_NAME: &str = "logs";

#[derive(Clone)]
pub struct SessionLocator {
    projects: Arc<dyn ProjectDirectory>,
    prefs: Arc<dyn SitePreferences>,
    auth: Arc<dyn Authorizer>,
}

impl SessionLocator {
    pub fn new(
        projects: Arc<dyn ProjectDirectory>,
        prefs: Arc<dyn SitePreferences>,
        auth: Arc<dyn Authorizer>,
    ) -> Self {
        SessionLocator {
            projects,
            prefs,
            auth,
        }
    }

    pub fn authorizer(&self) -> &dyn Authorizer {
        self.auth.as_ref()
    }

    /// Root staging directory for `project`.
    ///
    /// Unassigned sessions need an admin, a data admin or `allow_unassigned`.
    /// Project areas need edit access to the resolved project. The directory
    /// is not created here.
    pub fn prearc_dir(
        &self,
        user: &User,
        project: Option<&str>,
        allow_unassigned: bool,
    ) -> Result<PathBuf> {
        let root = PathBuf::from(self.prefs.staging_root());

        if is_unassigned(project) {
            if allow_unassigned || self.auth.is_site_admin(user) || self.auth.is_data_admin(user) {
                return ensure_not_file(root);
            }
            return Err(PrearcError::Unauthorized {
                user: user.login.clone(),
                project: UNASSIGNED.to_string(),
            });
        }

        let requested = project.map(str::trim).unwrap_or_default();
        let project_id = match self.projects.resolve_project(requested) {
            Some(id) => id,
            None if self.projects.path_override(requested).is_some() => requested.to_string(),
            None => return Err(PrearcError::ProjectNotFound(requested.to_string())),
        };
        // Overrides are keyed by project ID, so an alias lands in the same place.
        let path = match self.projects.path_override(&project_id) {
            Some(stored) => self.heal_override(&project_id, &stored, &root),
            None => root.join(&project_id),
        };

        if !self.auth.can_edit(user, &project_id) {
            return Err(PrearcError::Unauthorized {
                user: user.login.clone(),
                project: project_id,
            });
        }

        debug!(project = %project_id, path = %path.display(), "Resolved prearchive directory");
        ensure_not_file(path)
    }

    /// `<prearc_dir>/<timestamp>/<folder>`
    ///
    /// The triple is validated first, so no part of it can step outside the
    /// project's staging area.
    pub fn session_dir(&self, user: &User, triple: &Triple, allow_unassigned: bool) -> Result<PathBuf> {
        triple.validate()?;
        let base = self.prearc_dir(user, triple.project.as_deref(), allow_unassigned)?;
        Ok(base.join(&triple.timestamp).join(&triple.folder))
    }

    /// `<prearc_dir>/<timestamp>/<folder>.json`
    pub fn session_document(
        &self,
        user: &User,
        triple: &Triple,
        allow_unassigned: bool,
    ) -> Result<PathBuf> {
        triple.validate()?;
        let base = self.prearc_dir(user, triple.project.as_deref(), allow_unassigned)?;
        Ok(base
            .join(&triple.timestamp)
            .join(format!("{}.json", triple.folder)))
    }

    /// `<prearc_dir>/<timestamp>/logs/<folder>`
    pub fn log_dir(&self, user: &User, triple: &Triple, allow_unassigned: bool) -> Result<PathBuf> {
        triple.validate()?;
        let base = self.prearc_dir(user, triple.project.as_deref(), allow_unassigned)?;
        Ok(base
            .join(&triple.timestamp)
            .join(LOG_DIR_NAME)
            .join(&triple.folder))
    }

    /// Session folders present on disk for `project`, by walking its timestamp directories.
    pub fn scan_sessions(
        &self,
        user: &User,
        project: Option<&str>,
        allow_unassigned: bool,
    ) -> Result<Vec<Triple>> {
        let base = self.prearc_dir(user, project, allow_unassigned)?;
        let mut found = Vec::new();
        if !base.is_dir() {
            return Ok(found);
        }

        for timestamp in read_dir_names(&base)? {
            if !is_timestamp_dir(&timestamp) {
                continue;
            }
            for folder in read_dir_names(&base.join(&timestamp))? {
                if folder == LOG_DIR_NAME || !base.join(&timestamp).join(&folder).is_dir() {
                    continue;
                }
                found.push(Triple::new(project, &timestamp, &folder));
            }
        }
        found.sort();
        Ok(found)
    }

    fn heal_override(&self, project: &str, stored: &str, root: &Path) -> PathBuf {
        let stored_path = Path::new(stored);
        if stored_path.is_absolute() {
            for legacy in self.prefs.legacy_roots() {
                if let Ok(relative) = stored_path.strip_prefix(&legacy) {
                    let relative = relative.to_string_lossy().to_string();
                    info!(
                        project,
                        from = stored,
                        to = %relative,
                        "Rewriting legacy prearchive path relative to staging root"
                    );
                    self.projects.set_path_override(project, &relative);
                    return root.join(relative);
                }
            }
        }
        // Relative overrides hang off the root; absolute ones replace it.
        root.join(stored_path)
    }
}

fn ensure_not_file(path: PathBuf) -> Result<PathBuf> {
    if path.exists() && !path.is_dir() {
        return Err(PrearcError::NotADirectory(path));
    }
    Ok(path)
}

fn read_dir_names(dir: &Path) -> Result<Vec<String>> {
    let entries =
        fs::read_dir(dir).map_err(|e| PrearcError::io(format!("listing {}", dir.display()), e))?;
    Ok(entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .collect())
}
