//! Core data types: session identity, session records, policy codes and users.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Component, Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PrearcError, Result};
use crate::locator::LOG_DIR_NAME;
use crate::status::PrearcStatus;
use crate::timestamp::is_timestamp_dir;

/// Project key used for sessions not yet associated with a project.
pub const UNASSIGNED: &str = "Unassigned";

/// Login of the service account used for background work and the log sidecar.
pub const SYSTEM_LOGIN: &str = "prearc-system";

/// True for a missing, blank or sentinel project.
pub fn is_unassigned(project: Option<&str>) -> bool {
    match project.map(str::trim) {
        None => true,
        Some(p) => p.is_empty() || p.eq_ignore_ascii_case(UNASSIGNED),
    }
}

/// True when `name` is exactly one plain path component: no separators, no
/// `.` or `..`, not absolute, not empty.
pub fn is_path_segment(name: &str) -> bool {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(segment)), None) => segment == name,
        _ => false,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Session Identity
// ═══════════════════════════════════════════════════════════════════════════════

/// (project, timestamp, folder): the natural key of a staged session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Triple {
    pub project: Option<String>,
    pub timestamp: String,
    pub folder: String,
}

impl Triple {
    pub fn new(project: Option<&str>, timestamp: &str, folder: &str) -> Self {
        let project = if is_unassigned(project) {
            None
        } else {
            project.map(|p| p.trim().to_string())
        };
        Triple {
            project,
            timestamp: timestamp.to_string(),
            folder: folder.to_string(),
        }
    }

    /// The project as stored on disk and in the record store.
    pub fn project_key(&self) -> &str {
        self.project.as_deref().unwrap_or(UNASSIGNED)
    }

    /// Checks every part is safe to join onto a staging or lock directory.
    ///
    /// The timestamp must be a timestamp directory name; project and folder
    /// must each be a single path segment, and the folder may not collide with
    /// the log sidecar directory.
    pub fn validate(&self) -> Result<()> {
        if let Some(project) = self.project.as_deref() {
            if !is_path_segment(project) {
                return Err(PrearcError::InvalidPathSegment {
                    field: "project",
                    value: project.to_string(),
                });
            }
        }
        if !is_timestamp_dir(&self.timestamp) {
            return Err(PrearcError::InvalidTimestamp(self.timestamp.clone()));
        }
        if !is_path_segment(&self.folder) || self.folder == LOG_DIR_NAME {
            return Err(PrearcError::InvalidPathSegment {
                field: "folder",
                value: self.folder.clone(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Triple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.project_key(), self.timestamp, self.folder)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Prearchive policy code controlling automatic promotion to the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrearchiveCode {
    Manual,
    AutoArchive,
    AutoArchiveOverwrite,
}

impl PrearchiveCode {
    /// Numeric codes at or above this threshold mean auto-archive.
    pub const AUTO_ARCHIVE_THRESHOLD: i32 = 4;

    pub fn code(self) -> i32 {
        match self {
            PrearchiveCode::Manual => 0,
            PrearchiveCode::AutoArchive => 4,
            PrearchiveCode::AutoArchiveOverwrite => 5,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(PrearchiveCode::Manual),
            4 => Some(PrearchiveCode::AutoArchive),
            5 => Some(PrearchiveCode::AutoArchiveOverwrite),
            _ => None,
        }
    }

    pub fn requests_auto_archive(self) -> bool {
        self.code() >= Self::AUTO_ARCHIVE_THRESHOLD
    }
}

/// Operator-set fields that survive deletion and re-derivation of a record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PolicyFields {
    pub auto_archive: Option<PrearchiveCode>,
    pub prevent_anon: bool,
    pub prevent_auto_commit: bool,
    pub source: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Session Record
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub triple: Triple,
    pub status: PrearcStatus,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub auto_archive: Option<PrearchiveCode>,
    #[serde(default)]
    pub prevent_anon: bool,
    #[serde(default)]
    pub prevent_auto_commit: bool,
    /// Study-level correlation identifier.
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    pub last_modified: DateTime<Utc>,
    /// Bumped by the store on every write; updates compare against it.
    #[serde(default)]
    pub version: u64,
}

impl SessionRecord {
    pub fn new(triple: Triple, status: PrearcStatus) -> Self {
        SessionRecord {
            triple,
            status,
            source: None,
            auto_archive: None,
            prevent_anon: false,
            prevent_auto_commit: false,
            tag: None,
            subject: None,
            last_modified: Utc::now(),
            version: 0,
        }
    }

    pub fn policy(&self) -> PolicyFields {
        PolicyFields {
            auto_archive: self.auto_archive,
            prevent_anon: self.prevent_anon,
            prevent_auto_commit: self.prevent_auto_commit,
            source: self.source.clone(),
        }
    }

    /// Overwrites the policy fields unconditionally.
    pub fn apply_policy(&mut self, policy: &PolicyFields) {
        self.auto_archive = policy.auto_archive;
        self.prevent_anon = policy.prevent_anon;
        self.prevent_auto_commit = policy.prevent_auto_commit;
        self.source = policy.source.clone();
    }

    /// Fills policy fields this record leaves unset from a previous incarnation.
    pub fn carry_over(&mut self, previous: &PolicyFields) {
        if self.auto_archive.is_none() {
            self.auto_archive = previous.auto_archive;
        }
        if self.source.is_none() {
            self.source = previous.source.clone();
        }
        self.prevent_anon |= previous.prevent_anon;
        self.prevent_auto_commit |= previous.prevent_auto_commit;
    }

    /// Time spent in the current status, measured from the last write.
    pub fn age(&self) -> chrono::Duration {
        Utc::now().signed_duration_since(self.last_modified)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Users
// ═══════════════════════════════════════════════════════════════════════════════

/// The acting user, with the grants the bundled authorizer consults.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct User {
    pub login: String,
    #[serde(default)]
    pub site_admin: bool,
    #[serde(default)]
    pub data_admin: bool,
    #[serde(default)]
    pub editable_projects: BTreeSet<String>,
}

impl User {
    pub fn new(login: &str) -> Self {
        User {
            login: login.to_string(),
            ..Default::default()
        }
    }

    /// The service account. Site admin, so it passes every permission check.
    pub fn system() -> Self {
        User {
            login: SYSTEM_LOGIN.to_string(),
            site_admin: true,
            ..Default::default()
        }
    }

    pub fn with_edit(mut self, project: &str) -> Self {
        self.editable_projects.insert(project.to_string());
        self
    }

    pub fn with_data_admin(mut self) -> Self {
        self.data_admin = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unassigned_variants_normalize_to_none() {
        for project in [None, Some(""), Some("  "), Some("Unassigned"), Some("unassigned")] {
            let triple = Triple::new(project, "20240102_030405", "S1");
            assert_eq!(triple.project, None, "{project:?}");
            assert_eq!(triple.project_key(), UNASSIGNED);
        }
        let triple = Triple::new(Some(" ALPHA "), "20240102_030405", "S1");
        assert_eq!(triple.project.as_deref(), Some("ALPHA"));
    }

    #[test]
    fn path_segments_reject_traversal_and_separators() {
        for name in ["S1", ".deleting", "scan 1.dcm", "SUBJ01_MR1"] {
            assert!(is_path_segment(name), "{name}");
        }
        for name in ["", ".", "..", "a/b", "/abs", "../../BETA", "S1/", "./S1"] {
            assert!(!is_path_segment(name), "{name}");
        }
    }

    #[test]
    fn triples_that_escape_their_directory_are_rejected() {
        assert!(Triple::new(Some("ALPHA"), "20240102_030405", "S1").validate().is_ok());
        assert!(Triple::new(None, "20240102_030405678", "S1").validate().is_ok());

        for folder in ["..", "../../BETA", "a/b", "/etc", "logs", ""] {
            let err = Triple::new(Some("ALPHA"), "20240102_030405", folder)
                .validate()
                .unwrap_err();
            assert!(
                matches!(err, PrearcError::InvalidPathSegment { field: "folder", .. }),
                "{folder}: {err}"
            );
        }

        let err = Triple::new(Some("ALPHA"), "..", "S1").validate().unwrap_err();
        assert!(matches!(err, PrearcError::InvalidTimestamp(_)));

        let err = Triple::new(Some("../BETA"), "20240102_030405", "S1")
            .validate()
            .unwrap_err();
        assert!(matches!(err, PrearcError::InvalidPathSegment { field: "project", .. }));
    }

    #[test]
    fn prearchive_codes_round_trip_and_threshold() {
        for code in [
            PrearchiveCode::Manual,
            PrearchiveCode::AutoArchive,
            PrearchiveCode::AutoArchiveOverwrite,
        ] {
            assert_eq!(PrearchiveCode::from_code(code.code()), Some(code));
        }
        assert!(!PrearchiveCode::Manual.requests_auto_archive());
        assert!(PrearchiveCode::AutoArchive.requests_auto_archive());
        assert!(PrearchiveCode::AutoArchiveOverwrite.requests_auto_archive());
        assert_eq!(PrearchiveCode::from_code(3), None);
    }

    #[test]
    fn carry_over_fills_only_unset_fields() {
        let triple = Triple::new(Some("ALPHA"), "20240102_030405", "S1");
        let mut record = SessionRecord::new(triple, PrearcStatus::Ready);
        record.source = Some("NEW-SCP".to_string());

        record.carry_over(&PolicyFields {
            auto_archive: Some(PrearchiveCode::AutoArchiveOverwrite),
            prevent_anon: true,
            prevent_auto_commit: false,
            source: Some("OLD-SCP".to_string()),
        });

        assert_eq!(record.auto_archive, Some(PrearchiveCode::AutoArchiveOverwrite));
        assert!(record.prevent_anon);
        assert!(!record.prevent_auto_commit);
        assert_eq!(record.source.as_deref(), Some("NEW-SCP"));
    }

    #[test]
    fn system_user_is_site_admin() {
        let user = User::system();
        assert!(user.site_admin);
        assert_eq!(user.login, SYSTEM_LOGIN);
    }
}
