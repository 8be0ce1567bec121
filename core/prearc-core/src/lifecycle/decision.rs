//! Auto-archive and overwrite decisions.
//!
//! Both are ordered precedence rules: the first branch that applies decides.
//! `is_auto_archive` also notes why in the request metadata. The note is
//! first-write-wins, so a caller that evaluates the decision more than once
//! keeps the reason from the first evaluation.

use std::sync::Arc;

use tracing::debug;

use crate::services::{ProjectDirectory, SitePreferences};
use crate::types::{is_unassigned, PrearchiveCode, SessionRecord};

pub const REASON_AUTO_ARCHIVE: &str = "auto-archive";
pub const REASON_STANDARD_UPLOAD: &str = "standard upload";

const ARCHIVE_URI: &str = "/archive";

/// Inputs to one archive decision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveRequest {
    pub project: Option<String>,
    /// The session record's own auto-archive code.
    pub record_code: Option<PrearchiveCode>,
    /// Import destination, e.g. `/prearchive` or `/archive/projects/X`.
    pub destination: Option<String>,
    pub auto_archive_override: Option<bool>,
    pub overwrite_override: Option<bool>,
}

impl ArchiveRequest {
    pub fn for_record(record: &SessionRecord) -> Self {
        ArchiveRequest {
            project: record.triple.project.clone(),
            record_code: record.auto_archive,
            ..Default::default()
        }
    }

    pub fn with_destination(mut self, destination: &str) -> Self {
        self.destination = Some(destination.to_string());
        self
    }

    fn project(&self) -> Option<&str> {
        if is_unassigned(self.project.as_deref()) {
            None
        } else {
            self.project.as_deref()
        }
    }

    fn targets_archive(&self) -> bool {
        self.destination
            .as_deref()
            .map(str::trim)
            .is_some_and(|d| d == ARCHIVE_URI || d.starts_with("/archive/"))
    }
}

/// Side-channel notes attached to a request while it is processed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMetadata {
    reason: Option<String>,
}

impl RequestMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Keeps an existing reason.
    pub fn record_reason(&mut self, reason: &str) {
        if self.reason.is_none() {
            self.reason = Some(reason.to_string());
        }
    }
}

#[derive(Clone)]
pub struct ArchivePolicy {
    projects: Arc<dyn ProjectDirectory>,
    prefs: Arc<dyn SitePreferences>,
}

impl ArchivePolicy {
    pub fn new(projects: Arc<dyn ProjectDirectory>, prefs: Arc<dyn SitePreferences>) -> Self {
        ArchivePolicy { projects, prefs }
    }

    /// Project policy code, else the site default.
    pub fn project_code(&self, project: &str) -> i32 {
        self.projects
            .prearchive_code(project)
            .unwrap_or_else(|| self.prefs.default_prearchive_code())
    }

    pub fn is_auto_archive(&self, request: &ArchiveRequest, metadata: &mut RequestMetadata) -> bool {
        let (decision, branch) = self.decide_auto_archive(request);
        metadata.record_reason(if decision {
            REASON_AUTO_ARCHIVE
        } else {
            REASON_STANDARD_UPLOAD
        });
        debug!(project = ?request.project, decision, branch, "Auto-archive decision");
        decision
    }

    fn decide_auto_archive(&self, request: &ArchiveRequest) -> (bool, &'static str) {
        let Some(project) = request.project() else {
            return (false, "unassigned");
        };
        if request
            .record_code
            .is_some_and(PrearchiveCode::requests_auto_archive)
        {
            return (true, "record");
        }
        if request.targets_archive() {
            return (true, "destination");
        }
        if let Some(value) = request.auto_archive_override {
            return (value, "override");
        }
        (
            self.project_code(project) >= PrearchiveCode::AUTO_ARCHIVE_THRESHOLD,
            "project",
        )
    }

    pub fn is_overwrite_files(&self, request: &ArchiveRequest) -> bool {
        let Some(project) = request.project() else {
            return false;
        };
        if let Some(value) = request.overwrite_override {
            return value;
        }
        if request.record_code == Some(PrearchiveCode::AutoArchiveOverwrite) {
            return true;
        }
        self.project_code(project) == PrearchiveCode::AutoArchiveOverwrite.code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigProjectDirectory, PrearcConfig, ProjectConfig};
    use std::path::Path;

    fn policy(project_code: Option<i32>) -> ArchivePolicy {
        let mut config = PrearcConfig::with_root(Path::new("/data"));
        config.projects.insert(
            "ALPHA".to_string(),
            ProjectConfig {
                prearchive_code: project_code,
                ..Default::default()
            },
        );
        let directory = Arc::new(ConfigProjectDirectory::new(config));
        ArchivePolicy::new(directory.clone(), directory)
    }

    fn request() -> ArchiveRequest {
        ArchiveRequest {
            project: Some("ALPHA".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn unassigned_never_auto_archives() {
        let policy = policy(Some(4));
        let mut meta = RequestMetadata::new();
        let req = ArchiveRequest {
            project: None,
            record_code: Some(PrearchiveCode::AutoArchiveOverwrite),
            destination: Some("/archive".to_string()),
            auto_archive_override: Some(true),
            overwrite_override: Some(true),
        };
        assert!(!policy.is_auto_archive(&req, &mut meta));
        assert_eq!(meta.reason(), Some(REASON_STANDARD_UPLOAD));
        assert!(!policy.is_overwrite_files(&req));
    }

    #[test]
    fn record_code_beats_project_policy() {
        let policy = policy(Some(0));
        let mut meta = RequestMetadata::new();
        let req = ArchiveRequest {
            record_code: Some(PrearchiveCode::AutoArchive),
            auto_archive_override: Some(false),
            ..request()
        };
        assert!(policy.is_auto_archive(&req, &mut meta));
        assert_eq!(meta.reason(), Some(REASON_AUTO_ARCHIVE));
    }

    #[test]
    fn archive_destination_ignores_the_override() {
        let policy = policy(Some(0));
        for destination in ["/archive", "/archive/projects/ALPHA"] {
            let mut meta = RequestMetadata::new();
            let req = ArchiveRequest {
                auto_archive_override: Some(false),
                ..request()
            }
            .with_destination(destination);
            assert!(policy.is_auto_archive(&req, &mut meta), "{destination}");
            assert_eq!(meta.reason(), Some(REASON_AUTO_ARCHIVE));
        }

        let mut meta = RequestMetadata::new();
        let req = request().with_destination("/archived");
        assert!(!policy.is_auto_archive(&req, &mut meta));
    }

    #[test]
    fn override_then_project_code() {
        let mut meta = RequestMetadata::new();
        let req = ArchiveRequest {
            auto_archive_override: Some(true),
            ..request()
        };
        assert!(policy(Some(0)).is_auto_archive(&req, &mut meta));

        let mut meta = RequestMetadata::new();
        assert!(policy(Some(4)).is_auto_archive(&request(), &mut meta));
        assert_eq!(meta.reason(), Some(REASON_AUTO_ARCHIVE));

        let mut meta = RequestMetadata::new();
        assert!(!policy(Some(0)).is_auto_archive(&request(), &mut meta));
        assert_eq!(meta.reason(), Some(REASON_STANDARD_UPLOAD));
    }

    #[test]
    fn missing_project_code_falls_back_to_site_default() {
        let mut meta = RequestMetadata::new();
        assert!(!policy(None).is_auto_archive(&request(), &mut meta));
        assert!(!policy(None).is_overwrite_files(&request()));
    }

    #[test]
    fn reason_is_first_write_wins() {
        let policy = policy(Some(0));
        let mut meta = RequestMetadata::new();
        assert!(!policy.is_auto_archive(&request(), &mut meta));
        let req = ArchiveRequest {
            record_code: Some(PrearchiveCode::AutoArchive),
            ..request()
        };
        assert!(policy.is_auto_archive(&req, &mut meta));
        assert_eq!(meta.reason(), Some(REASON_STANDARD_UPLOAD));
    }

    #[test]
    fn explicit_overwrite_override_wins() {
        let policy = policy(Some(0));
        let req = ArchiveRequest {
            record_code: Some(PrearchiveCode::AutoArchive),
            overwrite_override: Some(true),
            ..request()
        };
        assert!(policy.is_overwrite_files(&req));

        let req = ArchiveRequest {
            overwrite_override: Some(true),
            ..request()
        };
        assert!(policy.is_overwrite_files(&req));
    }

    #[test]
    fn overwrite_from_record_or_project_code() {
        let req = ArchiveRequest {
            record_code: Some(PrearchiveCode::AutoArchiveOverwrite),
            ..request()
        };
        assert!(policy(Some(0)).is_overwrite_files(&req));

        // Only the overwrite code itself counts, not "at least auto-archive".
        assert!(!policy(Some(4)).is_overwrite_files(&request()));
        assert!(policy(Some(5)).is_overwrite_files(&request()));
    }
}
