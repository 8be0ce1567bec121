//! Seams to the services the prearchive core consults but does not own:
//! project/path configuration, site preferences, authorization and the
//! session document builder.
//!
//! [`crate::config::ConfigProjectDirectory`] implements the first two from a
//! TOML file; [`GrantAuthorizer`] answers from the user's own grants;
//! [`crate::builder::DirectorySessionBuilder`] is the bundled builder.

use std::collections::BTreeMap;
use std::path::Path;

use crate::types::User;

/// Per-project path overrides, project resolution and policy lookup.
pub trait ProjectDirectory: Send + Sync {
    /// Stored path override for a project, absolute or relative to the staging root.
    fn path_override(&self, project: &str) -> Option<String>;

    /// Replaces a stored override (used when healing legacy absolute paths).
    fn set_path_override(&self, project: &str, path: &str);

    /// Resolves a project ID or alias to its canonical ID.
    fn resolve_project(&self, id_or_alias: &str) -> Option<String>;

    /// Project-level prearchive policy code, if the project sets one.
    fn prearchive_code(&self, project: &str) -> Option<i32>;

    /// Project-level "separate PET/MR" setting, if the project sets one.
    fn separate_pet_mr(&self, project: &str) -> Option<bool>;
}

/// Site-wide settings.
pub trait SitePreferences: Send + Sync {
    fn staging_root(&self) -> String;

    /// Roots that older deployments hard-coded into stored overrides.
    fn legacy_roots(&self) -> Vec<String>;

    fn separate_pet_mr(&self) -> bool;

    fn default_prearchive_code(&self) -> i32;

    fn timezone(&self) -> Option<String>;
}

pub trait Authorizer: Send + Sync {
    fn is_site_admin(&self, user: &User) -> bool;

    fn is_data_admin(&self, user: &User) -> bool;

    /// Can `user` edit session data tagged with `project`?
    fn can_edit(&self, user: &User, project: &str) -> bool;
}

/// Answers from the flags and grants carried on [`User`].
#[derive(Debug, Default, Clone, Copy)]
pub struct GrantAuthorizer;

impl Authorizer for GrantAuthorizer {
    fn is_site_admin(&self, user: &User) -> bool {
        user.site_admin
    }

    fn is_data_admin(&self, user: &User) -> bool {
        user.data_admin
    }

    fn can_edit(&self, user: &User, project: &str) -> bool {
        user.site_admin || user.data_admin || user.editable_projects.contains(project)
    }
}

/// Parameters handed to the session builder. Only non-blank values are present.
pub type BuildParams = BTreeMap<String, String>;

/// Assembles the session document for a staged directory.
///
/// `Ok(false)` and `Err` both count as failure; the caller wraps either into
/// a sync failure.
pub trait SessionBuilder: Send + Sync {
    fn build(
        &self,
        session_dir: &Path,
        document: &Path,
        params: &BuildParams,
    ) -> Result<bool, Box<dyn std::error::Error + Send + Sync>>;
}
