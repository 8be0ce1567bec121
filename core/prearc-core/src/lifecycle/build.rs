//! Session document building.

use tracing::{debug, info};

use crate::builder::{
    PARAM_LABEL, PARAM_PROJECT, PARAM_PROTOCOL, PARAM_SEPARATE_PET_MR, PARAM_SOURCE,
    PARAM_SUBJECT, PARAM_TIMEZONE, PARAM_VISIT,
};
use crate::error::{PrearcError, Result};
use crate::services::BuildParams;
use crate::types::{Triple, User};

use super::Prearchive;

/// Optional metadata forwarded to the session builder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildRequest {
    /// Used when set; otherwise the session folder name is the label.
    pub label: Option<String>,
    pub subject: Option<String>,
    pub visit: Option<String>,
    pub protocol: Option<String>,
    /// Falls back to the site timezone.
    pub timezone: Option<String>,
    pub source: Option<String>,
}

fn put(params: &mut BuildParams, key: &str, value: Option<&str>) {
    if let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) {
        params.insert(key.to_string(), value.to_string());
    }
}

impl Prearchive {
    /// The parameter map handed to the builder. Blank values are left out.
    pub fn build_params(&self, triple: &Triple, request: &BuildRequest) -> BuildParams {
        let mut params = BuildParams::new();

        if let Some(project) = triple.project.as_deref() {
            params.insert(PARAM_PROJECT.to_string(), project.to_string());
            let separate = self
                .projects
                .separate_pet_mr(project)
                .unwrap_or_else(|| self.prefs.separate_pet_mr());
            params.insert(PARAM_SEPARATE_PET_MR.to_string(), separate.to_string());
        }

        let label = request
            .label
            .as_deref()
            .filter(|l| !l.trim().is_empty())
            .unwrap_or(triple.folder.as_str());
        put(&mut params, PARAM_LABEL, Some(label));
        put(&mut params, PARAM_SUBJECT, request.subject.as_deref());
        put(&mut params, PARAM_VISIT, request.visit.as_deref());
        put(&mut params, PARAM_PROTOCOL, request.protocol.as_deref());
        let timezone = request
            .timezone
            .clone()
            .filter(|tz| !tz.trim().is_empty())
            .or_else(|| self.prefs.timezone());
        put(&mut params, PARAM_TIMEZONE, timezone.as_deref());
        put(&mut params, PARAM_SOURCE, request.source.as_deref());

        params
    }

    /// Runs the session builder over the staged directory.
    ///
    /// Leftover lock directories are cleared first. A builder that returns
    /// `false` or errors surfaces as [`PrearcError::SyncFailed`].
    pub fn build_session(&self, triple: &Triple, request: &BuildRequest) -> Result<()> {
        let account = User::system();
        let session_dir = self.locator.session_dir(&account, triple, true)?;
        let document = self.locator.session_document(&account, triple, true)?;

        self.locks.clean_lock_dirs(triple);

        let params = self.build_params(triple, request);
        debug!(session = %triple, params = ?params, "Building session document");

        match self.builder.build(&session_dir, &document, &params) {
            Ok(true) => {
                info!(session = %triple, "Built session document");
                Ok(())
            }
            Ok(false) => Err(PrearcError::SyncFailed {
                triple: triple.clone(),
                source: format!("builder did not produce {}", document.display()).into(),
            }),
            Err(source) => Err(PrearcError::SyncFailed {
                triple: triple.clone(),
                source,
            }),
        }
    }
}
