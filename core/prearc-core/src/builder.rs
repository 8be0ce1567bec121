//! Session documents and the bundled directory builder.
//!
//! A built session has a JSON document next to its directory
//! (`<timestamp>/<folder>.json`). The document is what `add_session` reads to
//! derive a record; a session without one has not been built yet.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use fs_err as fs;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use crate::error::{PrearcError, Result};
use crate::services::{BuildParams, SessionBuilder};

pub const PARAM_PROJECT: &str = "project";
pub const PARAM_SEPARATE_PET_MR: &str = "separatePetMr";
pub const PARAM_LABEL: &str = "label";
pub const PARAM_SUBJECT: &str = "subject";
pub const PARAM_VISIT: &str = "visit";
pub const PARAM_PROTOCOL: &str = "protocol";
pub const PARAM_TIMEZONE: &str = "timezone";
pub const PARAM_SOURCE: &str = "source";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionDocument {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    /// Study-level correlation identifier.
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub file_count: u64,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub built_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl SessionDocument {
    /// `Ok(None)` when the session has not been built.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.is_file() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .map_err(|e| PrearcError::io(format!("reading {}", path.display()), e))?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| PrearcError::Json {
                context: format!("parsing {}", path.display()),
                source: e,
            })
    }

    /// Writes through a temp file in the same directory, then renames.
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| PrearcError::NotADirectory(path.to_path_buf()))?;
        fs::create_dir_all(parent)
            .map_err(|e| PrearcError::io(format!("creating {}", parent.display()), e))?;

        let content = serde_json::to_string_pretty(self).map_err(|e| PrearcError::Json {
            context: "serializing session document".to_string(),
            source: e,
        })?;
        let mut temp = NamedTempFile::new_in(parent)
            .map_err(|e| PrearcError::io("creating temp session document", e))?;
        temp.write_all(content.as_bytes())
            .map_err(|e| PrearcError::io("writing temp session document", e))?;
        temp.persist(path)
            .map_err(|e| PrearcError::io(format!("persisting {}", path.display()), e.error))?;
        Ok(())
    }
}

/// Builds a document from the files found under the session directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectorySessionBuilder;

impl SessionBuilder for DirectorySessionBuilder {
    fn build(
        &self,
        session_dir: &Path,
        document: &Path,
        params: &BuildParams,
    ) -> std::result::Result<bool, Box<dyn std::error::Error + Send + Sync>> {
        if !session_dir.is_dir() {
            return Ok(false);
        }

        let mut file_count = 0;
        let mut total_bytes = 0;
        for entry in WalkDir::new(session_dir).follow_links(false) {
            let entry = entry?;
            if entry.file_type().is_file() {
                file_count += 1;
                total_bytes += entry.metadata()?.len();
            }
        }

        let doc = SessionDocument {
            label: params.get(PARAM_LABEL).cloned(),
            project: params.get(PARAM_PROJECT).cloned(),
            subject: params.get(PARAM_SUBJECT).cloned(),
            source: params.get(PARAM_SOURCE).cloned(),
            tag: None,
            file_count,
            total_bytes,
            built_at: Some(Utc::now()),
            params: params.clone(),
        };
        doc.save(document)?;
        Ok(true)
    }
}
