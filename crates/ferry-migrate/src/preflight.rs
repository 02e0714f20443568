//! Read-only source snapshot taken before anything is written to the target.

use crate::error::{MigrationError, Result};
use crate::git::{strip_credentials, MirrorStats};
use crate::history::write_atomic;
use crate::source::SourceProject;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

pub const PREFLIGHT_FILE: &str = "preflight.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightReport {
    pub entity_id: String,
    pub source_project_id: u64,
    pub default_branch: Option<String>,
    /// Bytes, as reported by the source platform.
    pub repository_size: u64,
    pub lfs_enabled: bool,
    pub visibility: String,
    /// Clone URL without credentials.
    pub clone_url: String,
    pub mirror: MirrorStats,
    pub warnings: Vec<String>,
    pub blockers: Vec<String>,
    pub captured_at: DateTime<Utc>,
}

impl PreflightReport {
    pub fn capture(entity_id: &str, project: &SourceProject, mirror: MirrorStats) -> Self {
        let mut warnings = Vec::new();
        let mut blockers = Vec::new();

        if project.default_branch.is_none() || mirror.branches == 0 {
            blockers.push("source repository is empty (no default branch)".to_string());
        }
        if project.lfs_enabled {
            warnings.push(
                "LFS is enabled; LFS objects are not transferred by a mirror push".to_string(),
            );
        }
        if project.archived {
            warnings.push("source project is archived".to_string());
        }

        Self {
            entity_id: entity_id.to_string(),
            source_project_id: project.id,
            default_branch: project.default_branch.clone(),
            repository_size: project.repository_size(),
            lfs_enabled: project.lfs_enabled,
            visibility: project.visibility.clone(),
            clone_url: strip_credentials(&project.http_url_to_repo),
            mirror,
            warnings,
            blockers,
            captured_at: Utc::now(),
        }
    }

    /// Write the report as `preflight.json` in `dir`.
    pub fn persist(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir).map_err(|e| MigrationError::Persistence {
            path: dir.to_path_buf(),
            message: e.to_string(),
        })?;
        write_atomic(&dir.join(PREFLIGHT_FILE), self)?;
        info!(
            entity = %self.entity_id,
            size = self.repository_size,
            branches = self.mirror.branches,
            tags = self.mirror.tags,
            "Preflight captured"
        );
        for warning in &self.warnings {
            warn!(entity = %self.entity_id, "{warning}");
        }
        Ok(())
    }

    /// Read a previously persisted report.
    pub fn load(dir: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(dir.join(PREFLIGHT_FILE))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Fail when any blocker was found.
    pub fn ensure_clear(&self) -> Result<()> {
        if self.blockers.is_empty() {
            Ok(())
        } else {
            Err(MigrationError::PreflightBlocked {
                entity: self.entity_id.clone(),
                reasons: self.blockers.clone(),
            })
        }
    }
}
