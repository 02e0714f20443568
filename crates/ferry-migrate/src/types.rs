//! Common types for migration requests and results.

use crate::error::FailureInfo;
use crate::git::TransferMode;
use crate::history::AttemptStatus;
use crate::reconcile::{EnsureOptions, EntityKind, PolicyKind, ReconcileRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Override flags supplied by the caller for one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Update differing target entities in place.
    pub force: bool,

    /// Entity kinds that may be deleted and recreated when they differ.
    pub replace: BTreeSet<EntityKind>,

    /// Force-converge a target repository that already holds commits.
    pub allow_sync: bool,
}

impl RunOptions {
    /// Enable or disable in-place updates.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Allow destructive replacement of one entity kind.
    pub fn with_replace(mut self, kind: EntityKind) -> Self {
        self.replace.insert(kind);
        self
    }

    /// Enable or disable sync re-runs.
    pub fn with_allow_sync(mut self, allow: bool) -> Self {
        self.allow_sync = allow;
        self
    }

    /// Reconciler options for one entity kind.
    pub fn ensure_options(&self, kind: EntityKind) -> EnsureOptions {
        EnsureOptions {
            force: self.force,
            replace: self.replace.contains(&kind),
        }
    }
}

/// A branch policy to apply to the migrated repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySpec {
    pub kind: PolicyKind,

    /// Branch to protect; defaults to the source default branch.
    #[serde(default)]
    pub branch: Option<String>,

    #[serde(default = "default_blocking")]
    pub blocking: bool,

    /// Policy settings, compared key by key.
    #[serde(default)]
    pub settings: Map<String, Value>,
}

fn default_blocking() -> bool {
    true
}

impl PolicySpec {
    pub fn new(kind: PolicyKind) -> Self {
        Self {
            kind,
            branch: None,
            blocking: true,
            settings: Map::new(),
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }

    pub fn advisory(mut self) -> Self {
        self.blocking = false;
        self
    }
}

/// Wiki to provision in the target project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WikiSpec {
    /// Wiki name; defaults to `<repository>.wiki`.
    pub name: Option<String>,

    /// Publish the migrated repository as a code wiki.
    pub code_wiki: bool,

    /// Folder published by a code wiki.
    pub mapped_path: Option<String>,
}

/// Project-scoped group whose membership is reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub group: String,
    pub members: BTreeSet<String>,
}

/// Dependent configuration applied after the payload transfer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DependentConfig {
    pub policies: Vec<PolicySpec>,
    pub wiki: Option<WikiSpec>,
    pub groups: Vec<GroupSpec>,
}

impl DependentConfig {
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty() && self.wiki.is_none() && self.groups.is_empty()
    }
}

/// One entity to migrate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRequest {
    /// Source project path (e.g., "acme/app").
    pub entity_id: String,

    /// Target project name.
    pub target_project: String,

    /// Target repository name (defaults to the source project name).
    #[serde(default)]
    pub target_repository: Option<String>,

    /// Target project description; unmanaged when absent.
    #[serde(default)]
    pub project_description: Option<String>,

    /// Target project visibility; unmanaged when absent.
    #[serde(default)]
    pub project_visibility: Option<String>,

    #[serde(default)]
    pub options: RunOptions,

    #[serde(default)]
    pub dependents: DependentConfig,
}

impl MigrationRequest {
    /// Create a new migration request.
    pub fn new(entity_id: impl Into<String>, target_project: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            target_project: target_project.into(),
            target_repository: None,
            project_description: None,
            project_visibility: None,
            options: RunOptions::default(),
            dependents: DependentConfig::default(),
        }
    }

    /// Set the target repository name.
    pub fn with_repository_name(mut self, name: impl Into<String>) -> Self {
        self.target_repository = Some(name.into());
        self
    }

    /// Set the override flags.
    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the dependent configuration.
    pub fn with_dependents(mut self, dependents: DependentConfig) -> Self {
        self.dependents = dependents;
        self
    }

    /// Target repository name, falling back to the last source path segment.
    pub fn repository_name(&self) -> &str {
        self.target_repository
            .as_deref()
            .unwrap_or_else(|| self.entity_id.rsplit('/').next().unwrap_or(&self.entity_id))
    }
}

/// Per-entity migration stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Preparing,
    Reconciling,
    Transferring,
    ConfiguringDependents,
    Recorded,
    Failed,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Preparing => write!(f, "Preparing"),
            Self::Reconciling => write!(f, "Reconciling"),
            Self::Transferring => write!(f, "Transferring"),
            Self::ConfiguringDependents => write!(f, "Configuring dependents"),
            Self::Recorded => write!(f, "Recorded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Final status of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Success,
    /// Payload transferred, some dependent configuration failed.
    Partial,
    Failed,
    /// Cancelled before it started.
    NotStarted,
}

impl EntityStatus {
    /// History status for a recorded attempt.
    pub fn attempt_status(&self) -> Option<AttemptStatus> {
        match self {
            Self::Success => Some(AttemptStatus::Success),
            Self::Partial => Some(AttemptStatus::Partial),
            Self::Failed => Some(AttemptStatus::Failed),
            Self::NotStarted => None,
        }
    }
}

impl std::fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::Partial => write!(f, "PARTIAL"),
            Self::Failed => write!(f, "FAILED"),
            Self::NotStarted => write!(f, "NOT STARTED"),
        }
    }
}

/// Result of migrating one entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityResult {
    pub entity_id: String,
    pub target_project: String,
    pub status: EntityStatus,

    /// Last stage reached (`Recorded` on success, `Failed` on failure).
    pub stage: Stage,

    /// Stage the failure happened in.
    pub failed_stage: Option<Stage>,

    pub transfer_mode: Option<TransferMode>,

    /// What each reconciled target entity did.
    pub reconciled: Vec<ReconcileRecord>,

    pub failure: Option<FailureInfo>,

    pub warnings: Vec<String>,

    /// History length after this run.
    pub history_length: usize,

    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl EntityResult {
    /// A fresh result for a run that is starting now.
    pub fn start(request: &MigrationRequest) -> Self {
        Self {
            entity_id: request.entity_id.clone(),
            target_project: request.target_project.clone(),
            status: EntityStatus::Failed,
            stage: Stage::Preparing,
            failed_stage: None,
            transfer_mode: None,
            reconciled: Vec::new(),
            failure: None,
            warnings: Vec::new(),
            history_length: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// A result for an entity that never started.
    pub fn not_started(request: &MigrationRequest) -> Self {
        let mut result = Self::start(request);
        result.status = EntityStatus::NotStarted;
        result.finished_at = Some(result.started_at);
        result
    }

    /// Mark the run as finished.
    pub fn complete(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Whether the payload reached the target.
    pub fn is_successful(&self) -> bool {
        matches!(self.status, EntityStatus::Success | EntityStatus::Partial)
    }

    /// Add a warning to the result.
    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Get the duration of the run.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }

    /// Print a summary of the run.
    pub fn print_summary(&self) {
        println!("\n=== Migration Summary: {} ===\n", self.entity_id);
        println!("Target project:     {}", self.target_project);
        println!("Stage reached:      {}", self.stage);
        if let Some(mode) = self.transfer_mode {
            println!("Transfer mode:      {mode}");
        }
        println!("History entries:    {}", self.history_length);

        if !self.reconciled.is_empty() {
            println!("\nReconciled:");
            for record in &self.reconciled {
                match &record.detail {
                    Some(detail) => {
                        println!("  {} {}: {} ({detail})", record.kind, record.key, record.outcome)
                    }
                    None => println!("  {} {}: {}", record.kind, record.key, record.outcome),
                }
            }
        }

        if let Some(duration) = self.duration() {
            println!("\nCompleted in {} seconds", duration.num_seconds());
        }

        if let Some(failure) = &self.failure {
            let stage = self
                .failed_stage
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown stage".to_string());
            println!("\nFailed during {stage}: {failure}");
        }

        if !self.warnings.is_empty() {
            println!("\nWarnings ({}):", self.warnings.len());
            for warning in &self.warnings {
                println!("  - {warning}");
            }
        }

        println!("\nOverall Status: {}", self.status);
    }
}
