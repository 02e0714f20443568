//! Bulk migration of many entities with failure isolation.

use crate::error::{MigrationError, Result};
use crate::history::write_atomic;
use crate::orchestrator::Orchestrator;
use crate::types::{EntityResult, EntityStatus, MigrationRequest};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

const RUNS_DIR: &str = "runs";

/// Aggregate counts of a bulk run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkTotals {
    pub total: usize,
    /// SUCCESS and PARTIAL entities (payload transferred).
    pub succeeded: usize,
    pub partial: usize,
    pub failed: usize,
    pub not_started: usize,
    pub elapsed_ms: u64,
}

impl BulkTotals {
    pub fn from_entries(entries: &[EntityResult], elapsed: Duration) -> Self {
        let mut totals = Self {
            total: entries.len(),
            elapsed_ms: elapsed.as_millis() as u64,
            ..Self::default()
        };
        for entry in entries {
            match entry.status {
                EntityStatus::Success => totals.succeeded += 1,
                EntityStatus::Partial => {
                    totals.succeeded += 1;
                    totals.partial += 1;
                }
                EntityStatus::Failed => totals.failed += 1,
                EntityStatus::NotStarted => totals.not_started += 1,
            }
        }
        totals
    }
}

/// Where and with what a run was executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEnvironment {
    pub tool_version: String,
    pub os: String,
    pub arch: String,
    pub host: Option<String>,
    pub source_url: String,
    pub target_url: String,
    pub api_version: Option<String>,
    pub parallelism: usize,
}

impl RunEnvironment {
    fn capture(orchestrator: &Orchestrator) -> Self {
        let config = orchestrator.config();
        Self {
            tool_version: crate::VERSION.to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            host: std::env::var("HOSTNAME").ok(),
            source_url: config.source.base_url.clone(),
            target_url: config.target.organization_url.clone(),
            api_version: config.target.api_version.clone(),
            parallelism: config.parallelism,
        }
    }
}

/// Outcome of a bulk run, persisted as the run manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkRun {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub environment: RunEnvironment,
    pub totals: BulkTotals,
    pub entries: Vec<EntityResult>,
}

impl BulkRun {
    /// `<work_dir>/runs/<run_id>.json`.
    pub fn manifest_path(work_dir: &Path, run_id: &str) -> PathBuf {
        work_dir.join(RUNS_DIR).join(format!("{run_id}.json"))
    }

    /// Write the run manifest under `work_dir`.
    pub fn persist(&self, work_dir: &Path) -> Result<PathBuf> {
        let path = Self::manifest_path(work_dir, &self.run_id);
        let dir = work_dir.join(RUNS_DIR);
        std::fs::create_dir_all(&dir).map_err(|e| MigrationError::Persistence {
            path: dir.clone(),
            message: e.to_string(),
        })?;
        write_atomic(&path, self)?;
        Ok(path)
    }

    /// Read a run manifest.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Print a summary of the run.
    pub fn print_summary(&self) {
        println!("\n=== Bulk Run {} ===\n", self.run_id);
        println!("Entities:     {}", self.totals.total);
        println!("Succeeded:    {}", self.totals.succeeded);
        if self.totals.partial > 0 {
            println!("  (partial):  {}", self.totals.partial);
        }
        println!("Failed:       {}", self.totals.failed);
        if self.totals.not_started > 0 {
            println!("Not started:  {}", self.totals.not_started);
        }
        println!("Elapsed:      {:.1}s", self.totals.elapsed_ms as f64 / 1000.0);

        let failed: Vec<_> = self
            .entries
            .iter()
            .filter(|e| e.status == EntityStatus::Failed)
            .collect();
        if !failed.is_empty() {
            println!("\nFailures:");
            for entry in failed {
                match &entry.failure {
                    Some(failure) => println!("  {}: {failure}", entry.entity_id),
                    None => println!("  {}", entry.entity_id),
                }
            }
        }
    }
}

/// Runs many entities through one [`Orchestrator`].
pub struct BulkRunner {
    orchestrator: Arc<Orchestrator>,
    cancel: CancellationToken,
}

impl BulkRunner {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that stops new entities from starting when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Migrate every request. Entity failures never stop the batch; entries
    /// keep the order of `requests`.
    pub async fn run(&self, requests: &[MigrationRequest]) -> BulkRun {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let clock = Instant::now();
        let parallelism = self.orchestrator.config().parallelism.max(1);

        info!(
            run_id = %run_id,
            total = requests.len(),
            parallelism,
            "Starting bulk run"
        );
        if let Some(progress) = self.orchestrator.progress() {
            progress.set_total(requests.len() as u64);
        }

        let orchestrator = &self.orchestrator;
        let cancel = &self.cancel;
        let mut indexed: Vec<(usize, EntityResult)> = stream::iter(requests.iter().enumerate())
            .map(move |(index, request)| async move {
                if cancel.is_cancelled() {
                    info!(entity = %request.entity_id, "Run cancelled, not starting entity");
                    if let Some(progress) = orchestrator.progress() {
                        progress.finish_entity(&request.entity_id, EntityStatus::NotStarted);
                    }
                    return (index, EntityResult::not_started(request));
                }
                (index, orchestrator.migrate(request).await)
            })
            .buffer_unordered(parallelism)
            .collect()
            .await;
        indexed.sort_by_key(|(index, _)| *index);
        let entries: Vec<EntityResult> = indexed.into_iter().map(|(_, entry)| entry).collect();

        let totals = BulkTotals::from_entries(&entries, clock.elapsed());
        let run = BulkRun {
            run_id,
            started_at,
            finished_at: Utc::now(),
            environment: RunEnvironment::capture(orchestrator),
            totals,
            entries,
        };

        info!(
            run_id = %run.run_id,
            total = run.totals.total,
            succeeded = run.totals.succeeded,
            partial = run.totals.partial,
            failed = run.totals.failed,
            not_started = run.totals.not_started,
            elapsed_ms = run.totals.elapsed_ms,
            "Bulk run finished"
        );

        let work_dir = orchestrator.config().work_dir.clone();
        match run.persist(&work_dir) {
            Ok(path) => info!(manifest = %path.display(), "Run manifest written"),
            Err(e) => warn!(run_id = %run.run_id, error = %e, "Failed to write run manifest"),
        }
        run
    }

    /// One request per project of a source group, built from `template`.
    pub async fn plan_group(
        &self,
        group: &str,
        template: &MigrationRequest,
    ) -> Result<Vec<MigrationRequest>> {
        let projects = self.orchestrator.source().list_group_projects(group).await?;

        let mut seen: HashMap<String, String> = HashMap::new();
        let mut requests = Vec::with_capacity(projects.len());
        for project in projects {
            let mut request = template.clone();
            request.entity_id = project.path_with_namespace;
            request.target_repository = None;

            let name = request.repository_name().to_lowercase();
            if let Some(first) = seen.get(&name) {
                warn!(
                    entity = %request.entity_id,
                    other = %first,
                    repository = %name,
                    "Two source projects map to the same target repository"
                );
            } else {
                seen.insert(name, request.entity_id.clone());
            }
            requests.push(request);
        }

        info!(group = %group, count = requests.len(), "Planned group migration");
        Ok(requests)
    }
}
