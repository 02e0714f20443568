//! Per-entity migration pipeline.
//!
//! `Preparing -> Reconciling -> Transferring -> ConfiguringDependents ->
//! Recorded`, with `Failed` reachable from every stage. Preparing only reads
//! from the source; everything after it runs under a per-target-project lock.

use crate::config::EndpointConfig;
use crate::error::{FailureInfo, MigrationError, Result, Side};
use crate::git::{GitTransfer, TransferMode};
use crate::history::{AttemptStatus, MigrationStateStore};
use crate::lock::KeyedLocks;
use crate::preflight::PreflightReport;
use crate::progress::MigrationProgress;
use crate::reconcile::{
    DesiredMembership, DesiredPolicy, DesiredProject, DesiredRepository, DesiredWiki,
    EnsureOptions, EnsureOutcome, EntityKind, MembershipOps, PolicyOps, ProjectOps, Reconciler,
    RepositoryOps, WikiOps,
};
use crate::source::{SourceClient, SourceProject};
use crate::target::{TargetClient, TargetProject, TargetRepository};
use crate::transport::Transport;
use crate::types::{EntityResult, EntityStatus, MigrationRequest, Stage};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const MIRROR_DIR: &str = "mirror.git";

/// Output of the Preparing stage.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub project: SourceProject,
    pub report: PreflightReport,
    /// Local bare mirror of the source repository.
    pub mirror: PathBuf,
}

/// Drives single entities through the migration stages.
pub struct Orchestrator {
    source: SourceClient,
    target: Arc<TargetClient>,
    git: Arc<dyn GitTransfer>,
    store: MigrationStateStore,
    project_locks: KeyedLocks,
    projects: Reconciler<ProjectOps>,
    repositories: Reconciler<RepositoryOps>,
    policies: Reconciler<PolicyOps>,
    wikis: Reconciler<WikiOps>,
    memberships: Reconciler<MembershipOps>,
    progress: Option<Arc<MigrationProgress>>,
}

impl Orchestrator {
    /// Create an orchestrator with its own transport.
    pub fn new(config: Arc<EndpointConfig>, git: Arc<dyn GitTransfer>) -> Result<Self> {
        let transport = Arc::new(Transport::new(config)?);
        Ok(Self::with_transport(transport, git))
    }

    /// Create an orchestrator on top of an existing transport.
    pub fn with_transport(transport: Arc<Transport>, git: Arc<dyn GitTransfer>) -> Self {
        let target = Arc::new(TargetClient::new(transport.clone()));
        let entity_locks = KeyedLocks::new();
        let store = MigrationStateStore::new(transport.config().work_dir.clone());

        Self {
            source: SourceClient::new(transport),
            projects: Reconciler::new(ProjectOps::new(target.clone()), entity_locks.clone()),
            repositories: Reconciler::new(RepositoryOps::new(target.clone()), entity_locks.clone()),
            policies: Reconciler::new(PolicyOps::new(target.clone()), entity_locks.clone()),
            wikis: Reconciler::new(WikiOps::new(target.clone()), entity_locks.clone()),
            memberships: Reconciler::new(MembershipOps::new(target.clone()), entity_locks),
            target,
            git,
            store,
            project_locks: KeyedLocks::new(),
            progress: None,
        }
    }

    /// Report stage changes to `progress`.
    pub fn with_progress(mut self, progress: Arc<MigrationProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn config(&self) -> &EndpointConfig {
        self.target.transport().config()
    }

    pub fn source(&self) -> &SourceClient {
        &self.source
    }

    pub fn target(&self) -> &TargetClient {
        &self.target
    }

    pub fn store(&self) -> &MigrationStateStore {
        &self.store
    }

    pub fn progress(&self) -> Option<&Arc<MigrationProgress>> {
        self.progress.as_ref()
    }

    /// Read-only source snapshot plus mirror fetch. Safe to re-run.
    pub async fn prepare(&self, request: &MigrationRequest) -> Result<Prepared> {
        let project = self.source.get_project(&request.entity_id).await?;
        let dir = self.store.entity_dir(&request.entity_id);
        let mirror = dir.join(MIRROR_DIR);

        let clone_url = self.source.authenticated_clone_url(&project)?;
        let stats = self.git.mirror_fetch(&clone_url, &mirror).await?;

        let report = PreflightReport::capture(&request.entity_id, &project, stats);
        report.persist(&dir)?;
        report.ensure_clear()?;

        Ok(Prepared {
            project,
            report,
            mirror,
        })
    }

    /// Run one entity through every stage. Never panics on remote failure;
    /// the returned result carries the failure instead.
    pub async fn migrate(&self, request: &MigrationRequest) -> EntityResult {
        let mut result = EntityResult::start(request);
        info!(
            entity = %request.entity_id,
            project = %request.target_project,
            "Starting migration"
        );

        self.enter(&mut result, Stage::Preparing);
        let prepared = match self.prepare(request).await {
            Ok(prepared) => prepared,
            Err(e) => return self.fail(result, e),
        };
        result
            .warnings
            .extend(prepared.report.warnings.iter().cloned());

        let _project_guard = self
            .project_locks
            .acquire(&request.target_project.to_lowercase())
            .await;

        self.enter(&mut result, Stage::Reconciling);
        let (project, repository) = match self.reconcile_containers(request, &mut result).await {
            Ok(pair) => pair,
            Err(e) => return self.fail(result, e),
        };

        self.enter(&mut result, Stage::Transferring);
        if let Err(e) = self
            .transfer(request, &prepared, &project, &repository, &mut result)
            .await
        {
            self.record_transfer_failure(&request.entity_id);
            return self.fail(result, e);
        }

        self.enter(&mut result, Stage::ConfiguringDependents);
        let complete = self
            .configure_dependents(request, &prepared, &project, &repository, &mut result)
            .await;

        self.enter(&mut result, Stage::Recorded);
        let status = if complete {
            EntityStatus::Success
        } else {
            EntityStatus::Partial
        };
        let attempt = status.attempt_status().unwrap_or(AttemptStatus::Partial);
        let kind = self.store.next_attempt_kind(&request.entity_id);
        match self.store.record_attempt(&request.entity_id, attempt, kind) {
            Ok(record) => result.history_length = record.history.len(),
            Err(e) => return self.fail(result, e),
        }

        result.status = status;
        result.complete();
        info!(
            entity = %request.entity_id,
            status = %status,
            kind = %kind,
            history = result.history_length,
            "Migration recorded"
        );
        self.report_finished(&result);
        result
    }

    async fn reconcile_containers(
        &self,
        request: &MigrationRequest,
        result: &mut EntityResult,
    ) -> Result<(TargetProject, TargetRepository)> {
        let options = &request.options;

        let desired_project = DesiredProject {
            name: request.target_project.clone(),
            description: request.project_description.clone(),
            visibility: request.project_visibility.clone(),
        };
        let (ensured, record) = self
            .projects
            .ensure_recorded(&desired_project, options.ensure_options(EntityKind::Project))
            .await?;
        result.reconciled.push(record);
        let project = ensured.into_state(
            Side::Target,
            &format!("project:{}", request.target_project),
        )?;

        // Existence only; the default branch is aligned after the push.
        let desired_repository = DesiredRepository {
            project: project.name.clone(),
            project_id: project.id.clone(),
            name: request.repository_name().to_string(),
            default_branch: None,
        };
        let (ensured, record) = self
            .repositories
            .ensure_recorded(
                &desired_repository,
                options.ensure_options(EntityKind::Repository),
            )
            .await?;
        result.reconciled.push(record);
        let repository = ensured.into_state(
            Side::Target,
            &format!("repository:{}/{}", project.name, desired_repository.name),
        )?;

        Ok((project, repository))
    }

    async fn transfer(
        &self,
        request: &MigrationRequest,
        prepared: &Prepared,
        project: &TargetProject,
        repository: &TargetRepository,
        result: &mut EntityResult,
    ) -> Result<()> {
        let has_commits = self.target.has_commits(&project.name, &repository.id).await?;
        let mode = match (has_commits, request.options.allow_sync) {
            (false, _) => TransferMode::Initial,
            (true, true) => TransferMode::Sync,
            (true, false) => {
                return Err(MigrationError::Conflict {
                    side: Side::Target,
                    entity: format!("repository:{}/{}", project.name, repository.name),
                    detail: "target repository already has commits; allow sync to force-converge it"
                        .to_string(),
                });
            }
        };
        result.transfer_mode = Some(mode);

        let push_url = self.target.authenticated_push_url(repository)?;
        self.git.push(&prepared.mirror, &push_url, mode).await
    }

    /// Align the default branch, then apply policies, wiki and group
    /// memberships. Returns `false` when any of them failed.
    async fn configure_dependents(
        &self,
        request: &MigrationRequest,
        prepared: &Prepared,
        project: &TargetProject,
        repository: &TargetRepository,
        result: &mut EntityResult,
    ) -> bool {
        let options = &request.options;
        let dependents = &request.dependents;
        let mut complete = true;

        // Pushed content makes the source default branch authoritative.
        if let Some(branch) = &prepared.project.default_branch {
            let desired = DesiredRepository {
                project: project.name.clone(),
                project_id: project.id.clone(),
                name: repository.name.clone(),
                default_branch: Some(branch.clone()),
            };
            let outcome = self
                .repositories
                .ensure_recorded(&desired, EnsureOptions::force())
                .await
                .map(|(_, record)| record);
            match outcome {
                Ok(record) if record.outcome == EnsureOutcome::Unchanged => {}
                other => complete &= self.collect(other, result),
            }
        }

        for spec in &dependents.policies {
            let branch = spec
                .branch
                .clone()
                .or_else(|| prepared.project.default_branch.clone());
            let Some(branch) = branch else {
                result.add_warning(format!(
                    "{} policy skipped: no branch to protect",
                    spec.kind
                ));
                continue;
            };
            let desired = DesiredPolicy {
                project: project.name.clone(),
                repository_id: repository.id.clone(),
                kind: spec.kind,
                branch,
                blocking: spec.blocking,
                settings: spec.settings.clone(),
            };
            let outcome = self
                .policies
                .ensure_recorded(&desired, options.ensure_options(EntityKind::BranchPolicy))
                .await;
            complete &= self.collect(outcome.map(|(_, record)| record), result);
        }

        if let Some(spec) = &dependents.wiki {
            let desired = DesiredWiki {
                project: project.name.clone(),
                project_id: project.id.clone(),
                name: spec
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("{}.wiki", repository.name)),
                repository_id: spec.code_wiki.then(|| repository.id.clone()),
                mapped_path: spec.mapped_path.clone(),
                branch: prepared.project.default_branch.clone(),
            };
            let outcome = self
                .wikis
                .ensure_recorded(&desired, options.ensure_options(EntityKind::Wiki))
                .await;
            complete &= self.collect(outcome.map(|(_, record)| record), result);
        }

        for spec in &dependents.groups {
            let desired = DesiredMembership {
                project: project.name.clone(),
                group: spec.group.clone(),
                members: spec.members.clone(),
            };
            let outcome = self
                .memberships
                .ensure_recorded(&desired, options.ensure_options(EntityKind::GroupMembership))
                .await;
            complete &= self.collect(outcome.map(|(_, record)| record), result);
        }

        complete
    }

    fn collect(
        &self,
        outcome: Result<crate::reconcile::ReconcileRecord>,
        result: &mut EntityResult,
    ) -> bool {
        match outcome {
            Ok(record) => {
                result.reconciled.push(record);
                true
            }
            Err(e) => {
                let failure = FailureInfo::from(&e);
                warn!(
                    entity = %result.entity_id,
                    remediation = %failure.remediation,
                    error = %failure.message,
                    "Dependent configuration failed"
                );
                result.add_warning(failure.to_string());
                false
            }
        }
    }

    fn record_transfer_failure(&self, entity_id: &str) {
        if !self.store.has_record(entity_id) {
            return;
        }
        let kind = self.store.next_attempt_kind(entity_id);
        if let Err(e) = self
            .store
            .record_attempt(entity_id, AttemptStatus::Failed, kind)
        {
            warn!(entity = %entity_id, error = %e, "Failed to record failed attempt");
        }
    }

    fn enter(&self, result: &mut EntityResult, stage: Stage) {
        result.stage = stage;
        debug!(entity = %result.entity_id, stage = %stage, "Entering stage");
        if let Some(progress) = &self.progress {
            progress.stage(&result.entity_id, stage);
        }
    }

    fn fail(&self, mut result: EntityResult, err: MigrationError) -> EntityResult {
        let failure = FailureInfo::from(&err);
        error!(
            entity = %result.entity_id,
            stage = %result.stage,
            side = ?failure.side,
            remediation = %failure.remediation,
            error = %failure.message,
            "Migration failed"
        );

        result.failed_stage = Some(result.stage);
        result.stage = Stage::Failed;
        result.status = EntityStatus::Failed;
        result.failure = Some(failure);
        result.history_length = self.store.migration_count(&result.entity_id);
        result.complete();
        self.report_finished(&result);
        result
    }

    fn report_finished(&self, result: &EntityResult) {
        if let Some(progress) = &self.progress {
            progress.finish_entity(&result.entity_id, result.status);
        }
    }
}
