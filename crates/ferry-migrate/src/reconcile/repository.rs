//! Target repository reconciliation.

use super::{EntityKind, Reconcilable};
use crate::error::Result;
use crate::target::{full_ref, TargetClient, TargetRepository};
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredRepository {
    /// Target project name.
    pub project: String,
    pub project_id: String,
    pub name: String,
    /// Short or full branch name; `None` leaves the default branch alone.
    pub default_branch: Option<String>,
}

pub struct RepositoryOps {
    client: Arc<TargetClient>,
}

impl RepositoryOps {
    pub fn new(client: Arc<TargetClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Reconcilable for RepositoryOps {
    type Desired = DesiredRepository;
    type Observed = TargetRepository;

    fn kind(&self) -> EntityKind {
        EntityKind::Repository
    }

    fn key(&self, desired: &DesiredRepository) -> String {
        format!("{}/{}", desired.project, desired.name).to_lowercase()
    }

    async fn get(&self, desired: &DesiredRepository) -> Result<Option<TargetRepository>> {
        self.client
            .get_repository(&desired.project, &desired.name)
            .await
    }

    fn diff(&self, desired: &DesiredRepository, observed: &TargetRepository) -> Vec<String> {
        // An empty repository has no default branch yet; that is not drift.
        match (&desired.default_branch, &observed.default_branch) {
            (Some(want), Some(have)) if full_ref(want) != full_ref(have) => {
                vec!["default_branch".to_string()]
            }
            _ => Vec::new(),
        }
    }

    async fn create(&self, desired: &DesiredRepository) -> Result<TargetRepository> {
        self.client
            .create_repository(&desired.project, &desired.project_id, &desired.name)
            .await
    }

    async fn update(
        &self,
        desired: &DesiredRepository,
        observed: &TargetRepository,
    ) -> Result<TargetRepository> {
        match &desired.default_branch {
            Some(branch) => {
                self.client
                    .update_default_branch(&desired.project, &observed.id, &full_ref(branch))
                    .await
            }
            None => Ok(observed.clone()),
        }
    }

    async fn delete(&self, desired: &DesiredRepository, observed: &TargetRepository) -> Result<()> {
        self.client
            .delete_repository(&desired.project, &observed.id)
            .await
    }
}
