//! Target project reconciliation.
//!
//! Several source entities usually land in one target project, so only the
//! attributes a request pins are compared.

use super::{EntityKind, Reconcilable};
use crate::error::{MigrationError, Result, Side};
use crate::target::{TargetClient, TargetProject};
use async_trait::async_trait;
use std::sync::Arc;

const DEFAULT_VISIBILITY: &str = "private";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredProject {
    pub name: String,
    /// `None` leaves the description unmanaged.
    pub description: Option<String>,
    /// `private` or `public`; `None` leaves it unmanaged.
    pub visibility: Option<String>,
}

pub struct ProjectOps {
    client: Arc<TargetClient>,
}

impl ProjectOps {
    pub fn new(client: Arc<TargetClient>) -> Self {
        Self { client }
    }
}

fn description(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("").trim()
}

#[async_trait]
impl Reconcilable for ProjectOps {
    type Desired = DesiredProject;
    type Observed = TargetProject;

    fn kind(&self) -> EntityKind {
        EntityKind::Project
    }

    fn key(&self, desired: &DesiredProject) -> String {
        desired.name.to_lowercase()
    }

    async fn get(&self, desired: &DesiredProject) -> Result<Option<TargetProject>> {
        self.client.get_project(&desired.name).await
    }

    fn diff(&self, desired: &DesiredProject, observed: &TargetProject) -> Vec<String> {
        let mut fields = Vec::new();
        if desired.description.is_some()
            && description(&desired.description) != description(&observed.description)
        {
            fields.push("description".to_string());
        }
        if let Some(visibility) = &desired.visibility {
            if !visibility.eq_ignore_ascii_case(&observed.visibility) {
                fields.push("visibility".to_string());
            }
        }
        fields
    }

    async fn create(&self, desired: &DesiredProject) -> Result<TargetProject> {
        self.client
            .create_project(
                &desired.name,
                desired.description.as_deref(),
                desired.visibility.as_deref().unwrap_or(DEFAULT_VISIBILITY),
            )
            .await
    }

    async fn update(
        &self,
        desired: &DesiredProject,
        observed: &TargetProject,
    ) -> Result<TargetProject> {
        let description = desired
            .description
            .as_deref()
            .or(observed.description.as_deref());
        let visibility = desired.visibility.as_deref().unwrap_or(&observed.visibility);
        self.client
            .update_project(&observed.id, description, visibility)
            .await?;
        self.client
            .get_project(&desired.name)
            .await?
            .ok_or_else(|| MigrationError::NotFound {
                side: Side::Target,
                entity: format!("project:{}", desired.name),
            })
    }

    async fn delete(&self, _desired: &DesiredProject, observed: &TargetProject) -> Result<()> {
        self.client.delete_project(&observed.id).await
    }
}
