//! Branch policy reconciliation, one policy type per branch at a time.
//!
//! Comparison looks at `isEnabled`, `isBlocking` and the keys present in the
//! desired settings only. Keys the server adds (`scope`, defaults for
//! optional settings) never count as drift.

use super::{EntityKind, Reconcilable};
use crate::error::Result;
use crate::target::{full_ref, PolicyConfiguration, PolicyType, TargetClient};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;

/// Supported branch policy types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    MinimumReviewers,
    CommentResolution,
    WorkItemLinking,
    Build,
}

impl PolicyKind {
    /// Well-known policy type id on the target platform.
    pub fn type_id(&self) -> &'static str {
        match self {
            Self::MinimumReviewers => "fa4e907d-c16b-4a4c-9dfa-4906e5d171dd",
            Self::CommentResolution => "c6a1889d-b943-4856-b76f-9e46bb6b0df2",
            Self::WorkItemLinking => "40e92b44-2fe1-4dd6-b3d8-74a9c21d0c6e",
            Self::Build => "0609b952-1397-4640-95ec-e00a01b2c241",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MinimumReviewers => write!(f, "minimum-reviewers"),
            Self::CommentResolution => write!(f, "comment-resolution"),
            Self::WorkItemLinking => write!(f, "work-item-linking"),
            Self::Build => write!(f, "build"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DesiredPolicy {
    pub project: String,
    pub repository_id: String,
    pub kind: PolicyKind,
    /// Short or full branch name.
    pub branch: String,
    pub blocking: bool,
    pub settings: Map<String, Value>,
}

impl DesiredPolicy {
    fn configuration(&self, id: Option<u64>) -> PolicyConfiguration {
        let mut settings = self.settings.clone();
        settings.insert(
            "scope".to_string(),
            json!([{
                "repositoryId": self.repository_id,
                "refName": full_ref(&self.branch),
                "matchKind": "exact",
            }]),
        );
        PolicyConfiguration {
            id,
            is_enabled: true,
            is_blocking: self.blocking,
            policy_type: PolicyType {
                id: self.kind.type_id().to_string(),
            },
            settings: Value::Object(settings),
        }
    }

    /// Whether an existing configuration is this policy's slot.
    fn matches(&self, config: &PolicyConfiguration) -> bool {
        if config.policy_type.id != self.kind.type_id() {
            return false;
        }
        let wanted_ref = full_ref(&self.branch);
        config
            .settings
            .get("scope")
            .and_then(Value::as_array)
            .map(|scopes| {
                scopes.iter().any(|scope| {
                    scope.get("refName").and_then(Value::as_str) == Some(wanted_ref.as_str())
                        && scope
                            .get("repositoryId")
                            .and_then(Value::as_str)
                            .map_or(true, |id| id.eq_ignore_ascii_case(&self.repository_id))
                })
            })
            .unwrap_or(false)
    }
}

pub struct PolicyOps {
    client: Arc<TargetClient>,
}

impl PolicyOps {
    pub fn new(client: Arc<TargetClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Reconcilable for PolicyOps {
    type Desired = DesiredPolicy;
    type Observed = PolicyConfiguration;

    fn kind(&self) -> EntityKind {
        EntityKind::BranchPolicy
    }

    fn key(&self, desired: &DesiredPolicy) -> String {
        format!(
            "{}/{}@{}",
            desired.repository_id,
            desired.kind,
            full_ref(&desired.branch)
        )
    }

    async fn precondition(&self, desired: &DesiredPolicy) -> Result<Option<String>> {
        let exists = self
            .client
            .branch_exists(&desired.project, &desired.repository_id, &desired.branch)
            .await?;
        Ok((!exists).then(|| format!("branch {} does not exist on the target yet", desired.branch)))
    }

    async fn get(&self, desired: &DesiredPolicy) -> Result<Option<PolicyConfiguration>> {
        Ok(self
            .client
            .list_policies(&desired.project, &desired.repository_id)
            .await?
            .into_iter()
            .find(|config| desired.matches(config)))
    }

    fn diff(&self, desired: &DesiredPolicy, observed: &PolicyConfiguration) -> Vec<String> {
        let mut fields = Vec::new();
        if !observed.is_enabled {
            fields.push("isEnabled".to_string());
        }
        if observed.is_blocking != desired.blocking {
            fields.push("isBlocking".to_string());
        }
        for (key, want) in &desired.settings {
            if observed.settings.get(key) != Some(want) {
                fields.push(format!("settings.{key}"));
            }
        }
        fields
    }

    async fn create(&self, desired: &DesiredPolicy) -> Result<PolicyConfiguration> {
        self.client
            .create_policy(&desired.project, &desired.configuration(None))
            .await
    }

    async fn update(
        &self,
        desired: &DesiredPolicy,
        observed: &PolicyConfiguration,
    ) -> Result<PolicyConfiguration> {
        let id = observed.id.unwrap_or_default();
        self.client
            .update_policy(&desired.project, id, &desired.configuration(Some(id)))
            .await
    }

    async fn delete(&self, desired: &DesiredPolicy, observed: &PolicyConfiguration) -> Result<()> {
        self.client
            .delete_policy(&desired.project, observed.id.unwrap_or_default())
            .await
    }
}
