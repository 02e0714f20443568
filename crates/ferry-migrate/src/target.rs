//! Target platform client (Azure-DevOps-shaped REST).
//!
//! Every path is relative to the organization URL. Project-scoped resources
//! are addressed by project name; long-running project mutations return an
//! operation reference that is awaited through [`poll_until`].

use crate::error::{MigrationError, NormalizedError, Result, Side};
use crate::poll::{poll_until, PollOutcome};
use crate::transport::{encode_segment, Operation, Transport};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Process template used for new projects (Agile).
const DEFAULT_PROCESS_TEMPLATE: &str = "adcc42ab-9882-485e-a3ed-7678f01f66bc";

/// `{count, value}` envelope wrapping every list response.
#[derive(Debug, Clone, Deserialize)]
pub struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    pub value: Vec<T>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetProject {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_visibility")]
    pub visibility: String,
    #[serde(default)]
    pub state: Option<String>,
}

fn default_visibility() -> String {
    "private".to_string()
}

/// Reference to a long-running remote operation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OperationReference {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Terminal state of an awaited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Succeeded,
    /// The operation id vanished while polling. Treated as success.
    AssumedSucceeded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRepository {
    pub id: String,
    pub name: String,
    /// Full ref name (`refs/heads/main`); absent before the first push.
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitRef {
    pub name: String,
    #[serde(default)]
    pub object_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyType {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyConfiguration {
    /// Server-generated; omitted on create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub is_enabled: bool,
    pub is_blocking: bool,
    #[serde(rename = "type")]
    pub policy_type: PolicyType,
    #[serde(default)]
    pub settings: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wiki {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub wiki_type: String,
    #[serde(default)]
    pub repository_id: Option<String>,
    #[serde(default)]
    pub mapped_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMember {
    pub principal_name: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Typed wrapper over the target REST resources.
pub struct TargetClient {
    transport: Arc<Transport>,
}

impl TargetClient {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    async fn get_optional<T: DeserializeOwned>(&self, op: Operation) -> Result<Option<T>> {
        match self.transport.issue(&op).await {
            Ok(response) => Ok(Some(response.json()?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn send<T: DeserializeOwned>(&self, op: Operation) -> Result<T> {
        self.transport.issue(&op).await?.json()
    }

    async fn send_empty(&self, op: Operation) -> std::result::Result<(), NormalizedError> {
        self.transport.issue(&op).await.map(|_| ())
    }

    // ---- projects ----

    pub async fn get_project(&self, name: &str) -> Result<Option<TargetProject>> {
        self.get_optional(Operation::get(
            Side::Target,
            format!("/_apis/projects/{}", encode_segment(name)),
        ))
        .await
    }

    /// Create a project and wait for the creation to finish.
    pub async fn create_project(
        &self,
        name: &str,
        description: Option<&str>,
        visibility: &str,
    ) -> Result<TargetProject> {
        let body = json!({
            "name": name,
            "description": description,
            "visibility": visibility,
            "capabilities": {
                "versioncontrol": { "sourceControlType": "Git" },
                "processTemplate": { "templateTypeId": DEFAULT_PROCESS_TEMPLATE },
            },
        });
        let reference: OperationReference = self
            .send(Operation::post(Side::Target, "/_apis/projects", body))
            .await?;
        self.await_operation(&reference.id, &format!("create project {name}"))
            .await?;

        self.get_project(name).await?.ok_or_else(|| MigrationError::NotFound {
            side: Side::Target,
            entity: format!("project:{name}"),
        })
    }

    pub async fn update_project(
        &self,
        project_id: &str,
        description: Option<&str>,
        visibility: &str,
    ) -> Result<()> {
        let body = json!({ "description": description, "visibility": visibility });
        let reference: OperationReference = self
            .send(Operation::patch(
                Side::Target,
                format!("/_apis/projects/{project_id}"),
                body,
            ))
            .await?;
        self.await_operation(&reference.id, &format!("update project {project_id}"))
            .await
            .map(|_| ())
    }

    pub async fn delete_project(&self, project_id: &str) -> Result<()> {
        let reference: OperationReference = self
            .send(Operation::delete(
                Side::Target,
                format!("/_apis/projects/{project_id}"),
            ))
            .await?;
        self.await_operation(&reference.id, &format!("delete project {project_id}"))
            .await
            .map(|_| ())
    }

    /// Poll an operation until it reaches a terminal state.
    pub async fn await_operation(&self, id: &str, description: &str) -> Result<OperationStatus> {
        let settings = self.transport.config().poll.clone();
        let path = format!("/_apis/operations/{id}");

        let outcome = poll_until(&settings, |attempt| {
            let op = Operation::get(Side::Target, path.clone());
            async move {
                let response = match self.transport.issue(&op).await {
                    Ok(response) => response,
                    Err(e) if e.is_not_found() => {
                        warn!(
                            operation = %description,
                            operation_id = %id,
                            "Operation status not found, assuming success"
                        );
                        return Ok(Some(OperationStatus::AssumedSucceeded));
                    }
                    Err(e) => return Err(MigrationError::from(e)),
                };

                let reference: OperationReference = response.json()?;
                let status = reference.status.unwrap_or_default();
                debug!(operation_id = %id, attempt, status = %status, "Polled operation");
                match status.as_str() {
                    "succeeded" => Ok(Some(OperationStatus::Succeeded)),
                    "failed" | "cancelled" => Err(MigrationError::OperationFailed {
                        operation: description.to_string(),
                        status: status.clone(),
                    }),
                    _ => Ok(None),
                }
            }
        })
        .await?;

        match outcome {
            PollOutcome::Ready(status) => Ok(status),
            PollOutcome::TimedOut { attempts, .. } => Err(MigrationError::Timeout {
                operation: description.to_string(),
                attempts,
            }),
        }
    }

    // ---- repositories ----

    pub async fn get_repository(
        &self,
        project: &str,
        name: &str,
    ) -> Result<Option<TargetRepository>> {
        self.get_optional(Operation::get(
            Side::Target,
            format!(
                "/{}/_apis/git/repositories/{}",
                encode_segment(project),
                encode_segment(name)
            ),
        ))
        .await
    }

    pub async fn create_repository(
        &self,
        project: &str,
        project_id: &str,
        name: &str,
    ) -> Result<TargetRepository> {
        let body = json!({ "name": name, "project": { "id": project_id } });
        self.send(Operation::post(
            Side::Target,
            format!("/{}/_apis/git/repositories", encode_segment(project)),
            body,
        ))
        .await
    }

    pub async fn update_default_branch(
        &self,
        project: &str,
        repository_id: &str,
        default_branch: &str,
    ) -> Result<TargetRepository> {
        let body = json!({ "defaultBranch": default_branch });
        self.send(Operation::patch(
            Side::Target,
            format!(
                "/{}/_apis/git/repositories/{repository_id}",
                encode_segment(project)
            ),
            body,
        ))
        .await
    }

    pub async fn delete_repository(&self, project: &str, repository_id: &str) -> Result<()> {
        self.send_empty(Operation::delete(
            Side::Target,
            format!(
                "/{}/_apis/git/repositories/{repository_id}",
                encode_segment(project)
            ),
        ))
        .await
        .map_err(Into::into)
    }

    /// Branch refs of a repository.
    pub async fn list_branches(&self, project: &str, repository_id: &str) -> Result<Vec<GitRef>> {
        let list: ListResponse<GitRef> = self
            .send(
                Operation::get(
                    Side::Target,
                    format!(
                        "/{}/_apis/git/repositories/{repository_id}/refs",
                        encode_segment(project)
                    ),
                )
                .with_query("filter", "heads/"),
            )
            .await?;
        Ok(list.value)
    }

    /// Whether the repository holds any commits.
    pub async fn has_commits(&self, project: &str, repository_id: &str) -> Result<bool> {
        Ok(!self.list_branches(project, repository_id).await?.is_empty())
    }

    pub async fn branch_exists(
        &self,
        project: &str,
        repository_id: &str,
        branch: &str,
    ) -> Result<bool> {
        let wanted = full_ref(branch);
        Ok(self
            .list_branches(project, repository_id)
            .await?
            .iter()
            .any(|r| r.name == wanted))
    }

    // ---- branch policies ----

    pub async fn list_policies(
        &self,
        project: &str,
        repository_id: &str,
    ) -> Result<Vec<PolicyConfiguration>> {
        let list: ListResponse<PolicyConfiguration> = self
            .send(
                Operation::get(
                    Side::Target,
                    format!("/{}/_apis/policy/configurations", encode_segment(project)),
                )
                .with_query("repositoryId", repository_id),
            )
            .await?;
        Ok(list.value)
    }

    pub async fn create_policy(
        &self,
        project: &str,
        policy: &PolicyConfiguration,
    ) -> Result<PolicyConfiguration> {
        self.send(Operation::post(
            Side::Target,
            format!("/{}/_apis/policy/configurations", encode_segment(project)),
            serde_json::to_value(policy)?,
        ))
        .await
    }

    pub async fn update_policy(
        &self,
        project: &str,
        id: u64,
        policy: &PolicyConfiguration,
    ) -> Result<PolicyConfiguration> {
        self.send(Operation::put(
            Side::Target,
            format!("/{}/_apis/policy/configurations/{id}", encode_segment(project)),
            serde_json::to_value(policy)?,
        ))
        .await
    }

    pub async fn delete_policy(&self, project: &str, id: u64) -> Result<()> {
        self.send_empty(Operation::delete(
            Side::Target,
            format!("/{}/_apis/policy/configurations/{id}", encode_segment(project)),
        ))
        .await
        .map_err(Into::into)
    }

    // ---- wikis ----

    pub async fn get_wiki(&self, project: &str, name: &str) -> Result<Option<Wiki>> {
        self.get_optional(Operation::get(
            Side::Target,
            format!(
                "/{}/_apis/wiki/wikis/{}",
                encode_segment(project),
                encode_segment(name)
            ),
        ))
        .await
    }

    pub async fn create_wiki(&self, project: &str, body: Value) -> Result<Wiki> {
        self.send(Operation::post(
            Side::Target,
            format!("/{}/_apis/wiki/wikis", encode_segment(project)),
            body,
        ))
        .await
    }

    pub async fn delete_wiki(&self, project: &str, id: &str) -> Result<()> {
        self.send_empty(Operation::delete(
            Side::Target,
            format!("/{}/_apis/wiki/wikis/{id}", encode_segment(project)),
        ))
        .await
        .map_err(Into::into)
    }

    // ---- group membership ----

    /// Members of a project-scoped group, `None` if the group does not exist.
    pub async fn list_group_members(
        &self,
        project: &str,
        group: &str,
    ) -> Result<Option<Vec<GroupMember>>> {
        let list: Option<ListResponse<GroupMember>> = self
            .get_optional(Operation::get(
                Side::Target,
                self.members_path(project, group),
            ))
            .await?;
        Ok(list.map(|l| l.value))
    }

    pub async fn add_group_member(&self, project: &str, group: &str, principal: &str) -> Result<()> {
        self.send_empty(Operation::put(
            Side::Target,
            format!(
                "{}/{}",
                self.members_path(project, group),
                encode_segment(principal)
            ),
            json!({}),
        ))
        .await
        .map_err(Into::into)
    }

    pub async fn remove_group_member(
        &self,
        project: &str,
        group: &str,
        principal: &str,
    ) -> Result<()> {
        self.send_empty(Operation::delete(
            Side::Target,
            format!(
                "{}/{}",
                self.members_path(project, group),
                encode_segment(principal)
            ),
        ))
        .await
        .map_err(Into::into)
    }

    fn members_path(&self, project: &str, group: &str) -> String {
        format!(
            "/{}/_apis/groups/{}/members",
            encode_segment(project),
            encode_segment(group)
        )
    }

    /// Push URL with the PAT embedded as userinfo.
    pub fn authenticated_push_url(&self, repository: &TargetRepository) -> Result<String> {
        let remote = repository.remote_url.as_deref().ok_or_else(|| {
            MigrationError::InvalidConfig(format!(
                "repository {} has no remote URL",
                repository.name
            ))
        })?;
        let mut url = url::Url::parse(remote).map_err(|e| {
            MigrationError::InvalidConfig(format!("invalid remote URL for {}: {e}", repository.name))
        })?;
        let pat = self.transport.config().target.pat.expose();
        url.set_username("pat")
            .and_then(|_| url.set_password(Some(pat)))
            .map_err(|_| {
                MigrationError::InvalidConfig(format!(
                    "remote URL for {} cannot carry credentials",
                    repository.name
                ))
            })?;
        Ok(url.to_string())
    }
}

/// Normalize a branch name to a full ref (`main` -> `refs/heads/main`).
pub fn full_ref(branch: &str) -> String {
    if branch.starts_with("refs/") {
        branch.to_string()
    } else {
        format!("refs/heads/{branch}")
    }
}
