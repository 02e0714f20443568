//! Wiki reconciliation. Wikis can be created and deleted, never updated.

use super::{EntityKind, Reconcilable};
use crate::error::Result;
use crate::target::{TargetClient, Wiki};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredWiki {
    pub project: String,
    pub project_id: String,
    pub name: String,
    /// Backing repository for a code wiki; `None` for a project wiki.
    pub repository_id: Option<String>,
    pub mapped_path: Option<String>,
    pub branch: Option<String>,
}

impl DesiredWiki {
    fn wiki_type(&self) -> &'static str {
        if self.repository_id.is_some() {
            "codeWiki"
        } else {
            "projectWiki"
        }
    }
}

pub struct WikiOps {
    client: Arc<TargetClient>,
}

impl WikiOps {
    pub fn new(client: Arc<TargetClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Reconcilable for WikiOps {
    type Desired = DesiredWiki;
    type Observed = Wiki;

    fn kind(&self) -> EntityKind {
        EntityKind::Wiki
    }

    fn key(&self, desired: &DesiredWiki) -> String {
        format!("{}/{}", desired.project, desired.name).to_lowercase()
    }

    async fn get(&self, desired: &DesiredWiki) -> Result<Option<Wiki>> {
        self.client.get_wiki(&desired.project, &desired.name).await
    }

    fn diff(&self, desired: &DesiredWiki, observed: &Wiki) -> Vec<String> {
        let mut fields = Vec::new();
        if !observed.wiki_type.eq_ignore_ascii_case(desired.wiki_type()) {
            fields.push("type".to_string());
        }
        if let Some(repository_id) = &desired.repository_id {
            let same = observed
                .repository_id
                .as_deref()
                .is_some_and(|id| id.eq_ignore_ascii_case(repository_id));
            if !same {
                fields.push("repositoryId".to_string());
            }
            let want_path = desired.mapped_path.as_deref().unwrap_or("/");
            if observed.mapped_path.as_deref().unwrap_or("/") != want_path {
                fields.push("mappedPath".to_string());
            }
        }
        fields
    }

    async fn create(&self, desired: &DesiredWiki) -> Result<Wiki> {
        let mut body = json!({
            "name": desired.name,
            "type": desired.wiki_type(),
            "projectId": desired.project_id,
        });
        if let Some(repository_id) = &desired.repository_id {
            body["repositoryId"] = json!(repository_id);
            body["mappedPath"] = json!(desired.mapped_path.as_deref().unwrap_or("/"));
            if let Some(branch) = &desired.branch {
                body["version"] = json!({ "version": branch });
            }
        }
        self.client.create_wiki(&desired.project, body).await
    }

    async fn delete(&self, desired: &DesiredWiki, observed: &Wiki) -> Result<()> {
        self.client.delete_wiki(&desired.project, &observed.id).await
    }

    fn supports_update(&self) -> bool {
        false
    }
}
