//! Source platform client (GitLab-shaped REST v4).

use crate::error::{MigrationError, Result, Side};
use crate::transport::{encode_segment, Operation, Transport};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const PAGE_SIZE: usize = 100;

/// Project metadata as returned by the source platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceProject {
    pub id: u64,
    pub name: String,
    pub path_with_namespace: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Absent for empty repositories.
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default = "default_visibility")]
    pub visibility: String,
    pub http_url_to_repo: String,
    #[serde(default)]
    pub lfs_enabled: bool,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub statistics: Option<ProjectStatistics>,
}

fn default_visibility() -> String {
    "private".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectStatistics {
    #[serde(default)]
    pub repository_size: u64,
}

impl SourceProject {
    /// Repository size in bytes, 0 when statistics are unavailable.
    pub fn repository_size(&self) -> u64 {
        self.statistics
            .as_ref()
            .map(|s| s.repository_size)
            .unwrap_or(0)
    }
}

/// Typed wrapper over the source REST resources.
pub struct SourceClient {
    transport: Arc<Transport>,
    /// Group path -> project listing. Invalidated manually only.
    project_cache: RwLock<HashMap<String, Vec<SourceProject>>>,
}

impl SourceClient {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self {
            transport,
            project_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch a single project by its full path (`group/sub/project`).
    pub async fn get_project(&self, path: &str) -> Result<SourceProject> {
        let op = Operation::get(
            Side::Source,
            format!("/api/v4/projects/{}", encode_segment(path)),
        )
        .with_query("statistics", "true");

        match self.transport.issue(&op).await {
            Ok(response) => response.json(),
            Err(e) if e.is_not_found() => Err(MigrationError::NotFound {
                side: Side::Source,
                entity: format!("project:{path}"),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// List every project of a group, subgroups included. Cached per group.
    pub async fn list_group_projects(&self, group: &str) -> Result<Vec<SourceProject>> {
        if let Some(cached) = self.project_cache.read().get(group) {
            debug!(group = %group, count = cached.len(), "Using cached project listing");
            return Ok(cached.clone());
        }

        let path = format!("/api/v4/groups/{}/projects", encode_segment(group));
        let projects: Vec<SourceProject> = self
            .get_paginated(&path, &[("include_subgroups", "true"), ("archived", "false")])
            .await?;

        debug!(group = %group, count = projects.len(), "Listed group projects");
        self.project_cache
            .write()
            .insert(group.to_string(), projects.clone());
        Ok(projects)
    }

    /// Drop cached listings so the next call hits the platform.
    pub fn invalidate_project_cache(&self) {
        self.project_cache.write().clear();
    }

    async fn get_paginated<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>> {
        let mut all_items = Vec::new();
        let mut page = 1u32;

        loop {
            let mut op = Operation::get(Side::Source, path)
                .with_query("page", page.to_string())
                .with_query("per_page", PAGE_SIZE.to_string());
            for (key, value) in query {
                op = op.with_query(*key, *value);
            }

            let items: Vec<T> = self.transport.issue(&op).await?.json()?;
            if items.is_empty() {
                break;
            }

            let count = items.len();
            all_items.extend(items);

            if count < PAGE_SIZE {
                break;
            }
            page += 1;
        }

        Ok(all_items)
    }

    /// Clone URL with the source token embedded as `oauth2` userinfo.
    pub fn authenticated_clone_url(&self, project: &SourceProject) -> Result<String> {
        let mut url = url::Url::parse(&project.http_url_to_repo).map_err(|e| {
            MigrationError::InvalidConfig(format!("invalid clone URL for {}: {e}", project.path_with_namespace))
        })?;
        let token = self.transport.config().source.token.expose();
        url.set_username("oauth2")
            .and_then(|_| url.set_password(Some(token)))
            .map_err(|_| {
                MigrationError::InvalidConfig(format!(
                    "clone URL for {} cannot carry credentials",
                    project.path_with_namespace
                ))
            })?;
        Ok(url.to_string())
    }
}
