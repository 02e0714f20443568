//! Repository content transfer through the `git` executable.

use crate::error::{MigrationError, Result};
use crate::redact::redact;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, info};

/// How content reaches the target repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    /// Plain mirror push into an empty repository.
    Initial,
    /// Forced mirror push; the source is authoritative.
    Sync,
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::Sync => write!(f, "sync"),
        }
    }
}

/// Ref counts of a local mirror.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorStats {
    pub branches: usize,
    pub tags: usize,
}

impl MirrorStats {
    /// Count branches and tags from `for-each-ref` output.
    pub fn from_refs(listing: &str) -> Self {
        let mut stats = Self::default();
        for name in listing.lines().map(str::trim) {
            if name.starts_with("refs/heads/") {
                stats.branches += 1;
            } else if name.starts_with("refs/tags/") {
                stats.tags += 1;
            }
        }
        stats
    }
}

/// Fetches source content and pushes it to the target.
#[async_trait]
pub trait GitTransfer: Send + Sync {
    /// Create or refresh a bare mirror of `source_url` at `mirror`.
    async fn mirror_fetch(&self, source_url: &str, mirror: &Path) -> Result<MirrorStats>;

    /// Push every ref of `mirror` to `target_url`.
    async fn push(&self, mirror: &Path, target_url: &str, mode: TransferMode) -> Result<()>;
}

/// [`GitTransfer`] backed by the `git` command line.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            program: "git".to_string(),
        }
    }
}

impl GitCli {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific git binary.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    async fn run(&self, args: &[&str], git_dir: Option<&Path>) -> std::io::Result<Output> {
        let mut command = Command::new(&self.program);
        command.env("GIT_TERMINAL_PROMPT", "0");
        if let Some(dir) = git_dir {
            command.arg("--git-dir").arg(dir);
        }
        command.args(args);
        debug!(args = %redact(&args.join(" ")), "Running git");
        command.output().await
    }

    async fn count_refs(&self, mirror: &Path) -> Result<MirrorStats> {
        let output = self
            .run(&["for-each-ref", "--format=%(refname)"], Some(mirror))
            .await?;
        if !output.status.success() {
            return Err(MigrationError::GitFetchFailed(stderr(&output)));
        }
        Ok(MirrorStats::from_refs(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }
}

#[async_trait]
impl GitTransfer for GitCli {
    async fn mirror_fetch(&self, source_url: &str, mirror: &Path) -> Result<MirrorStats> {
        if mirror.join("HEAD").exists() {
            // Fetch by URL so credentials never land in the mirror's config.
            let output = self
                .run(
                    &["fetch", "--prune", "--force", source_url, "+refs/*:refs/*"],
                    Some(mirror),
                )
                .await?;
            if !output.status.success() {
                return Err(MigrationError::GitFetchFailed(stderr(&output)));
            }
        } else {
            if let Some(parent) = mirror.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mirror_arg = mirror.to_string_lossy();
            let output = self
                .run(&["clone", "--mirror", source_url, &mirror_arg], None)
                .await?;
            if !output.status.success() {
                return Err(MigrationError::GitFetchFailed(stderr(&output)));
            }
            let public_url = strip_credentials(source_url);
            let output = self
                .run(&["remote", "set-url", "origin", &public_url], Some(mirror))
                .await?;
            if !output.status.success() {
                return Err(MigrationError::GitFetchFailed(stderr(&output)));
            }
        }

        let stats = self.count_refs(mirror).await?;
        info!(
            branches = stats.branches,
            tags = stats.tags,
            "Source mirror up to date"
        );
        Ok(stats)
    }

    async fn push(&self, mirror: &Path, target_url: &str, mode: TransferMode) -> Result<()> {
        let mut args = vec!["push", "--mirror"];
        if mode == TransferMode::Sync {
            args.push("--force");
        }
        args.push(target_url);
        let output = self.run(&args, Some(mirror)).await?;
        if !output.status.success() {
            return Err(MigrationError::GitPushFailed(stderr(&output)));
        }
        info!(mode = %mode, "Pushed mirror to target");
        Ok(())
    }
}

fn stderr(output: &Output) -> String {
    redact(String::from_utf8_lossy(&output.stderr).trim()).into_owned()
}

/// `url` without userinfo; unparsable input is returned redacted.
pub fn strip_credentials(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            let _ = parsed.set_username("");
            let _ = parsed.set_password(None);
            parsed.to_string()
        }
        Err(_) => redact(url).into_owned(),
    }
}
