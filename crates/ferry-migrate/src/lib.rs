//! # Ferry Migration Core
//!
//! Moves repositories and their dependent configuration from a GitLab-style
//! source platform to an Azure DevOps-style target platform, and stays safe to
//! re-run against a target that has already been (partly) migrated.
//!
//! ## Features
//!
//! - **Resilient transport**: bounded retries with exponential backoff,
//!   API-version negotiation, a one-shot `curl` fallback on TLS failures, and
//!   one error shape for both platforms
//! - **Idempotent reconciliation**: projects, repositories, branch policies,
//!   wikis and group memberships converge without duplicates; differences
//!   need an explicit `force` or `replace`
//! - **Migration history**: append-only per-entity records that decide between
//!   initial and sync runs
//! - **Bulk runs**: failure isolation, per-project serialization, cooperative
//!   cancellation and a run manifest
//!
//! ## Example
//!
//! ```rust,no_run
//! use ferry_migrate::{
//!     BulkRunner, EndpointConfig, GitCli, MigrationRequest, Orchestrator, RunOptions,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> ferry_migrate::Result<()> {
//! let config = Arc::new(EndpointConfig::load("ferry.yaml")?);
//! let orchestrator = Orchestrator::new(config, Arc::new(GitCli::new()))?;
//!
//! let request = MigrationRequest::new("acme/app", "Acme")
//!     .with_options(RunOptions::default().with_allow_sync(true));
//! let result = orchestrator.migrate(&request).await;
//! result.print_summary();
//!
//! let runner = BulkRunner::new(Arc::new(orchestrator));
//! let requests = runner.plan_group("acme", &request).await?;
//! runner.run(&requests).await.print_summary();
//! # Ok(())
//! # }
//! ```

pub mod bulk;
pub mod config;
pub mod error;
pub mod git;
pub mod history;
pub mod lock;
pub mod normalize;
pub mod observability;
pub mod orchestrator;
pub mod poll;
pub mod preflight;
pub mod progress;
pub mod reconcile;
pub mod redact;
pub mod source;
pub mod target;
pub mod transport;
pub mod types;

// Re-export main types
pub use bulk::{BulkRun, BulkRunner, BulkTotals};
pub use config::{EndpointConfig, SecretString, SourceEndpoint, TargetEndpoint};
pub use error::{ErrorKind, FailureInfo, MigrationError, NormalizedError, Remediation, Result, Side};
pub use git::{GitCli, GitTransfer, MirrorStats, TransferMode};
pub use history::{AttemptKind, AttemptStatus, MigrationRecord, MigrationStateStore};
pub use orchestrator::Orchestrator;
pub use progress::{ConsoleProgressReporter, MigrationProgress, ProgressCallback, ProgressUpdate};
pub use reconcile::{EnsureOptions, EnsureOutcome, EntityKind, Reconcilable, Reconciler};
pub use redact::redact;
pub use transport::{Operation, Response, RetryPolicy, Transport};
pub use types::*;

/// Version of the migration tools.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = MigrationRequest::new("acme/app", "Acme")
            .with_repository_name("app")
            .with_options(
                RunOptions::default()
                    .with_force(true)
                    .with_replace(EntityKind::BranchPolicy),
            );

        assert!(request.options.force);
        assert!(!request.options.allow_sync);
        assert!(request.options.ensure_options(EntityKind::BranchPolicy).replace);
        assert!(request.dependents.is_empty());
    }

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
