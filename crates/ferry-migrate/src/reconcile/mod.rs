//! Generic observe / diff / converge engine.
//!
//! Each target entity type implements [`Reconcilable`] once; [`Reconciler`]
//! supplies the shared decision logic:
//!
//! | observed            | options     | result                         |
//! |---------------------|-------------|--------------------------------|
//! | absent              | any         | create, `Created`              |
//! | equal to desired    | any         | `Unchanged`, no mutating call  |
//! | different           | none        | `Conflict`, no mutating call   |
//! | different           | `replace`   | delete + create, `Recreated`   |
//! | different           | `force`     | in-place update, `Updated`     |
//!
//! `replace` takes precedence over `force`. A failed precondition yields
//! `Skipped` before anything is observed.

mod membership;
mod policy;
mod project;
mod repository;
mod wiki;

pub use membership::{DesiredMembership, GroupMembership, MembershipOps};
pub use policy::{DesiredPolicy, PolicyKind, PolicyOps};
pub use project::{DesiredProject, ProjectOps};
pub use repository::{DesiredRepository, RepositoryOps};
pub use wiki::{DesiredWiki, WikiOps};

use crate::error::{ErrorKind, MigrationError, Result, Side};
use crate::lock::KeyedLocks;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

/// Target entity types under reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Project,
    Repository,
    BranchPolicy,
    Wiki,
    GroupMembership,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Project => write!(f, "project"),
            Self::Repository => write!(f, "repository"),
            Self::BranchPolicy => write!(f, "branch_policy"),
            Self::Wiki => write!(f, "wiki"),
            Self::GroupMembership => write!(f, "group_membership"),
        }
    }
}

/// What `ensure` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsureOutcome {
    Created,
    Updated,
    Recreated,
    Unchanged,
    Skipped,
}

impl fmt::Display for EnsureOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Updated => write!(f, "updated"),
            Self::Recreated => write!(f, "recreated"),
            Self::Unchanged => write!(f, "unchanged"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Override flags for one `ensure` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsureOptions {
    /// Update a differing entity in place.
    pub force: bool,
    /// Delete and recreate a differing entity.
    pub replace: bool,
}

impl EnsureOptions {
    pub fn force() -> Self {
        Self {
            force: true,
            replace: false,
        }
    }

    pub fn replace() -> Self {
        Self {
            force: false,
            replace: true,
        }
    }
}

/// Result of a successful `ensure`.
#[derive(Debug, Clone)]
pub struct Ensured<O> {
    pub outcome: EnsureOutcome,
    /// Observed state after convergence; `None` when skipped.
    pub state: Option<O>,
    /// Fields that differed before convergence.
    pub differences: Vec<String>,
    /// Why the entity was skipped.
    pub skip_reason: Option<String>,
}

impl<O> Ensured<O> {
    /// The converged state, or `NotFound` when the entity was skipped.
    pub fn into_state(self, side: Side, entity: &str) -> Result<O> {
        self.state.ok_or_else(|| MigrationError::NotFound {
            side,
            entity: entity.to_string(),
        })
    }
}

/// Outcome line recorded in an entity result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileRecord {
    pub kind: EntityKind,
    pub key: String,
    pub outcome: EnsureOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Per-entity-type capabilities used by [`Reconciler`].
#[async_trait]
pub trait Reconcilable: Send + Sync {
    type Desired: Send + Sync;
    type Observed: Send + Sync;

    fn kind(&self) -> EntityKind;

    /// Stable identity of the target entity, used for locking and logs.
    fn key(&self, desired: &Self::Desired) -> String;

    /// `Some(reason)` when the entity cannot be reconciled yet.
    async fn precondition(&self, _desired: &Self::Desired) -> Result<Option<String>> {
        Ok(None)
    }

    /// Fresh observed state; `None` when absent.
    async fn get(&self, desired: &Self::Desired) -> Result<Option<Self::Observed>>;

    /// Names of differing fields, server-generated fields excluded.
    fn diff(&self, desired: &Self::Desired, observed: &Self::Observed) -> Vec<String>;

    /// Differences that justify a destructive replace. Types where "equal"
    /// is looser than "identical" report the extra state here.
    fn exact_diff(&self, desired: &Self::Desired, observed: &Self::Observed) -> Vec<String> {
        self.diff(desired, observed)
    }

    async fn create(&self, desired: &Self::Desired) -> Result<Self::Observed>;

    async fn update(
        &self,
        _desired: &Self::Desired,
        _observed: &Self::Observed,
    ) -> Result<Self::Observed> {
        Err(MigrationError::Unsupported(format!(
            "{} does not support in-place update",
            self.kind()
        )))
    }

    async fn delete(&self, _desired: &Self::Desired, _observed: &Self::Observed) -> Result<()> {
        Err(MigrationError::Unsupported(format!(
            "{} does not support delete",
            self.kind()
        )))
    }

    fn supports_update(&self) -> bool {
        true
    }

    fn supports_delete(&self) -> bool {
        true
    }
}

/// Converges one entity type, one key at a time.
pub struct Reconciler<R> {
    ops: R,
    locks: KeyedLocks,
}

impl<R: Reconcilable> Reconciler<R> {
    /// Create a reconciler. Share `locks` between reconcilers that may touch
    /// the same target entities.
    pub fn new(ops: R, locks: KeyedLocks) -> Self {
        Self { ops, locks }
    }

    pub fn ops(&self) -> &R {
        &self.ops
    }

    /// Converge the target entity towards `desired`.
    pub async fn ensure(
        &self,
        desired: &R::Desired,
        options: EnsureOptions,
    ) -> Result<Ensured<R::Observed>> {
        let kind = self.ops.kind();
        let key = self.ops.key(desired);
        let entity = format!("{kind}:{key}");
        let _guard = self.locks.acquire(&entity).await;

        if let Some(reason) = self
            .ops
            .precondition(desired)
            .await
            .map_err(|e| classify(e, &entity, false))?
        {
            info!(entity = %entity, reason = %reason, "Skipping reconciliation");
            return Ok(Ensured {
                outcome: EnsureOutcome::Skipped,
                state: None,
                differences: Vec::new(),
                skip_reason: Some(reason),
            });
        }

        let observed = self
            .ops
            .get(desired)
            .await
            .map_err(|e| classify(e, &entity, false))?;

        let Some(observed) = observed else {
            let created = self
                .ops
                .create(desired)
                .await
                .map_err(|e| classify(e, &entity, true))?;
            info!(entity = %entity, "Created");
            return Ok(Ensured {
                outcome: EnsureOutcome::Created,
                state: Some(created),
                differences: Vec::new(),
                skip_reason: None,
            });
        };

        let differences = if options.replace {
            self.ops.exact_diff(desired, &observed)
        } else {
            self.ops.diff(desired, &observed)
        };
        if differences.is_empty() {
            debug!(entity = %entity, "Unchanged");
            return Ok(Ensured {
                outcome: EnsureOutcome::Unchanged,
                state: Some(observed),
                differences,
                skip_reason: None,
            });
        }

        let fields = differences.join(", ");
        if options.replace {
            if !self.ops.supports_delete() {
                return Err(MigrationError::Conflict {
                    side: Side::Target,
                    entity,
                    detail: format!("differs in [{fields}] and {kind} cannot be deleted"),
                });
            }
            warn!(entity = %entity, fields = %fields, "Replacing differing entity");
            self.ops
                .delete(desired, &observed)
                .await
                .map_err(|e| classify(e, &entity, true))?;
            let created = self
                .ops
                .create(desired)
                .await
                .map_err(|e| classify(e, &entity, true))?;
            return Ok(Ensured {
                outcome: EnsureOutcome::Recreated,
                state: Some(created),
                differences,
                skip_reason: None,
            });
        }

        if options.force {
            if !self.ops.supports_update() {
                return Err(MigrationError::Conflict {
                    side: Side::Target,
                    entity,
                    detail: format!(
                        "differs in [{fields}]; {kind} cannot be updated in place, request replace instead"
                    ),
                });
            }
            info!(entity = %entity, fields = %fields, "Updating differing entity");
            let updated = self
                .ops
                .update(desired, &observed)
                .await
                .map_err(|e| classify(e, &entity, true))?;
            return Ok(Ensured {
                outcome: EnsureOutcome::Updated,
                state: Some(updated),
                differences,
                skip_reason: None,
            });
        }

        Err(MigrationError::Conflict {
            side: Side::Target,
            entity,
            detail: format!("existing state differs in [{fields}]; no override requested"),
        })
    }

    /// `ensure` plus a loggable record of what happened.
    pub async fn ensure_recorded(
        &self,
        desired: &R::Desired,
        options: EnsureOptions,
    ) -> Result<(Ensured<R::Observed>, ReconcileRecord)> {
        let ensured = self.ensure(desired, options).await?;
        let detail = match ensured.outcome {
            EnsureOutcome::Skipped => ensured.skip_reason.clone(),
            EnsureOutcome::Updated | EnsureOutcome::Recreated => {
                Some(ensured.differences.join(", "))
            }
            _ => None,
        };
        let record = ReconcileRecord {
            kind: self.ops.kind(),
            key: self.ops.key(desired),
            outcome: ensured.outcome,
            detail,
        };
        Ok((ensured, record))
    }
}

/// Map remote failures onto the reconciliation taxonomy.
fn classify(err: MigrationError, entity: &str, mutating: bool) -> MigrationError {
    let MigrationError::Remote(remote) = err else {
        return err;
    };
    match remote.kind {
        ErrorKind::Auth => MigrationError::PermissionDenied {
            side: remote.side,
            entity: entity.to_string(),
            message: remote.message,
        },
        ErrorKind::Conflict => MigrationError::Conflict {
            side: remote.side,
            entity: entity.to_string(),
            detail: remote.message,
        },
        ErrorKind::NotFound if mutating => MigrationError::NotFound {
            side: remote.side,
            entity: entity.to_string(),
        },
        _ => MigrationError::Remote(remote),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NormalizedError;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// In-memory entity store: key -> value.
    #[derive(Default)]
    struct MemoryOps {
        store: Mutex<HashMap<String, String>>,
        mutations: AtomicU32,
        updatable: bool,
        fail_with: Option<u16>,
    }

    #[derive(Clone)]
    struct Item {
        key: String,
        value: String,
    }

    fn remote(status: u16) -> MigrationError {
        MigrationError::Remote(NormalizedError {
            side: Side::Target,
            endpoint: "https://dev.example.com/org/_apis/things".into(),
            status,
            kind: ErrorKind::from_status(status),
            message: format!("status {status}"),
            raw_body: None,
        })
    }

    #[async_trait]
    impl Reconcilable for MemoryOps {
        type Desired = Item;
        type Observed = String;

        fn kind(&self) -> EntityKind {
            EntityKind::Wiki
        }

        fn key(&self, desired: &Item) -> String {
            desired.key.clone()
        }

        async fn precondition(&self, desired: &Item) -> Result<Option<String>> {
            Ok((desired.key == "blocked").then(|| "not ready".to_string()))
        }

        async fn get(&self, desired: &Item) -> Result<Option<String>> {
            Ok(self.store.lock().get(&desired.key).cloned())
        }

        fn diff(&self, desired: &Item, observed: &String) -> Vec<String> {
            if &desired.value == observed {
                Vec::new()
            } else {
                vec!["value".to_string()]
            }
        }

        async fn create(&self, desired: &Item) -> Result<String> {
            if let Some(status) = self.fail_with {
                return Err(remote(status));
            }
            self.mutations.fetch_add(1, Ordering::SeqCst);
            self.store
                .lock()
                .insert(desired.key.clone(), desired.value.clone());
            Ok(desired.value.clone())
        }

        async fn update(&self, desired: &Item, _observed: &String) -> Result<String> {
            self.create(desired).await
        }

        async fn delete(&self, desired: &Item, _observed: &String) -> Result<()> {
            self.mutations.fetch_add(1, Ordering::SeqCst);
            self.store.lock().remove(&desired.key);
            Ok(())
        }

        fn supports_update(&self) -> bool {
            self.updatable
        }
    }

    fn item(key: &str, value: &str) -> Item {
        Item {
            key: key.into(),
            value: value.into(),
        }
    }

    fn reconciler(ops: MemoryOps) -> Reconciler<MemoryOps> {
        Reconciler::new(ops, KeyedLocks::new())
    }

    #[tokio::test]
    async fn test_ensure_twice_creates_then_unchanged() {
        let r = reconciler(MemoryOps::default());
        let desired = item("home", "v1");

        let first = r.ensure(&desired, EnsureOptions::default()).await.unwrap();
        let second = r.ensure(&desired, EnsureOptions::default()).await.unwrap();

        assert_eq!(first.outcome, EnsureOutcome::Created);
        assert_eq!(second.outcome, EnsureOutcome::Unchanged);
        assert_eq!(r.ops().mutations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_difference_without_override_is_conflict() {
        let r = reconciler(MemoryOps::default());
        r.ops().store.lock().insert("home".into(), "old".into());

        let err = r
            .ensure(&item("home", "new"), EnsureOptions::default())
            .await
            .unwrap_err();

        match err {
            MigrationError::Conflict { side, entity, detail } => {
                assert_eq!(side, Side::Target);
                assert_eq!(entity, "wiki:home");
                assert!(detail.contains("value"));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(r.ops().mutations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_force_updates_when_supported() {
        let r = reconciler(MemoryOps {
            updatable: true,
            ..Default::default()
        });
        r.ops().store.lock().insert("home".into(), "old".into());

        let ensured = r.ensure(&item("home", "new"), EnsureOptions::force()).await.unwrap();
        assert_eq!(ensured.outcome, EnsureOutcome::Updated);
        assert_eq!(ensured.differences, vec!["value"]);
        assert_eq!(ensured.state.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_force_without_update_support_asks_for_replace() {
        let r = reconciler(MemoryOps::default());
        r.ops().store.lock().insert("home".into(), "old".into());

        let err = r
            .ensure(&item("home", "new"), EnsureOptions::force())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(err.to_string().contains("replace"));
        assert_eq!(r.ops().mutations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_replace_wins_over_force() {
        let r = reconciler(MemoryOps {
            updatable: true,
            ..Default::default()
        });
        r.ops().store.lock().insert("home".into(), "old".into());

        let options = EnsureOptions {
            force: true,
            replace: true,
        };
        let ensured = r.ensure(&item("home", "new"), options).await.unwrap();
        assert_eq!(ensured.outcome, EnsureOutcome::Recreated);
        // delete + create
        assert_eq!(r.ops().mutations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_precondition_skips() {
        let r = reconciler(MemoryOps::default());
        let (ensured, record) = r
            .ensure_recorded(&item("blocked", "v"), EnsureOptions::default())
            .await
            .unwrap();
        assert_eq!(ensured.outcome, EnsureOutcome::Skipped);
        assert!(ensured.state.is_none());
        assert_eq!(record.detail.as_deref(), Some("not ready"));
    }

    async fn failure_for(status: u16) -> MigrationError {
        let r = reconciler(MemoryOps {
            fail_with: Some(status),
            ..Default::default()
        });
        r.ensure(&item("home", "v"), EnsureOptions::default())
            .await
            .unwrap_err()
    }

    #[tokio::test]
    async fn test_remote_failures_are_classified() {
        assert!(matches!(
            failure_for(403).await,
            MigrationError::PermissionDenied { side: Side::Target, .. }
        ));
        assert!(matches!(failure_for(409).await, MigrationError::Conflict { .. }));
        assert!(matches!(
            failure_for(404).await,
            MigrationError::NotFound { side: Side::Target, .. }
        ));
        assert!(matches!(
            failure_for(500).await,
            MigrationError::Remote(r) if r.status == 500
        ));
    }
}
