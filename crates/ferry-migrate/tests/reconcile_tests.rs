//! Reconciliation against a mock target: convergence without duplicates,
//! conflict safety and override handling per entity type.

mod common;

use ferry_migrate::lock::KeyedLocks;
use ferry_migrate::reconcile::{
    DesiredMembership, DesiredPolicy, DesiredProject, DesiredWiki, MembershipOps, PolicyKind,
    PolicyOps, ProjectOps, WikiOps,
};
use ferry_migrate::target::TargetClient;
use ferry_migrate::{EnsureOptions, EnsureOutcome, MigrationError, Reconciler, Transport};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

const POLICIES: &str = "/org/Acme/_apis/policy/configurations";
const MIN_REVIEWERS: &str = "fa4e907d-c16b-4a4c-9dfa-4906e5d171dd";

fn client(server: &MockServer) -> Arc<TargetClient> {
    let dir = std::env::temp_dir();
    let transport = Transport::new(Arc::new(common::config(server, &dir))).unwrap();
    Arc::new(TargetClient::new(Arc::new(transport)))
}

fn desired_policy(approvers: u64) -> DesiredPolicy {
    let mut settings = Map::new();
    settings.insert("minimumApproverCount".to_string(), json!(approvers));
    DesiredPolicy {
        project: "Acme".to_string(),
        repository_id: "r-1".to_string(),
        kind: PolicyKind::MinimumReviewers,
        branch: "main".to_string(),
        blocking: true,
        settings,
    }
}

fn policy_json(id: u64, approvers: u64) -> Value {
    json!({
        "id": id,
        "isEnabled": true,
        "isBlocking": true,
        "type": { "id": MIN_REVIEWERS, "displayName": "Minimum number of reviewers" },
        "settings": {
            "minimumApproverCount": approvers,
            "creatorVoteCounts": false,
            "scope": [{ "repositoryId": "r-1", "refName": "refs/heads/main", "matchKind": "Exact" }]
        }
    })
}

async fn mount_policies(server: &MockServer, policies: Vec<Value>) {
    Mock::given(method("GET"))
        .and(path(POLICIES))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "count": policies.len(), "value": policies })),
        )
        .mount(server)
        .await;
}

async fn forbid(server: &MockServer, verb: &str, pattern: &str) {
    Mock::given(method(verb))
        .and(path_regex(pattern))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(server)
        .await;
}

// ============================================================================
// Branch policies
// ============================================================================

#[tokio::test]
async fn test_policy_created_once_then_unchanged() {
    let server = MockServer::start().await;
    common::mount_refs(&server, "r-1", &["main"]).await;
    Mock::given(method("GET"))
        .and(path(POLICIES))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "count": 0, "value": [] })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_policies(&server, vec![policy_json(17, 2)]).await;
    Mock::given(method("POST"))
        .and(path(POLICIES))
        .respond_with(ResponseTemplate::new(200).set_body_json(policy_json(17, 2)))
        .expect(1)
        .mount(&server)
        .await;

    let reconciler = Reconciler::new(PolicyOps::new(client(&server)), KeyedLocks::new());
    let desired = desired_policy(2);

    let first = reconciler.ensure(&desired, EnsureOptions::default()).await.unwrap();
    let second = reconciler.ensure(&desired, EnsureOptions::default()).await.unwrap();

    assert_eq!(first.outcome, EnsureOutcome::Created);
    assert_eq!(second.outcome, EnsureOutcome::Unchanged);
    assert_eq!(second.state.and_then(|p| p.id), Some(17));
}

#[tokio::test]
async fn test_differing_policy_without_override_is_conflict_with_no_writes() {
    let server = MockServer::start().await;
    common::mount_refs(&server, "r-1", &["main"]).await;
    mount_policies(&server, vec![policy_json(17, 1)]).await;
    for verb in ["POST", "PUT", "PATCH", "DELETE"] {
        forbid(&server, verb, ".*").await;
    }

    let reconciler = Reconciler::new(PolicyOps::new(client(&server)), KeyedLocks::new());
    let err = reconciler
        .ensure(&desired_policy(2), EnsureOptions::default())
        .await
        .unwrap_err();

    match err {
        MigrationError::Conflict { entity, detail, .. } => {
            assert_eq!(entity, "branch_policy:r-1/minimum-reviewers@refs/heads/main");
            assert!(detail.contains("settings.minimumApproverCount"));
        }
        other => panic!("expected conflict, got {other:?}"),
    }
}

#[tokio::test]
async fn test_force_updates_policy_in_place() {
    let server = MockServer::start().await;
    common::mount_refs(&server, "r-1", &["main"]).await;
    mount_policies(&server, vec![policy_json(17, 1)]).await;
    Mock::given(method("PUT"))
        .and(path(format!("{POLICIES}/17")))
        .respond_with(ResponseTemplate::new(200).set_body_json(policy_json(17, 2)))
        .expect(1)
        .mount(&server)
        .await;
    forbid(&server, "DELETE", ".*").await;

    let reconciler = Reconciler::new(PolicyOps::new(client(&server)), KeyedLocks::new());
    let (ensured, record) = reconciler
        .ensure_recorded(&desired_policy(2), EnsureOptions::force())
        .await
        .unwrap();

    assert_eq!(ensured.outcome, EnsureOutcome::Updated);
    assert_eq!(record.detail.as_deref(), Some("settings.minimumApproverCount"));
}

#[tokio::test]
async fn test_policy_on_missing_branch_is_skipped() {
    let server = MockServer::start().await;
    common::mount_refs(&server, "r-1", &["develop"]).await;
    forbid(&server, "GET", "/policy/configurations").await;

    let reconciler = Reconciler::new(PolicyOps::new(client(&server)), KeyedLocks::new());
    let ensured = reconciler
        .ensure(&desired_policy(2), EnsureOptions::force())
        .await
        .unwrap();

    assert_eq!(ensured.outcome, EnsureOutcome::Skipped);
    assert!(ensured.skip_reason.unwrap().contains("main"));
}

// ============================================================================
// Wikis
// ============================================================================

fn desired_code_wiki() -> DesiredWiki {
    DesiredWiki {
        project: "Acme".to_string(),
        project_id: "p-1".to_string(),
        name: "app.wiki".to_string(),
        repository_id: Some("r-1".to_string()),
        mapped_path: Some("/docs".to_string()),
        branch: Some("main".to_string()),
    }
}

async fn mount_project_wiki(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/org/Acme/_apis/wiki/wikis/app.wiki"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "w-1", "name": "app.wiki", "type": "projectWiki"
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_wiki_force_cannot_update_in_place() {
    let server = MockServer::start().await;
    mount_project_wiki(&server).await;
    forbid(&server, "POST", ".*").await;
    forbid(&server, "DELETE", ".*").await;

    let reconciler = Reconciler::new(WikiOps::new(client(&server)), KeyedLocks::new());
    let err = reconciler
        .ensure(&desired_code_wiki(), EnsureOptions::force())
        .await
        .unwrap_err();

    assert!(err.is_conflict());
    assert!(err.to_string().contains("replace"));
}

#[tokio::test]
async fn test_wiki_replace_deletes_and_recreates() {
    let server = MockServer::start().await;
    mount_project_wiki(&server).await;
    Mock::given(method("DELETE"))
        .and(path("/org/Acme/_apis/wiki/wikis/w-1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/org/Acme/_apis/wiki/wikis"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "w-2", "name": "app.wiki", "type": "codeWiki",
            "repositoryId": "r-1", "mappedPath": "/docs"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let reconciler = Reconciler::new(WikiOps::new(client(&server)), KeyedLocks::new());
    let ensured = reconciler
        .ensure(&desired_code_wiki(), EnsureOptions::replace())
        .await
        .unwrap();

    assert_eq!(ensured.outcome, EnsureOutcome::Recreated);
    assert_eq!(ensured.state.map(|w| w.id).as_deref(), Some("w-2"));
}

// ============================================================================
// Group membership
// ============================================================================

#[tokio::test]
async fn test_force_adds_only_missing_members() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/org/Acme/_apis/groups/Contributors/members"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "count": 1,
            "value": [{ "principalName": "Alice@acme.io", "displayName": "Alice" }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/org/Acme/_apis/groups/Contributors/members/bob%40acme.io"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    forbid(&server, "PUT", "alice").await;

    let desired = DesiredMembership {
        project: "Acme".to_string(),
        group: "Contributors".to_string(),
        members: ["alice@acme.io", "bob@acme.io"]
            .into_iter()
            .map(String::from)
            .collect(),
    };
    let reconciler = Reconciler::new(MembershipOps::new(client(&server)), KeyedLocks::new());
    let ensured = reconciler.ensure(&desired, EnsureOptions::force()).await.unwrap();

    assert_eq!(ensured.outcome, EnsureOutcome::Updated);
    assert_eq!(ensured.state.unwrap().members.len(), 2);
}

#[tokio::test]
async fn test_replace_resets_group_to_exact_membership() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/org/Acme/_apis/groups/Contributors/members"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "count": 2,
            "value": [
                { "principalName": "alice@acme.io" },
                { "principalName": "mallory@acme.io" }
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path_regex("/groups/Contributors/members/(alice|mallory)%40acme\\.io$"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/org/Acme/_apis/groups/Contributors/members/alice%40acme.io"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let desired = DesiredMembership {
        project: "Acme".to_string(),
        group: "Contributors".to_string(),
        members: ["alice@acme.io".to_string()].into_iter().collect(),
    };
    let reconciler = Reconciler::new(MembershipOps::new(client(&server)), KeyedLocks::new());

    let ensured = reconciler.ensure(&desired, EnsureOptions::replace()).await.unwrap();
    assert_eq!(ensured.outcome, EnsureOutcome::Recreated);
    assert!(ensured.differences[0].contains("mallory@acme.io"));
    assert_eq!(ensured.state.unwrap().members.len(), 1);
}

#[tokio::test]
async fn test_extra_members_are_unchanged_without_replace() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/org/Acme/_apis/groups/Contributors/members"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "count": 2,
            "value": [
                { "principalName": "alice@acme.io" },
                { "principalName": "mallory@acme.io" }
            ]
        })))
        .mount(&server)
        .await;
    for verb in ["PUT", "DELETE"] {
        forbid(&server, verb, ".*").await;
    }

    let desired = DesiredMembership {
        project: "Acme".to_string(),
        group: "Contributors".to_string(),
        members: ["alice@acme.io".to_string()].into_iter().collect(),
    };
    let reconciler = Reconciler::new(MembershipOps::new(client(&server)), KeyedLocks::new());

    let ensured = reconciler.ensure(&desired, EnsureOptions::force()).await.unwrap();
    assert_eq!(ensured.outcome, EnsureOutcome::Unchanged);
}

// ============================================================================
// Projects and long-running operations
// ============================================================================

async fn mount_project_creation(server: &MockServer, operation: ResponseTemplate, polls: u64) {
    Mock::given(method("GET"))
        .and(path("/org/_apis/projects/Acme"))
        .respond_with(ResponseTemplate::new(404))
        .up_to_n_times(1)
        .mount(server)
        .await;
    common::mount_existing_project(server).await;
    Mock::given(method("POST"))
        .and(path("/org/_apis/projects"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({ "id": "op-9", "status": "queued" })))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/org/_apis/operations/op-9"))
        .respond_with(operation)
        .expect(polls)
        .mount(server)
        .await;
}

fn desired_project() -> DesiredProject {
    DesiredProject {
        name: "Acme".to_string(),
        description: None,
        visibility: None,
    }
}

#[tokio::test]
async fn test_vanished_operation_is_assumed_successful() {
    let server = MockServer::start().await;
    mount_project_creation(&server, ResponseTemplate::new(404), 1).await;

    let reconciler = Reconciler::new(ProjectOps::new(client(&server)), KeyedLocks::new());
    let ensured = reconciler
        .ensure(&desired_project(), EnsureOptions::default())
        .await
        .unwrap();

    assert_eq!(ensured.outcome, EnsureOutcome::Created);
    assert_eq!(ensured.state.unwrap().id, "p-1");
}

#[tokio::test]
async fn test_failed_operation_is_surfaced() {
    let server = MockServer::start().await;
    mount_project_creation(
        &server,
        ResponseTemplate::new(200).set_body_json(json!({ "id": "op-9", "status": "failed" })),
        1,
    )
    .await;

    let reconciler = Reconciler::new(ProjectOps::new(client(&server)), KeyedLocks::new());
    let err = reconciler
        .ensure(&desired_project(), EnsureOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, MigrationError::OperationFailed { status, .. } if status == "failed"));
}

#[tokio::test]
async fn test_operation_polling_is_bounded() {
    let server = MockServer::start().await;
    mount_project_creation(
        &server,
        ResponseTemplate::new(200).set_body_json(json!({ "id": "op-9", "status": "inProgress" })),
        5,
    )
    .await;

    let reconciler = Reconciler::new(ProjectOps::new(client(&server)), KeyedLocks::new());
    let err = reconciler
        .ensure(&desired_project(), EnsureOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, MigrationError::Timeout { attempts: 5, .. }));
}
