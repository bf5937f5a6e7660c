use std::sync::Arc;

use serde_json::json;
use sweep_core::{Decision, OrgMapping, OrgMappingEntry, UnresolvedReason};
use sweep_reconcile::{
    Credentials, OrgStatus, Platforms, ReconcileConfig, ReconciliationDriver, StateSource,
};
use sweep_http::ApiToken;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(server: &MockServer) -> ReconcileConfig {
    ReconcileConfig {
        scan_base_url: server.uri(),
        hosting_api_url: server.uri(),
        http_timeout_secs: 5,
        ..Default::default()
    }
}

fn credentials() -> Credentials {
    Credentials {
        scan: ApiToken::new("snyk-token"),
        hosting: ApiToken::new("gh-token"),
    }
}

fn single_org() -> Arc<OrgMapping> {
    Arc::new(
        OrgMapping::from_entries([OrgMappingEntry {
            external_org_name: "teamA".to_string(),
            scan_org_id: "o1".to_string(),
            integration_id: Some("i1".to_string()),
        }])
        .expect("mapping"),
    )
}

async fn mount_targets(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/rest/orgs/o1/targets"))
        .and(header("authorization", "token snyk-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {"id": "t1", "attributes": {"display_name": "org/repoX"}},
                {"id": "t2", "attributes": {"display_name": "badname"}},
                {"id": "t3", "attributes": {"display_name": "org/live"}}
            ],
            "links": {}
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn archived_target_is_removed_and_everything_else_is_left_alone() {
    let server = MockServer::start().await;
    mount_targets(&server).await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(header("authorization", "Bearer gh-token"))
        .and(body_partial_json(json!({
            "variables": {"o0": "org", "n0": "live", "o1": "org", "n1": "repoX"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "r0": {"nameWithOwner": "org/live", "isArchived": false},
                "r1": {"nameWithOwner": "org/repoX", "isArchived": true}
            }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/rest/orgs/o1/targets/t1"))
        .and(query_param("version", "2024-05-08"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/rest/orgs/o1/targets/t3"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&server)
        .await;

    let config = config_for(&server);
    let platforms = Platforms::connect(&config, credentials()).expect("platforms");
    let summary = ReconciliationDriver::new(single_org(), config.run_options(), platforms)
        .run()
        .await;

    assert_eq!(summary.counters.targets_seen, 3);
    assert_eq!(summary.counters.confirmed_archived, 1);
    assert_eq!(summary.counters.confirmed_active, 1);
    assert_eq!(summary.counters.removed, 1);
    assert_eq!(summary.counters.unresolved, 1);
    assert_eq!(summary.counters.failed, 0);

    let org = &summary.orgs[0];
    assert_eq!(org.status, OrgStatus::Completed);
    let decision_for = |id: &str| {
        org.outcomes
            .iter()
            .find(|o| o.target_id == id)
            .map(|o| o.decision.clone())
    };
    assert_eq!(decision_for("t1"), Some(Decision::Removed));
    assert_eq!(
        decision_for("t2"),
        Some(Decision::SkippedUnresolved {
            reason: UnresolvedReason::MalformedName
        })
    );
    assert_eq!(decision_for("t3"), Some(Decision::SkippedActive));
}

#[tokio::test]
async fn rejected_deletion_is_recorded_as_failed_and_the_run_completes() {
    let server = MockServer::start().await;
    mount_targets(&server).await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "r0": {"nameWithOwner": "org/live", "isArchived": true},
                "r1": {"nameWithOwner": "org/repoX", "isArchived": true}
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/rest/orgs/o1/targets/t1"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/rest/orgs/o1/targets/t3"))
        .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
        .mount(&server)
        .await;

    let config = config_for(&server);
    let platforms = Platforms::connect(&config, credentials()).expect("platforms");
    let summary = ReconciliationDriver::new(single_org(), config.run_options(), platforms)
        .run()
        .await;

    assert_eq!(summary.counters.removed, 0);
    assert_eq!(summary.counters.already_absent, 1);
    assert_eq!(summary.counters.failed, 1);
    let failed = summary.orgs[0]
        .outcomes
        .iter()
        .find(|o| o.target_id == "t3")
        .expect("t3 outcome");
    assert_eq!(
        failed.decision,
        Decision::Failed {
            message: "403: forbidden".to_string()
        }
    );
}

#[tokio::test]
async fn dry_run_with_listing_state_never_deletes() {
    let server = MockServer::start().await;
    mount_targets(&server).await;
    Mock::given(method("GET"))
        .and(path("/orgs/org/repos"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"name": "repoX", "owner": {"login": "org"}, "archived": true},
            {"name": "live", "owner": {"login": "org"}, "archived": false}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/orgs/org/repos"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&server)
        .await;

    let config = ReconcileConfig {
        dry_run: true,
        state_source: StateSource::Listing,
        ..config_for(&server)
    };
    let platforms = Platforms::connect(&config, credentials()).expect("platforms");
    let summary = ReconciliationDriver::new(single_org(), config.run_options(), platforms)
        .run()
        .await;

    assert!(summary.dry_run);
    assert_eq!(summary.counters.would_remove, 1);
    assert_eq!(summary.counters.confirmed_active, 1);
    assert_eq!(summary.counters.removed, 0);
}

#[tokio::test]
async fn unreachable_scan_platform_fails_the_org_but_not_the_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/orgs/o1/targets"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
        .mount(&server)
        .await;

    let config = config_for(&server);
    let platforms = Platforms::connect(&config, credentials()).expect("platforms");
    let summary = ReconciliationDriver::new(single_org(), config.run_options(), platforms)
        .run()
        .await;

    assert_eq!(summary.counters.orgs_failed, 1);
    match &summary.orgs[0].status {
        OrgStatus::Failed { error } => assert!(error.contains("401")),
        other => panic!("unexpected status {other:?}"),
    }
    let rendered = serde_json::to_string(&summary).expect("summary serializes");
    assert!(!rendered.contains("snyk-token"));
}
