//! HTTP routing tests, driven without a network listener.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{Method, StatusCode};
use serde_json::{json, Value};
use tempfile::TempDir;

use stewardship::config::ReviewerConfig;
use stewardship::{
    InMemoryRelationshipGraph, RuleBasedReviewer, StewardshipConfig, StewardshipEngine, SystemClock,
};
use stewardship_node::HttpServer;

struct TestNode {
    _dir: TempDir,
    server: HttpServer,
}

fn node() -> TestNode {
    let dir = TempDir::new().unwrap();
    let relationships = Arc::new(InMemoryRelationshipGraph::new());
    let engine = StewardshipEngine::open(
        dir.path(),
        StewardshipConfig::default(),
        Arc::new(SystemClock),
        relationships.clone(),
        Arc::new(RuleBasedReviewer::new("reviewer", ReviewerConfig::default())),
    )
    .unwrap();
    let server = HttpServer::new(
        Arc::new(engine),
        relationships,
        "127.0.0.1:0".parse().unwrap(),
    );
    TestNode { _dir: dir, server }
}

impl TestNode {
    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> (StatusCode, Value) {
        let (path, query) = match path.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (path, None),
        };
        let body = body
            .map(|v| Bytes::from(v.to_string()))
            .unwrap_or_default();
        let response = self.server.route(method, path, query, body).await;
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn steward_with_policy(&self) -> Value {
        let now = chrono::Utc::now();
        let (status, _) = self
            .call(
                Method::POST,
                "/grants",
                Some(json!({
                    "steward_id": "coop-board",
                    "subject_id": "river",
                    "basis": "organizational_role",
                    "evidence": {
                        "tier": "self_assertion",
                        "reference": "membership",
                        "recorded_at": now,
                    },
                    "scope": { "kind": "all" },
                    "tier": "coordinator",
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, policy) = self
            .call(
                Method::POST,
                "/policies",
                Some(json!({
                    "subject_id": "river",
                    "steward_id": "coop-board",
                    "authority_basis": "organizational_role",
                    "rules": [
                        { "selector": { "kind": "capability", "value": "post" }, "effect": "disabled" },
                        { "selector": { "kind": "capability", "value": "direct_message" }, "effect": { "limited": { "max_per_day": 5 } } },
                    ],
                    "evidence": {
                        "tier": "self_assertion",
                        "reference": "conduct-report",
                        "recorded_at": now,
                    },
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", policy);
        policy
    }
}

#[tokio::test]
async fn health_reports_ok() {
    let node = node();
    let (status, body) = node.call(Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["reviewer"], "reviewer");
}

#[tokio::test]
async fn commit_then_check() {
    let node = node();
    let policy = node.steward_with_policy().await;
    assert_eq!(policy["version"], 1);

    let (status, decision) = node
        .call(Method::GET, "/capabilities/river/post/check", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decision["decision"], "deny");

    let (_, decision) = node
        .call(Method::GET, "/capabilities/river/direct_message/check?max_per_day=20", None)
        .await;
    assert_eq!(decision["decision"], "limited");

    let (_, decision) = node
        .call(Method::GET, "/capabilities/river/file_appeal/check", None)
        .await;
    assert_eq!(decision["decision"], "allow");
}

#[tokio::test]
async fn inalienable_rule_is_rejected_with_kind() {
    let node = node();
    node.steward_with_policy().await;
    let (status, body) = node
        .call(
            Method::POST,
            "/policies",
            Some(json!({
                "subject_id": "river",
                "steward_id": "coop-board",
                "authority_basis": "organizational_role",
                "rules": [{ "selector": { "kind": "capability", "value": "request_erasure" }, "effect": "disabled" }],
                "evidence": {
                    "tier": "self_assertion",
                    "reference": "x",
                    "recorded_at": chrono::Utc::now(),
                },
                "expected_version": 1,
            })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["kind"], "inalienable_violation");
}

#[tokio::test]
async fn unknown_capability_and_route() {
    let node = node();
    let (status, body) = node
        .call(Method::GET, "/capabilities/river/teleport/check", None)
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["kind"], "unknown_capability");

    let (status, body) = node.call(Method::GET, "/nowhere", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");
}

#[tokio::test]
async fn delta_since_version() {
    let node = node();
    node.steward_with_policy().await;

    let (status, body) = node
        .call(Method::GET, "/policies/river/delta?since_version=0", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (_, body) = node
        .call(Method::GET, "/policies/river/delta?since_version=1", None)
        .await;
    assert!(body.as_array().unwrap().is_empty());

    let (status, body) = node
        .call(Method::GET, "/policies/river/delta?since_version=abc", None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "invalid_query");
}

#[tokio::test]
async fn appeal_lifecycle_over_http() {
    let node = node();
    let policy = node.steward_with_policy().await;
    let policy_id = policy["id"].as_str().unwrap();

    let (status, appeal) = node
        .call(
            Method::POST,
            "/appeals",
            Some(json!({
                "subject_id": "river",
                "policy_id": policy_id,
                "grounds": "posting ban is out of proportion",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(appeal["state"], "filed");
    let appeal_id = appeal["id"].as_str().unwrap().to_string();

    let (_, appeal) = node
        .call(Method::POST, &format!("/appeals/{}/advance", appeal_id), None)
        .await;
    assert_eq!(appeal["state"], "response_window");

    let (status, body) = node
        .call(
            Method::POST,
            &format!("/appeals/{}/rebuttal", appeal_id),
            Some(json!({ "submitted_by": "river", "statement": "not my turn" })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN, "{}", body);

    let (status, appeal) = node
        .call(
            Method::POST,
            &format!("/appeals/{}/withdraw", appeal_id),
            Some(json!({ "by": "river" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(appeal["state"], "withdrawn");

    let (status, _) = node
        .call(Method::GET, &format!("/appeals/{}", appeal_id), None)
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn disconnect_and_audit_export() {
    let node = node();
    node.steward_with_policy().await;

    let (status, report) = node
        .call(Method::POST, "/subjects/river/disconnect", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["policies_revoked"], 1);

    let (_, decision) = node
        .call(Method::GET, "/capabilities/river/post/check", None)
        .await;
    assert_eq!(decision["decision"], "allow");

    let (status, events) = node.call(Method::GET, "/audit/export", None).await;
    assert_eq!(status, StatusCode::OK);
    let events = events.as_array().unwrap();
    assert!(events.iter().any(|e| e["event"]["event"] == "disconnection"));
}

#[tokio::test]
async fn relationships_feed_erasure() {
    let node = node();
    let (status, _) = node
        .call(
            Method::POST,
            "/relationships",
            Some(json!({
                "subject_id": "river",
                "supporter_id": "ana",
                "weight_class": "trusted",
                "flagging_concern": true,
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, report) = node.call(Method::POST, "/subjects/river/erasure", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["edges_removed"], 1);

    let (status, _) = node
        .call(
            Method::POST,
            "/relationships",
            Some(json!({
                "subject_id": "ana",
                "supporter_id": "ana",
                "weight_class": "intimate",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn percent_encoded_ids_reach_handlers_decoded() {
    let node = node();
    let (status, _) = node
        .call(Method::POST, "/subjects", Some(json!({ "id": "river/kid" })))
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = node.call(Method::GET, "/policies/river%2Fkid", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["subject"]["id"], "river/kid");

    let (status, body) = node.call(Method::GET, "/policies/river%FF", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "bad_request");
}

#[tokio::test]
async fn restrictions_over_http() {
    let node = node();
    node.steward_with_policy().await;
    let (status, policy) = node
        .call(
            Method::POST,
            "/policies",
            Some(json!({
                "subject_id": "river",
                "steward_id": "coop-board",
                "authority_basis": "organizational_role",
                "rules": [],
                "evidence": {
                    "tier": "self_assertion",
                    "reference": "family-agreement",
                    "recorded_at": chrono::Utc::now(),
                },
                "expected_version": 1,
                "restrictions": {
                    "content": { "blocked_categories": ["gambling"], "age_rating_max": "PG-13" },
                    "time": { "daily_max_minutes": 60 },
                    "monitoring": { "log_sessions": true, "retention_days": 30, "subject_can_view": false },
                },
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{}", policy);
    assert_eq!(policy["layers"][0]["steward_id"], "coop-board");

    let (status, computed) = node.call(Method::GET, "/policies/river/computed", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(computed["daily_max_minutes"], 60);
    assert_eq!(computed["content"]["age_rating_max"], "PG-13");

    let (_, decision) = node
        .call(
            Method::POST,
            "/content/river/check",
            Some(json!({ "content_hash": "h1", "categories": ["gambling"] })),
        )
        .await;
    assert_eq!(decision["decision"], "deny");
    let (_, decision) = node
        .call(
            Method::POST,
            "/content/river/check",
            Some(json!({ "content_hash": "h2", "age_rating": "PG" })),
        )
        .await;
    assert_eq!(decision["decision"], "allow");

    let (_, decision) = node
        .call(Method::POST, "/sessions/river/check", Some(json!({ "daily_minutes": 45 })))
        .await;
    assert_eq!(decision["decision"], "limited");
    assert_eq!(decision["params"]["daily_minutes_remaining"], 15);
    let (_, decision) = node.call(Method::POST, "/sessions/river/check", None).await;
    assert_eq!(decision["params"]["daily_minutes_remaining"], 60);
}

#[tokio::test]
async fn activity_visible_to_stewards_only() {
    let node = node();
    let (status, _) = node
        .call(Method::POST, "/subjects/river/activity", Some(json!({ "session_minutes": 20 })))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    node.steward_with_policy().await;
    node.call(
        Method::POST,
        "/policies",
        Some(json!({
            "subject_id": "river",
            "steward_id": "coop-board",
            "authority_basis": "organizational_role",
            "rules": [],
            "evidence": {
                "tier": "self_assertion",
                "reference": "family-agreement",
                "recorded_at": chrono::Utc::now(),
            },
            "expected_version": 1,
            "restrictions": { "monitoring": { "log_sessions": true, "subject_can_view": false } },
        })),
    )
    .await;

    let (status, entry) = node
        .call(
            Method::POST,
            "/subjects/river/activity",
            Some(json!({ "session_minutes": 20, "categories_accessed": { "games": 2 } })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{}", entry);
    assert_eq!(entry["session_minutes"], 20);
    assert!(entry["categories_accessed"].as_object().unwrap().is_empty());

    let (status, entries) = node
        .call(Method::GET, "/subjects/river/activity?viewer=coop-board", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(entries.as_array().unwrap().len(), 1);

    let (status, body) = node
        .call(Method::GET, "/subjects/river/activity?viewer=river", None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["kind"], "unauthorized_steward");

    let (status, _) = node.call(Method::GET, "/subjects/river/activity", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn steward_grants_listed() {
    let node = node();
    node.steward_with_policy().await;
    let (status, grants) = node.call(Method::GET, "/stewards/coop-board/grants", None).await;
    assert_eq!(status, StatusCode::OK);
    let grants = grants.as_array().unwrap();
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0]["subject_id"], "river");

    let (_, grants) = node.call(Method::GET, "/stewards/nobody/grants", None).await;
    assert!(grants.as_array().unwrap().is_empty());
}
