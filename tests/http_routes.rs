use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use squad_harness::gateway::{
    FinishReason, GenerateRequest, GenerateResponse, ModelError, ModelGateway, TokenUsage,
};
use squad_harness::{http, Config, SquadStore, StructureService};
use tower::ServiceExt;

/// Replays one canned proposal per call.
struct Canned(Mutex<Vec<String>>);

#[async_trait]
impl ModelGateway for Canned {
    async fn generate(&self, req: GenerateRequest) -> Result<GenerateResponse, ModelError> {
        let content = self
            .0
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| ModelError::provider("canned", "no more responses"))?;
        Ok(GenerateResponse {
            content,
            usage: TokenUsage::new(3, 4),
            execution_time_ms: 1,
            model: req.model,
            finish_reason: FinishReason::Stop,
        })
    }
}

struct App {
    router: Router,
    squad: i64,
}

async fn app(responses: Vec<Value>) -> App {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("http.sqlite");
    std::mem::forget(dir);
    let store = SquadStore::new(path).unwrap();
    let ws = store.create_workspace("Acme").await.unwrap();
    store.add_member(ws, "alice").await.unwrap();
    let squad = store.create_squad(ws, "Payments", None).await.unwrap();
    store.add_backlog_item(squad, "Refunds", None).await.unwrap();

    let canned = responses
        .into_iter()
        .rev()
        .map(|p| json!({ "proposal": p }).to_string())
        .collect();
    let service = StructureService::new(
        store,
        Arc::new(Canned(Mutex::new(canned))),
        &Config::default(),
    );
    App {
        router: http::router(Arc::new(service)),
        squad,
    }
}

async fn call(
    router: &Router,
    method: &str,
    uri: &str,
    user: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header(http::USER_HEADER, user);
    }
    let body = match body {
        Some(v) => {
            builder = builder.header("content-type", "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let response = router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn generate_list_approve_reject_flow() {
    let a = app(vec![json!({
        "personas": [{"name": "Finance Admin"}, {"name": "Auditor"}],
        "governance": {"decision_model": "consent"}
    })])
    .await;

    let (status, body) = call(
        &a.router,
        "POST",
        "/proposals",
        Some("alice"),
        Some(json!({"squad_id": a.squad})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["proposal"]["status"], "DRAFT");
    let suggestions = body["suggestions"].as_array().unwrap();
    assert_eq!(suggestions.len(), 3);
    assert_eq!(suggestions[0]["suggestion_type"], "persona");
    assert_eq!(suggestions[0]["status"], "pending");

    let uri = format!("/suggestions?squad_id={}", a.squad);
    let (status, pending) = call(&a.router, "GET", &uri, Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pending.as_array().unwrap().len(), 3);
    let first = pending[0]["id"].as_i64().unwrap();
    let second = pending[1]["id"].as_i64().unwrap();

    let (status, decided) = call(
        &a.router,
        "POST",
        &format!("/suggestions/{first}/approve"),
        Some("alice"),
        Some(json!({"edited_payload": {"name": "Finance Controller"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decided["suggestion"]["status"], "approved_with_edits");
    assert_eq!(decided["outcome"]["result"], "persona_linked");
    assert_eq!(decided["outcome"]["created"], true);

    let (status, body) = call(
        &a.router,
        "POST",
        &format!("/suggestions/{first}/approve"),
        Some("alice"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["message"].as_str().is_some());

    let (status, decided) = call(
        &a.router,
        "POST",
        &format!("/suggestions/{second}/reject"),
        Some("alice"),
        Some(json!({"reason": "out of scope"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decided["suggestion"]["status"], "rejected");
    assert!(decided.get("outcome").is_none());

    let (_, pending) = call(&a.router, "GET", &uri, Some("alice"), None).await;
    assert_eq!(pending.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn caller_identity_and_membership_are_enforced() {
    let a = app(vec![]).await;

    let (status, body) = call(
        &a.router,
        "POST",
        "/proposals",
        None,
        Some(json!({"squad_id": a.squad})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["message"].as_str().is_some());

    let uri = format!("/suggestions?squad_id={}", a.squad);
    let (status, _) = call(&a.router, "GET", &uri, Some("mallory"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = call(&a.router, "GET", "/suggestions?squad_id=999", Some("alice"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_requests_are_bad_requests() {
    let a = app(vec![]).await;

    let (status, _) = call(&a.router, "GET", "/suggestions", Some("alice"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&a.router, "POST", "/proposals", Some("alice"), Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&a.router, "POST", "/suggestions/abc/approve", Some("alice"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &a.router,
        "POST",
        "/suggestions/breakdown",
        Some("alice"),
        Some(json!({"proposal_id": "seven"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn model_failure_is_a_generic_500() {
    // No canned responses: the gateway errors.
    let a = app(vec![]).await;
    let (status, body) = call(
        &a.router,
        "POST",
        "/proposals",
        Some("alice"),
        Some(json!({"squad_id": a.squad})),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let message = body["message"].as_str().unwrap();
    assert!(!message.contains("no more responses"));
}

#[tokio::test]
async fn confirm_then_discard_conflicts() {
    let a = app(vec![json!({"governance": {}})]).await;
    let (_, body) = call(
        &a.router,
        "POST",
        "/proposals",
        Some("alice"),
        Some(json!({"squad_id": a.squad})),
    )
    .await;
    let id = body["proposal"]["id"].as_i64().unwrap();

    let (status, body) = call(
        &a.router,
        "POST",
        &format!("/proposals/{id}/confirm"),
        Some("alice"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "CONFIRMED");

    let (status, _) = call(
        &a.router,
        "POST",
        &format!("/proposals/{id}/discard"),
        Some("alice"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = call(
        &a.router,
        "POST",
        "/suggestions/breakdown",
        Some("alice"),
        Some(json!({"proposal_id": id})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}
