use std::sync::Arc;

use serde_json::json;

use pipeline::{PipelineId, SinkRegistry, StatusStore};
use relay::{
    DeliveryPolicy, Dispatcher, InMemoryDedupStore, InMemoryStatusCache, SubscriptionRegistry,
};

use super::*;

struct Setup {
    receiver: WebhookReceiver,
    status: Arc<InMemoryStatusCache>,
    dedup: Arc<InMemoryDedupStore>,
}

fn setup(secret: Option<&str>) -> Setup {
    let status = Arc::new(InMemoryStatusCache::new());
    let dedup = Arc::new(InMemoryDedupStore::default());
    let orchestrator = Orchestrator::new(
        dedup.clone(),
        status.clone(),
        Arc::new(SubscriptionRegistry::new()),
        Dispatcher::new(SinkRegistry::new(), DeliveryPolicy::DEFAULT),
    );
    Setup {
        receiver: WebhookReceiver::new(orchestrator, secret.and_then(WebhookSecret::new)),
        status,
        dedup,
    }
}

fn generic_body() -> Vec<u8> {
    serde_json::to_vec(&json!({
        "pipeline_id": "p1",
        "run_id": 7,
        "stage": "failed",
        "timestamp": "2024-05-01T12:00:00Z",
    }))
    .unwrap()
}

#[test]
fn format_resolution_order() {
    assert_eq!(resolve_format(&Headers::new()), "generic");
    assert_eq!(
        resolve_format(&Headers::new().with("X-GitHub-Event", "workflow_run")),
        "github_actions"
    );
    assert_eq!(resolve_format(&Headers::new().with("X-GitHub-Event", "push")), "generic");
    assert_eq!(
        resolve_format(
            &Headers::new()
                .with("X-GitHub-Event", "workflow_run")
                .with("X-Pipeline-Source", "jenkins")
        ),
        "jenkins"
    );
}

#[tokio::test]
async fn unsigned_receiver_accepts_then_reports_duplicate() {
    let s = setup(None);

    let first = s.receiver.handle(&Headers::new(), &generic_body()).await;
    assert_eq!(first.status, 202);
    assert_eq!(first.body.result, "accepted");
    assert_eq!(first.body.deliveries, Some(0));

    let second = s.receiver.handle(&Headers::new(), &generic_body()).await;
    assert_eq!(second.status, 200);
    assert_eq!(second.body.result, "duplicate");
}

#[tokio::test]
async fn malformed_body_is_400() {
    let s = setup(None);
    let response = s.receiver.handle(&Headers::new(), b"[]").await;
    assert_eq!(response.status, 400);
    assert!(response.body.error.is_some());
}

#[tokio::test]
async fn unknown_source_header_is_400() {
    let s = setup(None);
    let headers = Headers::new().with("X-Pipeline-Source", "teamcity");
    assert_eq!(s.receiver.handle(&headers, &generic_body()).await.status, 400);
}

#[tokio::test]
async fn signed_requests_are_verified_before_ingestion() {
    let s = setup(Some("s3cret"));
    let body = generic_body();

    let missing = s.receiver.receive(&Headers::new(), &body).await.unwrap_err();
    assert_eq!(missing, ListenerError::MissingSignature);

    let forged = Headers::new().with("X-Pipeline-Signature-256", "sha256=00ff");
    let response = s.receiver.handle(&forged, &body).await;
    assert_eq!(response.status, 401);
    assert_eq!(response.body.result, "unauthorized");

    // Nothing was recorded for rejected requests.
    assert!(s.dedup.is_empty());
    assert!(s.status.is_empty());

    let signature = WebhookSecret::new("s3cret").unwrap().sign(&body);
    let signed = Headers::new().with("X-Hub-Signature-256", signature);
    assert_eq!(s.receiver.handle(&signed, &body).await.status, 202);
    assert!(s.status.get(&PipelineId::new("p1").unwrap()).await.unwrap().is_some());
}

#[tokio::test]
async fn github_workflow_run_is_normalized() {
    let s = setup(None);
    let body = serde_json::to_vec(&json!({
        "action": "completed",
        "repository": { "full_name": "acme/widgets" },
        "workflow_run": {
            "id": 9001,
            "name": "CI",
            "run_attempt": 2,
            "status": "completed",
            "conclusion": "failure",
            "updated_at": "2024-05-01T12:00:00Z",
            "head_branch": "main",
        }
    }))
    .unwrap();
    let headers = Headers::new().with("X-GitHub-Event", "workflow_run");

    assert_eq!(s.receiver.handle(&headers, &body).await.status, 202);
    let snapshot = s
        .status
        .get(&PipelineId::new("acme/widgets/CI").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.event.run_id.as_str(), "9001");
    assert_eq!(snapshot.event.attempt_sequence.as_u64(), 2);
}

#[test]
fn status_codes_for_errors() {
    use pipeline::StoreKind;

    assert_eq!(ListenerError::InvalidSignature.status_code(), 401);
    let unavailable = ListenerError::from(RelayError::store_unavailable(StoreKind::Dedup, "down"));
    assert_eq!(unavailable.status_code(), 503);
    assert_eq!(IngestResponse::from(&unavailable).body.result, "unavailable");
}
