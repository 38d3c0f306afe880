mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::{Request as HttpRequest, StatusCode, header};
use common::{MockFleet, options_json, wait_for_state};
use serde_json::{Value, json};
use service_plugin::error::CallError;
use service_plugin::jsonrpc::{Id, Request, codes};
use service_plugin::message::{SendMessageParams, ServiceState};
use service_plugin::peer::Peer;
use service_plugin::plugin_test_util::MockService;
use slackmux::logger::Telemetry;
use slackmux::router::{ActionParams, ActionRouter, ApiActionKind, CALLBACK_ACCEPTED};
use slackmux::web::{self, MasterClient};
use tower::ServiceExt;

fn router_over(fleet: &MockFleet) -> Arc<ActionRouter> {
    Arc::new(ActionRouter::new(fleet.registry.clone(), Arc::new(Telemetry::noop())))
}

fn broken_fleet() -> MockFleet {
    MockFleet::with(|id| {
        if id == "broken" { MockService::new().failing_open() } else { MockService::new() }
    })
}

async fn create(router: &ActionRouter, id: &str) -> Value {
    router
        .route(ApiActionKind::CreateService, ActionParams::new(Some(id.into()), options_json()))
        .await
        .unwrap()
}

#[tokio::test]
async fn say_reaches_the_service() {
    let fleet = MockFleet::new();
    let router = router_over(&fleet);

    assert_eq!(create(&router, "svc1").await, json!("svc1"));
    wait_for_state(&fleet.registry, "svc1", ServiceState::Open).await;

    let reply = router
        .route(
            ApiActionKind::SendMessage,
            ActionParams::new(Some("svc1".into()), json!({"channel": "general", "message": "hi"})),
        )
        .await
        .unwrap();
    assert_eq!(reply, Value::Null);
    assert_eq!(
        fleet.service("svc1").sent_messages().await,
        vec![SendMessageParams { channel: Some("general".into()), text: "hi".into(), attachments: None }]
    );
}

#[tokio::test]
async fn worker_failures_come_back_verbatim() {
    let fleet = broken_fleet();
    let router = router_over(&fleet);
    create(&router, "broken").await;
    wait_for_state(&fleet.registry, "broken", ServiceState::Closed).await;

    let err = router
        .route(ApiActionKind::SendMessage, ActionParams::new(Some("broken".into()), json!({"text": "hi"})))
        .await
        .unwrap_err();
    let remote = match err {
        CallError::Remote(remote) => remote,
        other => panic!("expected a forwarded error, got {other:?}"),
    };
    assert_eq!(remote.code, codes::NOT_READY);
    assert_eq!(remote.data, Some(json!({"state": "closed"})));
}

#[tokio::test]
async fn create_without_an_id_is_rejected() {
    let fleet = MockFleet::new();
    let router = router_over(&fleet);
    let err = router
        .route(ApiActionKind::CreateService, ActionParams::new(None, options_json()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), codes::INVALID_PARAMS);
    assert_eq!(fleet.launcher.launched(), 0);
}

#[tokio::test]
async fn users_come_from_the_worker() {
    let fleet = MockFleet::new();
    let router = router_over(&fleet);
    create(&router, "svc1").await;
    wait_for_state(&fleet.registry, "svc1", ServiceState::Open).await;

    let users = router
        .route(ApiActionKind::GetUsers, ActionParams::new(Some("svc1".into()), Value::Null))
        .await
        .unwrap();
    assert_eq!(users["alice"]["id"], "U1");
}

#[tokio::test]
async fn unknown_methods_are_answered_not_dropped() {
    let fleet = MockFleet::new();
    let router = router_over(&fleet);

    let rsp = router
        .handle(Request::call(Id::Number(7), "reboot-everything", None))
        .await
        .expect("calls always get a reply");
    assert_eq!(rsp.error.map(|e| e.code), Some(codes::METHOD_NOT_FOUND));

    let notification = Request::notification("get-service", None);
    assert!(router.handle(notification).await.is_none());
}

/// The web router wired to a master over an in-memory pipe.
fn two_hop(fleet: &MockFleet) -> axum::Router {
    let (web_side, master_side) = tokio::io::duplex(64 * 1024);
    let (master_read, master_write) = tokio::io::split(master_side);
    let (web_read, web_write) = tokio::io::split(web_side);

    let (to_web, inbound) = Peer::connect("web", master_read, master_write);
    tokio::spawn(router_over(fleet).serve_peer(to_web, inbound));

    let (to_master, _) = Peer::connect("master", web_read, web_write);
    web::router(MasterClient::new(to_master, Duration::from_secs(2)))
}

async fn send(app: &axum::Router, req: HttpRequest<Body>) -> (StatusCode, Value) {
    let rsp = app.clone().oneshot(req).await.unwrap();
    let status = rsp.status();
    let bytes = to_bytes(rsp.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn json_request(method: &str, uri: &str, body: Value) -> HttpRequest<Body> {
    HttpRequest::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: &str, uri: &str) -> HttpRequest<Body> {
    HttpRequest::builder().method(method).uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn http_actions_travel_through_the_master() {
    let fleet = broken_fleet();
    let app = two_hop(&fleet);

    let mut create_body = options_json();
    create_body["id"] = json!("svc1");
    let (status, reply) = send(&app, json_request("POST", "/api/v1/slack/service", create_body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply, json!({"result": true, "body": "svc1"}));
    wait_for_state(&fleet.registry, "svc1", ServiceState::Open).await;

    let (status, reply) = send(&app, empty_request("GET", "/api/v1/slack/service/ghost")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(reply["result"], false);
    assert_eq!(reply["error"]["code"], codes::NOT_FOUND);

    let say = json!({"channel": "general", "message": "hi"});
    let (status, reply) = send(&app, json_request("POST", "/api/v1/slack/svc1/say", say)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply, json!({"result": true}));
    assert_eq!(fleet.service("svc1").sent_messages().await.len(), 1);

    let (status, reply) = send(&app, empty_request("GET", "/api/v1/version")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["body"]["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn http_create_without_an_id_gets_one() {
    let fleet = MockFleet::new();
    let app = two_hop(&fleet);

    let (status, reply) = send(&app, json_request("POST", "/api/v1/slack/service", options_json())).await;
    assert_eq!(status, StatusCode::OK);
    let id = reply["body"].as_str().expect("created id");
    assert!(!id.is_empty());
    assert!(fleet.registry.dispatch(id).is_some());
}

#[tokio::test]
async fn slack_callbacks_are_accepted_as_forms() {
    let fleet = MockFleet::new();
    let app = two_hop(&fleet);
    let mut create_body = options_json();
    create_body["id"] = json!("svc1");
    send(&app, json_request("POST", "/api/v1/slack/service", create_body)).await;
    wait_for_state(&fleet.registry, "svc1", ServiceState::Open).await;

    // payload={"callback_id":"svc1","action":"approve"}
    let form = "payload=%7B%22callback_id%22%3A%22svc1%22%2C%22action%22%3A%22approve%22%7D";
    let req = HttpRequest::builder()
        .method("POST")
        .uri("/api/v1/slack/callback")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(form))
        .unwrap();
    let (status, reply) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["body"], CALLBACK_ACCEPTED);

    let (_, reply) = send(&app, empty_request("GET", "/api/v1/slack/svc1/callback")).await;
    let records = reply["body"].as_array().expect("callback list");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["event"]["action"], "approve");
}

#[tokio::test]
async fn http_maps_not_ready_to_conflict() {
    let fleet = broken_fleet();
    let app = two_hop(&fleet);

    let mut create_body = options_json();
    create_body["id"] = json!("broken");
    send(&app, json_request("POST", "/api/v1/slack/service", create_body)).await;
    wait_for_state(&fleet.registry, "broken", ServiceState::Closed).await;

    let (status, reply) = send(&app, json_request("POST", "/api/v1/slack/broken/say", json!({"text": "hi"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(reply["error"]["code"], codes::NOT_READY);
    assert_eq!(reply["error"]["data"], json!({"state": "closed"}));
}

#[tokio::test]
async fn http_maps_a_silent_worker_to_gateway_timeout() {
    let fleet = MockFleet::with(|_| MockService::new().stalling_info());
    let app = two_hop(&fleet);

    let mut create_body = options_json();
    create_body["id"] = json!("slow");
    let (status, _) = send(&app, json_request("POST", "/api/v1/slack/service", create_body)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, reply) = send(&app, empty_request("GET", "/api/v1/slack/service/slow")).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(reply["result"], false);
    assert_eq!(reply["error"]["code"], codes::TIMEOUT);
}
