// src/web.rs

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context as _;
use axum::extract::{Form, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use service_plugin::error::CallError;
use service_plugin::jsonrpc::codes;
use service_plugin::peer::Peer;
use service_plugin::util::unique_id;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{Instrument, info, info_span};
use uuid::Uuid;

use crate::config::Settings;
use crate::router::{ActionParams, ApiActionKind, ApiReply};

/// The web worker's end of the channel to the master.
#[derive(Clone)]
pub struct MasterClient {
    peer: Peer,
    timeout: Duration,
}

impl MasterClient {
    pub fn new(peer: Peer, timeout: Duration) -> Self {
        Self { peer, timeout }
    }

    /// First hop: hand the action to the master and wait for its verdict.
    pub async fn call(&self, kind: ApiActionKind, params: ActionParams) -> Result<Value, CallError> {
        let params = serde_json::to_value(params).map_err(|e| CallError::Codec(e.to_string()))?;
        self.peer.call(kind, Some(params), self.timeout).await
    }

    pub async fn closed(&self) {
        self.peer.closed().await
    }
}

/// The master waits for the service worker, which may itself wait out the
/// delete grace, so this hop gets more time than the one behind it.
pub fn hop_timeout(settings: &Settings) -> Duration {
    settings.web.timeout() + settings.worker.delete_grace() + Duration::from_secs(1)
}

fn status_for(code: i64) -> StatusCode {
    match code {
        codes::NOT_FOUND => StatusCode::NOT_FOUND,
        codes::INVALID_PARAMS | codes::INVALID_REQUEST | codes::PARSE_ERROR => StatusCode::BAD_REQUEST,
        codes::NOT_READY => StatusCode::CONFLICT,
        codes::TIMEOUT => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiReply {
    fn into_response(self) -> Response {
        let status = match &self.error {
            None => StatusCode::OK,
            Some(err) => status_for(err.code),
        };
        (status, Json(self)).into_response()
    }
}

async fn forward(client: &MasterClient, kind: ApiActionKind, id: Option<String>, payload: Value) -> ApiReply {
    let request_id = Uuid::new_v4();
    let span = info_span!("action", %request_id, action = %kind, service_id = id.as_deref().unwrap_or(""));
    let result = client.call(kind, ActionParams::new(id, payload)).instrument(span).await;
    ApiReply::from_result(result)
}

pub fn router(client: MasterClient) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    let api = Router::new()
        .route("/version", get(version))
        .route("/slack/service", post(create_service).get(list_services))
        .route("/slack/service/:id", get(get_service).delete(delete_service))
        .route("/slack/callback", post(post_callback))
        .route("/slack/:id/users", get(get_users))
        .route("/slack/:id/say", post(say))
        .route("/slack/:id/hear", post(start_listen).delete(stop_listen))
        .route("/slack/:id/callback", get(get_callbacks));
    Router::new()
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(client)
}

async fn version() -> ApiReply {
    ApiReply::from_result(Ok(json!({ "version": env!("CARGO_PKG_VERSION") })))
}

#[derive(Debug, Deserialize)]
struct CreateBody {
    #[serde(default)]
    id: Option<String>,
    #[serde(flatten)]
    options: Map<String, Value>,
}

async fn create_service(State(client): State<MasterClient>, Json(body): Json<CreateBody>) -> ApiReply {
    let id = body.id.filter(|id| !id.is_empty()).unwrap_or_else(unique_id);
    forward(&client, ApiActionKind::CreateService, Some(id), Value::Object(body.options)).await
}

async fn list_services(State(client): State<MasterClient>) -> ApiReply {
    forward(&client, ApiActionKind::GetService, None, Value::Null).await
}

async fn get_service(State(client): State<MasterClient>, Path(id): Path<String>) -> ApiReply {
    forward(&client, ApiActionKind::GetService, Some(id), Value::Null).await
}

async fn delete_service(State(client): State<MasterClient>, Path(id): Path<String>) -> ApiReply {
    forward(&client, ApiActionKind::DeleteService, Some(id), Value::Null).await
}

async fn get_users(State(client): State<MasterClient>, Path(id): Path<String>) -> ApiReply {
    forward(&client, ApiActionKind::GetUsers, Some(id), Value::Null).await
}

async fn say(State(client): State<MasterClient>, Path(id): Path<String>, Json(body): Json<Value>) -> ApiReply {
    forward(&client, ApiActionKind::SendMessage, Some(id), body).await
}

async fn start_listen(State(client): State<MasterClient>, Path(id): Path<String>, Json(body): Json<Value>) -> ApiReply {
    forward(&client, ApiActionKind::StartListen, Some(id), body).await
}

async fn stop_listen(State(client): State<MasterClient>, Path(id): Path<String>, Json(body): Json<Value>) -> ApiReply {
    forward(&client, ApiActionKind::StopListen, Some(id), body).await
}

async fn get_callbacks(State(client): State<MasterClient>, Path(id): Path<String>) -> ApiReply {
    forward(&client, ApiActionKind::GetCallbacks, Some(id), Value::Null).await
}

/// Slack posts interactive callbacks as a form with a `payload` field.
#[derive(Debug, Deserialize)]
struct CallbackForm {
    payload: String,
}

async fn post_callback(State(client): State<MasterClient>, Form(form): Form<CallbackForm>) -> ApiReply {
    match serde_json::from_str::<Value>(&form.payload) {
        Ok(payload) => forward(&client, ApiActionKind::PostCallback, None, payload).await,
        Err(e) => ApiReply::from_result(Err(CallError::InvalidParams(format!("payload is not JSON: {e}")))),
    }
}

/// The web role: HTTP on `web.port`, every request forwarded to the master
/// over stdio. Exits when the master hangs up.
pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let (peer, _inbound) = Peer::connect("master", tokio::io::stdin(), tokio::io::stdout());
    let client = MasterClient::new(peer, hop_timeout(&settings));

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.web.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "web front door listening");

    let master = client.clone();
    axum::serve(listener, router(client))
        .with_graceful_shutdown(async move {
            master.closed().await;
            info!("master hung up; stopping the web front door");
        })
        .await?;
    Ok(())
}
