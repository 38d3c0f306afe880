//! Command loop of a service worker.
//!
//! Wires JSON‑RPC traffic on stdin/stdout (or any reader/writer pair) to a
//! [`ServiceHandler`]:
//! * announces itself with a `ready` notification once attached
//! * decodes every call into a typed [`ServiceCommand`]
//! * rejects commands the current state does not allow with *not ready*
//! * runs each command on its own task, so `query-info` is answered while a
//!   slow `open` is still in progress
//!
//! Nothing in a worker may log to stdout; it carries the protocol.

use std::future::Future;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::error::{CallError, ServiceError};
use crate::jsonrpc::{self, Request, Response};
use crate::message::*;
use crate::peer::Peer;

#[async_trait]
pub trait ServiceHandler: Send + Sync + Clone + 'static {
    fn state(&self) -> ServiceState;

    /// Answer to `query-info`.
    async fn info(&self, service_id: &str) -> Result<ServiceInfo, ServiceError> {
        Ok(ServiceInfo { id: service_id.to_owned(), state: self.state() })
    }

    async fn open(&self, service_id: &str, options: OpenOptions) -> Result<(), ServiceError>;
    async fn query_users(&self) -> Result<UserDirectory, ServiceError>;
    async fn send_message(&self, params: SendMessageParams) -> Result<(), ServiceError>;
    async fn start_listen(&self, request: ListenRequest) -> Result<ListenStarted, ServiceError>;
    async fn stop_listen(&self, request: StopListen) -> Result<(), ServiceError>;
    async fn callbacks(&self) -> Result<Vec<CallbackRecord>, ServiceError>;
    async fn post_callback(&self, event: CallbackEvent) -> Result<(), ServiceError>;

    /// Called once the command loop ends.
    async fn close(&self) {}
}

/// Runs the command loop on stdin/stdout until EOF.
pub async fn run<H: ServiceHandler>(handler: H) -> anyhow::Result<()> {
    serve(handler, tokio::io::stdin(), tokio::io::stdout()).await?;
    Ok(())
}

/// Runs the command loop over `reader`/`writer` until the other side hangs up.
pub async fn serve<H, R, W>(handler: H, reader: R, writer: W) -> Result<(), CallError>
where
    H: ServiceHandler,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    serve_until(handler, reader, writer, std::future::pending()).await
}

/// Like [`serve`], but also stops when `shutdown` resolves, tearing the
/// channel down as if the process had died.
pub async fn serve_until<H, R, W, S>(handler: H, reader: R, writer: W, shutdown: S) -> Result<(), CallError>
where
    H: ServiceHandler,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    S: Future<Output = ()> + Send,
{
    let (peer, mut inbound) = Peer::connect("master", reader, writer);
    peer.notify(Method::Ready, None)?;

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            req = inbound.recv() => match req {
                Some(req) => {
                    let handler = handler.clone();
                    let peer = peer.clone();
                    tokio::spawn(async move { handle_request(&handler, &peer, req).await });
                }
                None => {
                    info!("master hung up; leaving command loop");
                    break;
                }
            },
            _ = &mut shutdown => {
                info!("shutdown requested; leaving command loop");
                peer.shutdown();
                break;
            }
        }
    }

    handler.close().await;
    Ok(())
}

async fn handle_request<H: ServiceHandler>(handler: &H, peer: &Peer, req: Request) {
    let Some(id) = req.id.clone() else {
        debug!(method = %req.method, "ignoring notification");
        return;
    };
    let method = req.method.clone();
    let response = match dispatch(handler, req).await {
        Ok(body) => Response::success(id, body),
        Err(err) => {
            debug!(%method, code = err.code, error = %err.message, "command failed");
            Response::from_error(id, err)
        }
    };
    if let Err(e) = peer.respond(response) {
        warn!(%method, error = %e, "could not send reply");
    }
}

/// Decode, gate on state and execute one call.
pub async fn dispatch<H: ServiceHandler>(handler: &H, req: Request) -> Result<Value, jsonrpc::Error> {
    let method: Method = req
        .method
        .parse()
        .map_err(|_| CallError::MethodNotFound(req.method.clone()).into_rpc_error())?;
    let params: ServiceParams = serde_json::from_value(req.params.unwrap_or(Value::Null))
        .map_err(|e| CallError::InvalidParams(e.to_string()).into_rpc_error())?;
    let command = ServiceCommand::decode(method, params.payload).map_err(CallError::into_rpc_error)?;

    let state = handler.state();
    if !command.allowed_in(state) {
        return Err(ServiceError::NotReady(state).into_rpc_error());
    }

    execute(handler, &params.service_id, command)
        .await
        .map_err(ServiceError::into_rpc_error)
}

async fn execute<H: ServiceHandler>(
    handler: &H,
    service_id: &str,
    command: ServiceCommand,
) -> Result<Value, ServiceError> {
    match command {
        ServiceCommand::Open(options) => {
            handler.open(service_id, options).await?;
            body(handler.info(service_id).await?)
        }
        ServiceCommand::QueryInfo => body(handler.info(service_id).await?),
        ServiceCommand::QueryUsers => body(handler.query_users().await?),
        ServiceCommand::SendMessage(params) => {
            handler.send_message(params).await?;
            Ok(Value::Null)
        }
        ServiceCommand::StartListen(request) => body(handler.start_listen(request).await?),
        ServiceCommand::StopListen(request) => {
            handler.stop_listen(request.clone()).await?;
            body(request)
        }
        ServiceCommand::GetCallbacks => body(handler.callbacks().await?),
        ServiceCommand::PostCallback(event) => {
            handler.post_callback(event).await?;
            Ok(Value::Null)
        }
    }
}

fn body<T: Serialize>(value: T) -> Result<Value, ServiceError> {
    serde_json::to_value(value).map_err(ServiceError::failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::{Id, codes};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{Mutex, Notify};

    #[derive(Clone, Default)]
    struct Recorder {
        state: Arc<Mutex<ServiceState>>,
        sent: Arc<Mutex<Vec<SendMessageParams>>>,
        open_gate: Arc<Notify>,
    }

    #[async_trait]
    impl ServiceHandler for Recorder {
        fn state(&self) -> ServiceState {
            self.state.try_lock().map(|s| *s).unwrap_or(ServiceState::Opening)
        }
        async fn open(&self, _service_id: &str, _options: OpenOptions) -> Result<(), ServiceError> {
            *self.state.lock().await = ServiceState::Opening;
            self.open_gate.notified().await;
            *self.state.lock().await = ServiceState::Open;
            Ok(())
        }
        async fn query_users(&self) -> Result<UserDirectory, ServiceError> {
            Ok(UserDirectory::new())
        }
        async fn send_message(&self, params: SendMessageParams) -> Result<(), ServiceError> {
            self.sent.lock().await.push(params);
            Ok(())
        }
        async fn start_listen(&self, _request: ListenRequest) -> Result<ListenStarted, ServiceError> {
            Ok(ListenStarted { listen_id: "l1".into() })
        }
        async fn stop_listen(&self, _request: StopListen) -> Result<(), ServiceError> {
            Ok(())
        }
        async fn callbacks(&self) -> Result<Vec<CallbackRecord>, ServiceError> {
            Ok(vec![])
        }
        async fn post_callback(&self, _event: CallbackEvent) -> Result<(), ServiceError> {
            Err(ServiceError::failed("storage unreachable"))
        }
    }

    fn call(method: &str, payload: Value) -> Request {
        Request::call(Id::Number(1), method, Some(json!({"service_id": "svc1", "payload": payload})))
    }

    fn options() -> Value {
        json!({"host": "h", "token": "t", "cell": "c", "username": "u", "password": "p", "path": "cb"})
    }

    #[tokio::test]
    async fn data_plane_is_refused_before_open() {
        let handler = Recorder::default();
        let err = dispatch(&handler, call("send-message", json!({"text": "hi"}))).await.unwrap_err();
        assert_eq!(err.code, codes::NOT_READY);
        assert_eq!(err.data, Some(json!({"state": "unopened"})));
        assert!(handler.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn query_info_works_in_any_state() {
        let handler = Recorder::default();
        let info = dispatch(&handler, call("query-info", Value::Null)).await.unwrap();
        assert_eq!(info, json!({"id": "svc1", "state": "unopened"}));
    }

    #[tokio::test]
    async fn unknown_method_and_bad_params() {
        let handler = Recorder::default();
        let err = dispatch(&handler, call("slack-say", Value::Null)).await.unwrap_err();
        assert_eq!(err.code, codes::METHOD_NOT_FOUND);

        let err = dispatch(&handler, Request::call(Id::Number(2), "query-info", None)).await.unwrap_err();
        assert_eq!(err.code, codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn handler_failure_becomes_remote_failure() {
        let handler = Recorder::default();
        *handler.state.lock().await = ServiceState::Open;
        let err = dispatch(&handler, call("post-callback", json!({"callback_id": "svc1"}))).await.unwrap_err();
        assert_eq!(err.code, codes::REMOTE_FAILURE);
        assert_eq!(err.message, "storage unreachable");
    }

    #[tokio::test]
    async fn loop_sends_ready_then_answers_while_open_is_in_flight() {
        let handler = Recorder::default();
        let (ours, theirs) = tokio::io::duplex(16 * 1024);
        let (their_read, their_write) = tokio::io::split(theirs);
        tokio::spawn(serve(handler.clone(), their_read, their_write));

        let (our_read, our_write) = tokio::io::split(ours);
        let (peer, mut inbound) = Peer::connect("svc1", our_read, our_write);
        let ready = inbound.recv().await.unwrap();
        assert_eq!(ready.method, "ready");
        assert!(ready.id.is_none());

        let t = Duration::from_secs(2);
        let params = json!({"service_id": "svc1", "payload": options()});
        let open = tokio::spawn({
            let peer = peer.clone();
            async move { peer.call(Method::Open, Some(params), t).await }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        let info = peer
            .call(Method::QueryInfo, Some(json!({"service_id": "svc1"})), t)
            .await
            .unwrap();
        assert_eq!(info["state"], json!("opening"));

        handler.open_gate.notify_one();
        let opened = open.await.unwrap().unwrap();
        assert_eq!(opened["state"], json!("open"));
    }
}
