//! One end of a line-delimited JSON‑RPC channel with correlated calls.
//!
//! A `Peer` owns a writer task (outbound lines, in send order) and a reader
//! task that routes replies to the pending call with the same id and hands
//! every request or notification to the inbound queue. Once the reader sees
//! EOF all pending calls fail with [`CallError::WorkerGone`].

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::{oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::CallError;
use crate::jsonrpc::{Id, Message, Request, Response, codes};

type Inflight = DashMap<String, oneshot::Sender<Response>>;

#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    label: String,
    out_tx: UnboundedSender<String>,
    next_id: AtomicI64,
    shared: Arc<Shared>,
    reader: AbortHandle,
    writer: AbortHandle,
}

/// State the reader task needs; kept apart from `out_tx` so dropping every
/// `Peer` closes the outbound stream.
struct Shared {
    label: String,
    inflight: Inflight,
    closed: watch::Sender<bool>,
}

impl Shared {
    fn settle(&self, rsp: Response) {
        match self.inflight.remove(&rsp.id.key()) {
            Some((_, tx)) => {
                let _ = tx.send(rsp);
            }
            None => debug!(peer = %self.label, id = %rsp.id, "dropping late or unmatched reply"),
        }
    }

    fn close(&self) {
        self.closed.send_replace(true);
        let pending = self.inflight.len();
        // dropping the senders rejects every waiting call
        self.inflight.clear();
        if pending > 0 {
            warn!(peer = %self.label, pending, "channel closed with calls in flight");
        }
    }
}

/// Removes a pending entry however the call ends.
struct PendingGuard<'a> {
    inflight: &'a Inflight,
    key: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inflight.remove(&self.key);
    }
}

impl Peer {
    /// Wire a peer over `reader`/`writer`. Returns the peer and the queue of
    /// requests and notifications sent by the other side.
    pub fn connect<R, W>(label: impl Into<String>, reader: R, writer: W) -> (Self, UnboundedReceiver<Request>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let label = label.into();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Request>();
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            label: label.clone(),
            inflight: DashMap::new(),
            closed,
        });

        let writer = tokio::spawn(write_loop(label.clone(), writer, out_rx)).abort_handle();
        let reader = tokio::spawn(read_loop(
            reader,
            Arc::clone(&shared),
            in_tx,
            out_tx.downgrade(),
        ))
        .abort_handle();

        let inner = PeerInner {
            label,
            out_tx,
            next_id: AtomicI64::new(1),
            shared,
            reader,
            writer,
        };
        (Self { inner: Arc::new(inner) }, in_rx)
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Issue a call and wait for its reply, at most `timeout`.
    ///
    /// Settles exactly once: a reply removes the pending entry before it is
    /// delivered, and a timeout removes it so a late reply is dropped.
    pub async fn call(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let method = method.into();
        let id = Id::Number(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();

        let inflight = &self.inner.shared.inflight;
        let guard = PendingGuard { inflight, key: id.key() };
        inflight.insert(guard.key.clone(), tx);

        // checked after registering so a concurrent close cannot be missed
        if self.is_closed() {
            return Err(self.gone());
        }

        let line = encode(&Request::call(id, method.clone(), params))?;
        if self.inner.out_tx.send(line).is_err() {
            return Err(self.gone());
        }

        let outcome = tokio::time::timeout(timeout, rx).await;
        drop(guard);
        match outcome {
            Ok(Ok(rsp)) => rsp.into_result().map_err(CallError::Remote),
            Ok(Err(_)) => Err(self.gone()),
            Err(_) => {
                debug!(peer = %self.inner.label, %method, ?timeout, "call timed out");
                Err(CallError::Timeout { method, timeout })
            }
        }
    }

    /// Fire-and-forget notification.
    pub fn notify(&self, method: impl Into<String>, params: Option<Value>) -> Result<(), CallError> {
        self.send_line(encode(&Request::notification(method, params))?)
    }

    pub fn respond(&self, response: Response) -> Result<(), CallError> {
        self.send_line(encode(&response)?)
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.shared.closed.borrow()
    }

    /// Resolves once the other side has gone away.
    pub async fn closed(&self) {
        let mut rx = self.inner.shared.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Number of calls still waiting for a reply.
    pub fn pending(&self) -> usize {
        self.inner.shared.inflight.len()
    }

    /// Stop both I/O tasks and fail everything still pending.
    pub fn shutdown(&self) {
        self.inner.reader.abort();
        self.inner.writer.abort();
        self.inner.shared.close();
    }

    fn send_line(&self, line: String) -> Result<(), CallError> {
        if self.is_closed() {
            return Err(self.gone());
        }
        self.inner.out_tx.send(line).map_err(|_| self.gone())
    }

    fn gone(&self) -> CallError {
        CallError::WorkerGone(self.inner.label.clone())
    }
}

fn encode<T: serde::Serialize>(msg: &T) -> Result<String, CallError> {
    let mut line = serde_json::to_string(msg).map_err(|e| CallError::Codec(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

async fn write_loop<W>(label: String, writer: W, mut out_rx: UnboundedReceiver<String>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut w = BufWriter::new(writer);
    while let Some(line) = out_rx.recv().await {
        if let Err(e) = w.write_all(line.as_bytes()).await {
            warn!(peer = %label, error = %e, "write failed");
            break;
        }
        if let Err(e) = w.flush().await {
            warn!(peer = %label, error = %e, "flush failed");
            break;
        }
    }
    let _ = w.shutdown().await;
}

async fn read_loop<R>(
    reader: R,
    shared: Arc<Shared>,
    in_tx: UnboundedSender<Request>,
    out_tx: WeakUnboundedSender<String>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Message>(line) {
                    Ok(Message::Response(rsp)) => shared.settle(rsp),
                    Ok(Message::Request(req)) => {
                        if in_tx.send(req).is_err() {
                            debug!(peer = %shared.label, "inbound queue gone; dropping request");
                        }
                    }
                    Err(e) => {
                        warn!(peer = %shared.label, error = %e, "unparsable line");
                        let err = Response::fail(Id::Null, codes::PARSE_ERROR, "Parse error", Some(json!(e.to_string())));
                        if let (Some(tx), Ok(line)) = (out_tx.upgrade(), encode(&err)) {
                            let _ = tx.send(line);
                        }
                    }
                }
            }
            Ok(None) => {
                debug!(peer = %shared.label, "channel reached EOF");
                break;
            }
            Err(e) => {
                warn!(peer = %shared.label, error = %e, "read failed");
                break;
            }
        }
    }
    shared.close();
}
