//! JSON-RPC 2.0 client over an agent's stdio streams.
//!
//! One [`RpcClient`] owns the duplex byte stream to a single agent process:
//! a writer task serialises outbound messages as NDJSON, and a single
//! background reader parses incoming lines and routes them:
//!
//! - responses are matched to pending request futures by numeric id,
//! - `session/update` notifications are forwarded to the update channel,
//! - agent-initiated requests are dispatched to registered handlers
//!   (unknown methods are answered with JSON-RPC `-32601`),
//! - anything else is logged and skipped.
//!
//! The permission prompt handler (`session/request_permission`) is
//! registered by the session layer; see
//! [`permission_handler`] for the auto-approval policy.
//!
//! # Failure semantics
//!
//! Reader exit — EOF, an oversized line, or a stdin write failure —
//! transitions the client to a terminal *closed* state: every pending
//! request fails with [`AppError::ConnectionClosed`] and later calls fail
//! fast. The client never reconnects; respawning is the session's concern.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::acp::codec::AcpCodec;
use crate::acp::protocol::{select_permission_option, PermissionRequest, SessionNotification};
use crate::{AppError, Result};

/// Outbound queue depth; senders briefly back-pressure when the agent's
/// stdin stalls.
const OUTBOUND_CAPACITY: usize = 64;

/// Async handler for one agent-initiated request method.
pub type RequestHandler =
    Box<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Registry of handlers for agent-initiated requests.
#[derive(Default)]
pub struct RequestHandlers {
    map: HashMap<String, RequestHandler>,
}

impl RequestHandlers {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `method`, replacing any previous registration.
    pub fn register(
        &mut self,
        method: impl Into<String>,
        handler: impl Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static,
    ) {
        self.map.insert(method.into(), Box::new(handler));
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

/// JSON-RPC 2.0 client bound to one agent subprocess.
pub struct RpcClient {
    label: String,
    outbound_tx: mpsc::Sender<Value>,
    pending: PendingMap,
    next_id: AtomicU64,
    closed: CancellationToken,
}

impl RpcClient {
    /// Start a client over the given byte streams.
    ///
    /// Spawns the writer and reader tasks; `update_tx` receives every
    /// `session/update` notification in arrival order.
    pub fn connect<R, W>(
        label: impl Into<String>,
        incoming: R,
        outgoing: W,
        handlers: RequestHandlers,
        update_tx: mpsc::Sender<SessionNotification>,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let label = label.into();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();

        tokio::spawn(run_writer(
            label.clone(),
            outgoing,
            outbound_rx,
            closed.clone(),
        ));
        tokio::spawn(run_reader(
            label.clone(),
            incoming,
            handlers,
            update_tx,
            outbound_tx.clone(),
            Arc::clone(&pending),
            closed.clone(),
        ));

        Self {
            label,
            outbound_tx,
            pending,
            next_id: AtomicU64::new(1),
            closed,
        }
    }

    /// Whether the connection reached its terminal closed state.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Force the connection into the closed state, stopping both tasks.
    pub fn shutdown(&self) {
        self.closed.cancel();
        fail_pending(&self.pending, &self.label);
    }

    /// Send a request and wait for the matching response.
    ///
    /// # Errors
    ///
    /// - [`AppError::Rpc`] when the agent answers with a JSON-RPC error.
    /// - [`AppError::ConnectionClosed`] when the connection dies before the
    ///   response arrives.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        if self.is_closed() {
            return Err(AppError::ConnectionClosed(format!(
                "{}: connection already closed",
                self.label
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        if let Ok(mut map) = self.pending.lock() {
            map.insert(id, reply_tx);
        }

        let msg = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        if self.outbound_tx.send(msg).await.is_err() {
            if let Ok(mut map) = self.pending.lock() {
                map.remove(&id);
            }
            return Err(AppError::ConnectionClosed(format!(
                "{}: writer gone before '{method}' was sent",
                self.label
            )));
        }

        match reply_rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(AppError::ConnectionClosed(format!(
                "{}: connection closed awaiting '{method}' response",
                self.label
            ))),
        }
    }

    /// Send a fire-and-forget notification.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ConnectionClosed`] when the writer is gone.
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let msg = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        self.outbound_tx.send(msg).await.map_err(|_| {
            AppError::ConnectionClosed(format!(
                "{}: writer gone before '{method}' notification",
                self.label
            ))
        })
    }
}

/// Build the auto-approval handler for `session/request_permission`.
///
/// Selects per [`select_permission_option`] and answers
/// `{outcome: {outcome: "selected", optionId: …}}`; a request carrying no
/// options at all is answered with `{outcome: {outcome: "cancelled"}}`.
#[must_use]
pub fn permission_handler(label: String) -> RequestHandler {
    Box::new(move |params: Value| {
        let label = label.clone();
        Box::pin(async move {
            let request: PermissionRequest = serde_json::from_value(params)
                .map_err(|err| AppError::Rpc(format!("bad permission request: {err}")))?;

            match select_permission_option(&request.options) {
                Some(option) => {
                    debug!(
                        client = label.as_str(),
                        option_id = option.option_id.as_str(),
                        kind = option.kind.as_str(),
                        "auto-approving permission request"
                    );
                    Ok(json!({
                        "outcome": { "outcome": "selected", "optionId": option.option_id }
                    }))
                }
                None => {
                    warn!(
                        client = label.as_str(),
                        "permission request offered no options; cancelling"
                    );
                    Ok(json!({ "outcome": { "outcome": "cancelled" } }))
                }
            }
        })
    })
}

// ── Background tasks ──────────────────────────────────────────────────────────

/// Writer task: serialise outbound messages as `\n`-terminated JSON lines.
async fn run_writer<W>(
    label: String,
    mut outgoing: W,
    mut outbound_rx: mpsc::Receiver<Value>,
    closed: CancellationToken,
) where
    W: AsyncWrite + Send + Unpin,
{
    loop {
        tokio::select! {
            biased;

            () = closed.cancelled() => {
                debug!(client = label.as_str(), "rpc writer: connection closed, stopping");
                break;
            }

            msg = outbound_rx.recv() => {
                let Some(value) = msg else {
                    debug!(client = label.as_str(), "rpc writer: queue closed, stopping");
                    break;
                };

                let mut bytes = match serde_json::to_vec(&value) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!(client = label.as_str(), %err, "rpc writer: serialisation failed");
                        continue;
                    }
                };
                bytes.push(b'\n');

                if let Err(err) = outgoing.write_all(&bytes).await {
                    warn!(client = label.as_str(), %err, "rpc writer: stdin write failed");
                    closed.cancel();
                    break;
                }
            }
        }
    }
}

/// Reader task: parse inbound lines and route responses, notifications and
/// agent-initiated requests.
async fn run_reader<R>(
    label: String,
    incoming: R,
    handlers: RequestHandlers,
    update_tx: mpsc::Sender<SessionNotification>,
    outbound_tx: mpsc::Sender<Value>,
    pending: PendingMap,
    closed: CancellationToken,
) where
    R: AsyncRead + Send + Unpin,
{
    let mut framed = FramedRead::new(incoming, AcpCodec::new());

    loop {
        tokio::select! {
            biased;

            () = closed.cancelled() => {
                debug!(client = label.as_str(), "rpc reader: connection closed, stopping");
                break;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!(client = label.as_str(), "rpc reader: EOF");
                        break;
                    }
                    Some(Err(err)) => {
                        // Oversized line or stream error — fatal per framing
                        // contract.
                        warn!(client = label.as_str(), %err, "rpc reader: fatal stream error");
                        break;
                    }
                    Some(Ok(line)) => {
                        dispatch_line(
                            &label,
                            &line,
                            &handlers,
                            &update_tx,
                            &outbound_tx,
                            &pending,
                        )
                        .await;
                    }
                }
            }
        }
    }

    closed.cancel();
    fail_pending(&pending, &label);
}

/// Route one inbound NDJSON line.
async fn dispatch_line(
    label: &str,
    line: &str,
    handlers: &RequestHandlers,
    update_tx: &mpsc::Sender<SessionNotification>,
    outbound_tx: &mpsc::Sender<Value>,
    pending: &PendingMap,
) {
    if line.trim().is_empty() {
        return;
    }

    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(err) => {
            warn!(client = label, %err, "rpc reader: malformed json, skipping line");
            return;
        }
    };

    match value.get("method").and_then(Value::as_str) {
        Some(method) => {
            let method = method.to_owned();
            let id = value.get("id").cloned().filter(|id| !id.is_null());
            let params = value.get("params").cloned().unwrap_or(Value::Null);

            match id {
                // Agent-initiated request.
                Some(id) => {
                    let response = match handlers.map.get(&method) {
                        Some(handler) => match handler(params).await {
                            Ok(result) => {
                                json!({ "jsonrpc": "2.0", "id": id, "result": result })
                            }
                            Err(err) => json!({
                                "jsonrpc": "2.0",
                                "id": id,
                                "error": { "code": -32603, "message": err.to_string() }
                            }),
                        },
                        None => {
                            debug!(client = label, method, "rpc reader: method not found");
                            json!({
                                "jsonrpc": "2.0",
                                "id": id,
                                "error": { "code": -32601, "message": "method not found" }
                            })
                        }
                    };
                    if outbound_tx.send(response).await.is_err() {
                        warn!(client = label, method, "rpc reader: writer gone, response dropped");
                    }
                }
                // Notification.
                None => {
                    if method == "session/update" {
                        match serde_json::from_value::<SessionNotification>(params) {
                            Ok(notification) => {
                                // Back-pressure propagates to the read loop so
                                // arrival order is preserved end to end.
                                if update_tx.send(notification).await.is_err() {
                                    debug!(
                                        client = label,
                                        "rpc reader: update channel closed, dropping"
                                    );
                                }
                            }
                            Err(err) => {
                                warn!(client = label, %err, "rpc reader: bad session/update");
                            }
                        }
                    } else {
                        debug!(client = label, method, "rpc reader: skipping notification");
                    }
                }
            }
        }
        // Response to one of our requests.
        None => {
            let Some(id) = value.get("id").and_then(Value::as_u64) else {
                warn!(client = label, "rpc reader: response without usable id, skipping");
                return;
            };

            let outcome = if let Some(error) = value.get("error") {
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
                Err(AppError::Rpc(format!("agent error {code}: {message}")))
            } else {
                Ok(value.get("result").cloned().unwrap_or(Value::Null))
            };

            let reply_tx = pending.lock().ok().and_then(|mut map| map.remove(&id));
            match reply_tx {
                Some(tx) => {
                    let _ = tx.send(outcome);
                }
                None => {
                    debug!(client = label, id, "rpc reader: response for unknown id");
                }
            }
        }
    }
}

/// Fail every pending request with [`AppError::ConnectionClosed`].
fn fail_pending(pending: &PendingMap, label: &str) {
    let drained: Vec<(u64, oneshot::Sender<Result<Value>>)> = match pending.lock() {
        Ok(mut map) => map.drain().collect(),
        Err(_) => return,
    };
    for (id, tx) in drained {
        let _ = tx.send(Err(AppError::ConnectionClosed(format!(
            "{label}: connection closed with request {id} in flight"
        ))));
    }
}
