//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The websocket endpoint pair
//!
//! Every tier and wrapper runs one [Server] (bound to an ephemeral
//! loopback port) and at most one upward [Client]. Downward messaging
//! (stop, get_tree fan-out) opens short-lived extra clients against the
//! child's registered address.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use futures::SinkExt;
use futures::StreamExt;
use log::debug;
use log::trace;
use log::warn;
use rand::Rng;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::message::Envelope;
use crate::protocol::message::Request;
use crate::protocol::message::Response;
use crate::protocol::message::salvage_req_id;

/// Something that services decoded requests
///
/// Implemented by the tier and the wrapper; both put every action through
/// the same dispatch, which is what makes the overlay protocol symmetric.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, action: &str, payload: serde_json::Value) -> Result<serde_json::Value>;
}

/// Handler for one-shot administrative clients that never expect inbound
/// requests
pub struct NullHandler;

#[async_trait::async_trait]
impl MessageHandler for NullHandler {
    async fn handle(&self, action: &str, _: serde_json::Value) -> Result<serde_json::Value> {
        Err(anyhow!("unsupported action: {action}"))
    }
}

/// Error marker for a failed upward connect, mapped to exit code 2 at the
/// binary boundary
#[derive(Debug)]
pub struct ConnectError {
    pub url: String,
    pub reason: String,
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to connect to {}: {}", self.url, self.reason)
    }
}

impl std::error::Error for ConnectError {}

/// Normalize a registered "host:port" address into a websocket URL
pub fn ws_url(addr: &str) -> String {
    if addr.starts_with("ws://") || addr.starts_with("wss://") {
        addr.to_string()
    } else {
        format!("ws://{addr}/")
    }
}

/// The websocket server half of an endpoint
pub struct Server {
    addr: SocketAddr,
    task: tokio::task::JoinHandle<()>,
}

impl Server {
    /// Bind an ephemeral loopback port and start accepting connections
    pub async fn bind(handler: Arc<dyn MessageHandler>) -> Result<Server> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .context("Binding websocket server")?;
        let addr = listener.local_addr().context("Reading bound address")?;
        debug!("Websocket server listening on {addr}");

        let task = tokio::spawn(accept_loop(listener, handler));
        Ok(Server { addr, task })
    }

    /// The "host:port" form that goes into a `register` payload
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn url(&self) -> String {
        format!("ws://{}/", self.addr)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(listener: TcpListener, handler: Arc<dyn MessageHandler>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                trace!("Accepted connection from {peer}");
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, handler).await {
                        debug!("Connection from {peer} ended: {e:#}");
                    }
                });
            }
            Err(e) => {
                warn!("Accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, handler: Arc<dyn MessageHandler>) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .context("Websocket handshake")?;
    let (mut sink, mut source) = ws.split();

    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                // Frames on one connection are serviced in send order.
                if let Some(response) = decode_and_dispatch(&text, handler.as_ref()).await {
                    let encoded = Envelope::Response(response).encode()?;
                    sink.send(Message::Text(encoded)).await?;
                }
            }
            Ok(Message::Ping(data)) => sink.send(Message::Pong(data)).await?,
            Ok(Message::Close(_)) => break,
            Ok(_) => (),
            Err(e) => return Err(e).context("Reading websocket frame"),
        }
    }

    Ok(())
}

/// Decode one inbound frame and run it through the handler
///
/// Returns the response to send back, if any. A malformed envelope or a
/// failed action yields an error response even for posted requests; a
/// successful posted request yields none.
async fn decode_and_dispatch(text: &str, handler: &dyn MessageHandler) -> Option<Response> {
    match Envelope::decode(text) {
        Ok(Envelope::Request(req)) => dispatch(req, handler).await,
        Ok(Envelope::Response(r)) => {
            warn!("Unexpected response frame on inbound connection: {r:?}");
            None
        }
        Err(e) => Some(Response::error(salvage_req_id(text), format!("{e:#}"))),
    }
}

async fn dispatch(req: Request, handler: &dyn MessageHandler) -> Option<Response> {
    trace!("Servicing action '{}' (req_id {})", req.action, req.req_id);
    match handler.handle(&req.action, req.payload).await {
        Ok(_) if req.posted => None,
        Ok(payload) => Some(Response::success(&req.action, req.req_id, payload)),
        Err(e) => {
            warn!("Action '{}' failed: {e:#}", req.action);
            Some(Response::error(req.req_id, format!("{e:#}")))
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

/// The websocket client half of an endpoint
///
/// Supports multiple outstanding non-posted requests; responses are
/// correlated by `rsp_id` and may arrive in any order. Inbound requests on
/// the same connection are fed through the given handler, so a parent can
/// push actions down the already-open upward link.
#[derive(Clone, Debug)]
pub struct Client {
    url: String,
    tx: UnboundedSender<Message>,
    pending: PendingMap,
    next_id: Arc<AtomicU64>,
}

impl Client {
    pub async fn connect(url: &str, handler: Arc<dyn MessageHandler>) -> Result<Client> {
        let (ws, _) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
            anyhow::Error::new(ConnectError {
                url: url.to_string(),
                reason: e.to_string(),
            })
        })?;
        debug!("Connected to {url}");

        let (mut sink, mut source) = ws.split();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    debug!("Websocket send failed: {e}");
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        let reader_tx = tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        route_inbound(&text, &reader_pending, &reader_tx, handler.as_ref()).await
                    }
                    Ok(Message::Ping(data)) => {
                        let _ = reader_tx.send(Message::Pong(data));
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => (),
                    Err(e) => {
                        debug!("Websocket read failed: {e}");
                        break;
                    }
                }
            }

            // Connection gone, fail everything still waiting.
            reader_pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
        });

        Ok(Client {
            url: url.to_string(),
            tx,
            pending,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Connect with bounded exponential backoff: 0.5 s doubling up to a
    /// 5 s cap plus jitter, `attempts` tries total
    pub async fn connect_with_backoff(
        url: &str,
        handler: Arc<dyn MessageHandler>,
        attempts: usize,
    ) -> Result<Client> {
        let mut delay = Duration::from_millis(500);
        let cap = Duration::from_secs(5);
        let mut last = None;

        for attempt in 1..=attempts {
            match Client::connect(url, handler.clone()).await {
                Ok(client) => return Ok(client),
                Err(e) => {
                    debug!("Connect attempt {attempt}/{attempts} to {url} failed: {e:#}");
                    last = Some(e);
                }
            }

            if attempt < attempts {
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
                tokio::time::sleep(delay + jitter).await;
                delay = std::cmp::min(delay * 2, cap);
            }
        }

        Err(last.unwrap_or_else(|| {
            anyhow::Error::new(ConnectError {
                url: url.to_string(),
                reason: String::from("no attempts made"),
            })
        }))
    }

    fn begin_request(
        &self,
        action: &str,
        payload: serde_json::Value,
    ) -> Result<(u64, oneshot::Receiver<Response>)> {
        let req_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(req_id, reply_tx);

        let frame = Envelope::Request(Request {
            action: action.to_string(),
            req_id,
            posted: false,
            payload,
        })
        .encode()?;

        self.tx.send(Message::Text(frame)).map_err(|_| {
            self.forget(req_id);
            anyhow!("connection to {} is closed", self.url)
        })?;

        Ok((req_id, reply_rx))
    }

    fn forget(&self, req_id: u64) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&req_id);
    }

    /// Send a non-posted request and await its response
    pub async fn request(
        &self,
        action: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let (_, reply_rx) = self.begin_request(action, payload)?;
        await_reply(action, reply_rx, &self.url).await
    }

    /// [Client::request] with a deadline; the pending slot is cleaned up on
    /// timeout
    pub async fn request_timeout(
        &self,
        action: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let (req_id, reply_rx) = self.begin_request(action, payload)?;
        match tokio::time::timeout(timeout, await_reply(action, reply_rx, &self.url)).await {
            Ok(result) => result,
            Err(_) => {
                self.forget(req_id);
                Err(anyhow!("no response for '{action}' within {timeout:?}"))
            }
        }
    }

    /// Fire a posted request; no response will arrive on success
    pub fn post(&self, action: &str, payload: serde_json::Value) -> Result<()> {
        let req_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = Envelope::Request(Request {
            action: action.to_string(),
            req_id,
            posted: true,
            payload,
        })
        .encode()?;

        self.tx
            .send(Message::Text(frame))
            .map_err(|_| anyhow!("connection to {} is closed", self.url))
    }
}

async fn await_reply(
    action: &str,
    reply_rx: oneshot::Receiver<Response>,
    url: &str,
) -> Result<serde_json::Value> {
    match reply_rx.await {
        Ok(Response::Success { payload, .. }) => Ok(payload),
        Ok(Response::Error { reason, .. }) => Err(anyhow!("peer rejected '{action}': {reason}")),
        Err(_) => Err(anyhow!("connection to {url} closed while waiting")),
    }
}

async fn route_inbound(
    text: &str,
    pending: &PendingMap,
    tx: &UnboundedSender<Message>,
    handler: &dyn MessageHandler,
) {
    match Envelope::decode(text) {
        Ok(Envelope::Response(response)) => {
            let waiter = pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&response.rsp_id());
            match waiter {
                Some(reply) => {
                    let _ = reply.send(response);
                }
                None => debug!("Dropping uncorrelated response: {response:?}"),
            }
        }
        Ok(Envelope::Request(req)) => {
            // The peer pushes an action down the upward connection.
            if let Some(response) = dispatch(req, handler).await {
                if let Ok(encoded) = Envelope::Response(response).encode() {
                    let _ = tx.send(Message::Text(encoded));
                }
            }
        }
        Err(e) => {
            warn!("Undecodable inbound frame: {e:#}");
            if let Ok(encoded) =
                Envelope::Response(Response::error(salvage_req_id(text), format!("{e:#}"))).encode()
            {
                let _ = tx.send(Message::Text(encoded));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    struct EchoHandler {
        posted_seen: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl MessageHandler for EchoHandler {
        async fn handle(
            &self,
            action: &str,
            payload: serde_json::Value,
        ) -> Result<serde_json::Value> {
            match action {
                "echo" => Ok(payload),
                "note" => {
                    self.posted_seen.fetch_add(1, Ordering::SeqCst);
                    Ok(serde_json::Value::Null)
                }
                other => Err(anyhow!("unknown action: {other}")),
            }
        }
    }

    fn echo_handler() -> Arc<EchoHandler> {
        Arc::new(EchoHandler {
            posted_seen: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let server = Server::bind(echo_handler()).await.unwrap();
        let client = Client::connect(&server.url(), Arc::new(NullHandler))
            .await
            .unwrap();

        let reply = client
            .request("echo", serde_json::json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(reply, serde_json::json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_unknown_action_yields_error_response() {
        let server = Server::bind(echo_handler()).await.unwrap();
        let client = Client::connect(&server.url(), Arc::new(NullHandler))
            .await
            .unwrap();

        let err = client
            .request("frobnicate", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown action"));
    }

    #[tokio::test]
    async fn test_posted_request_gets_no_response_but_is_serviced() {
        let handler = echo_handler();
        let server = Server::bind(handler.clone()).await.unwrap();
        let client = Client::connect(&server.url(), Arc::new(NullHandler))
            .await
            .unwrap();

        client.post("note", serde_json::Value::Null).unwrap();

        // A follow-up request acts as a barrier: frames are serviced in
        // send order on one connection.
        client
            .request("echo", serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(handler.posted_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_frame_elicits_error_and_connection_survives() {
        let server = Server::bind(echo_handler()).await.unwrap();

        let (ws, _) = tokio_tungstenite::connect_async(server.url()).await.unwrap();
        let (mut sink, mut source) = ws.split();

        sink.send(Message::Text(String::from("{broken"))).await.unwrap();
        let frame = source.next().await.unwrap().unwrap();
        match frame {
            Message::Text(text) => match Envelope::decode(&text).unwrap() {
                Envelope::Response(Response::Error { rsp_id, .. }) => assert_eq!(rsp_id, 0),
                other => panic!("Expected error response, got {other:?}"),
            },
            other => panic!("Expected text frame, got {other:?}"),
        }

        // Same connection still serves well-formed traffic.
        let good = Envelope::Request(Request {
            action: String::from("echo"),
            req_id: 5,
            posted: false,
            payload: serde_json::json!("hi"),
        })
        .encode()
        .unwrap();
        sink.send(Message::Text(good)).await.unwrap();

        match source.next().await.unwrap().unwrap() {
            Message::Text(text) => match Envelope::decode(&text).unwrap() {
                Envelope::Response(Response::Success { rsp_id, payload, .. }) => {
                    assert_eq!(rsp_id, 5);
                    assert_eq!(payload, serde_json::json!("hi"));
                }
                other => panic!("Expected success response, got {other:?}"),
            },
            other => panic!("Expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_refused_is_a_connect_error() {
        let err = Client::connect("ws://127.0.0.1:9/", Arc::new(NullHandler))
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<ConnectError>().is_some());
    }
}
