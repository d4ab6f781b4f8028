//! The frame-level connection consumed by the pusher and puller.
//!
//! A [`Connection`] multiplexes numbered request/response pairs over any
//! transport that can carry [`Frame`]s. Outbound requests get an awaitable
//! response with a deadline; inbound requests surface on a channel, each
//! bundled with a one-shot responder. A driver task owns the transport and
//! fails every pending request when the transport dies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use madrona::error::network;
use madrona::{Error, Result};

use crate::protocol::{
    self, Frame, FrameCodec, Goodbye, Profile, Request, Response, ResponseResult,
};

const OUT_QUEUE_CAP: usize = 64;
const IN_QUEUE_CAP: usize = 64;

/// Connection tuning knobs.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Deadline for a response to an outbound request.
    pub request_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            request_timeout: Duration::from_secs(15),
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<ResponseData>>>>>;

/// A successful response to an outbound request.
#[derive(Debug, Clone, Default)]
pub struct ResponseData {
    pub body: Bytes,
    pub payload: Bytes,
    pub compressed: bool,
}

impl ResponseData {
    pub fn decode_body<T: DeserializeOwned>(&self) -> Result<T> {
        protocol::decode_body(&self.body)
    }
}

/// Shared handle to one replication connection.
#[derive(Debug, Clone)]
pub struct Connection {
    out_tx: mpsc::Sender<Frame>,
    pending: PendingMap,
    next_num: Arc<AtomicU64>,
    options: ConnectionOptions,
}

impl Connection {
    /// Runs a connection over a byte stream using the length-prefixed frame
    /// codec. Returns the handle plus the channel of inbound requests.
    pub fn over_stream<T>(io: T, options: ConnectionOptions) -> (Connection, mpsc::Receiver<InboundRequest>)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::spawn(Framed::new(io, FrameCodec), options)
    }

    /// An in-process pair of connected endpoints, used by tests and
    /// loopback replication.
    pub fn pair(options: ConnectionOptions) -> (
        (Connection, mpsc::Receiver<InboundRequest>),
        (Connection, mpsc::Receiver<InboundRequest>),
    ) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        (
            Self::over_stream(a, options.clone()),
            Self::over_stream(b, options),
        )
    }

    /// Runs a connection over any framed transport.
    pub fn spawn<T>(transport: T, options: ConnectionOptions) -> (Connection, mpsc::Receiver<InboundRequest>)
    where
        T: Stream<Item = Result<Frame>> + Sink<Frame, Error = Error> + Send + Unpin + 'static,
    {
        let (out_tx, out_rx) = mpsc::channel(OUT_QUEUE_CAP);
        let (in_tx, in_rx) = mpsc::channel(IN_QUEUE_CAP);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let conn = Connection {
            out_tx: out_tx.clone(),
            pending: pending.clone(),
            next_num: Arc::new(AtomicU64::new(1)),
            options,
        };

        tokio::spawn(drive(transport, out_tx, out_rx, in_tx, pending));
        (conn, in_rx)
    }

    /// Sends a request and awaits the peer's response.
    pub async fn send_request(
        &self,
        profile: Profile,
        body: Bytes,
        payload: Bytes,
        compressed: bool,
    ) -> Result<ResponseData> {
        let num = self.next_num.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending lock").insert(num, tx);

        let frame = Frame::Request(Request {
            num,
            profile,
            body,
            payload,
            compressed,
        });
        if self.out_tx.send(frame).await.is_err() {
            self.pending.lock().expect("pending lock").remove(&num);
            return Err(Error::network(
                network::CONNECTION_RESET,
                "connection closed",
            ));
        }

        match tokio::time::timeout(self.options.request_timeout, rx).await {
            Err(_) => {
                self.pending.lock().expect("pending lock").remove(&num);
                Err(Error::network(
                    network::TIMEOUT,
                    format!("no response to {profile} request within deadline"),
                ))
            }
            Ok(Err(_)) => Err(Error::network(
                network::CONNECTION_RESET,
                "connection closed",
            )),
            Ok(Ok(result)) => result,
        }
    }

    /// Sends a request whose body is the JSON encoding of `message`.
    pub async fn request<T: Serialize>(&self, profile: Profile, message: &T) -> Result<ResponseData> {
        let body = protocol::encode_body(message)?;
        self.send_request(profile, body, Bytes::new(), false).await
    }

    /// Sends the close frame. Any responses still pending will fail when
    /// the driver shuts down.
    pub async fn close(&self, goodbye: Goodbye) {
        let _ = self.out_tx.send(Frame::Close(goodbye)).await;
    }
}

/// A request received from the peer, with its one-shot responder.
#[derive(Debug)]
pub struct InboundRequest {
    pub profile: Profile,
    pub body: Bytes,
    pub payload: Bytes,
    pub compressed: bool,
    num: u64,
    out_tx: mpsc::Sender<Frame>,
}

impl InboundRequest {
    pub fn decode_body<T: DeserializeOwned>(&self) -> Result<T> {
        protocol::decode_body(&self.body)
    }

    pub async fn respond_ok(self, body: Bytes, payload: Bytes, compressed: bool) {
        self.respond(ResponseResult::Ok {
            body,
            payload,
            compressed,
        })
        .await;
    }

    pub async fn respond_json<T: Serialize>(self, message: &T) -> Result<()> {
        let body = protocol::encode_body(message)?;
        self.respond_ok(body, Bytes::new(), false).await;
        Ok(())
    }

    pub async fn respond_empty(self) {
        self.respond_ok(Bytes::new(), Bytes::new(), false).await;
    }

    pub async fn respond_err(self, error: Error) {
        self.respond(ResponseResult::Err(error)).await;
    }

    async fn respond(self, result: ResponseResult) {
        let frame = Frame::Response(Response {
            num: self.num,
            result,
        });
        if self.out_tx.send(frame).await.is_err() {
            trace!(num = self.num, "response dropped: connection closed");
        }
    }
}

async fn drive<T>(
    mut transport: T,
    out_tx: mpsc::Sender<Frame>,
    mut out_rx: mpsc::Receiver<Frame>,
    in_tx: mpsc::Sender<InboundRequest>,
    pending: PendingMap,
) where
    T: Stream<Item = Result<Frame>> + Sink<Frame, Error = Error> + Send + Unpin + 'static,
{
    let mut shutdown: Option<Error> = None;
    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                let Some(frame) = outbound else { break };
                let closing = matches!(frame, Frame::Close(_));
                if let Err(err) = transport.send(frame).await {
                    warn!(%err, "transport send failed");
                    shutdown = Some(err);
                    break;
                }
                if closing {
                    debug!("sent close frame");
                    break;
                }
            }
            inbound = transport.next() => {
                match inbound {
                    Some(Ok(Frame::Request(request))) => {
                        let inbound = InboundRequest {
                            profile: request.profile,
                            body: request.body,
                            payload: request.payload,
                            compressed: request.compressed,
                            num: request.num,
                            out_tx: out_tx.clone(),
                        };
                        if in_tx.send(inbound).await.is_err() {
                            trace!("inbound request dropped: handler gone");
                        }
                    }
                    Some(Ok(Frame::Response(response))) => {
                        let waiter = pending.lock().expect("pending lock").remove(&response.num);
                        match waiter {
                            Some(tx) => {
                                let result = match response.result {
                                    ResponseResult::Ok { body, payload, compressed } => {
                                        Ok(ResponseData { body, payload, compressed })
                                    }
                                    ResponseResult::Err(err) => Err(err),
                                };
                                let _ = tx.send(result);
                            }
                            None => warn!(num = response.num, "response to unknown request"),
                        }
                    }
                    Some(Ok(Frame::Close(goodbye))) => {
                        debug!(status = goodbye.status, reason = %goodbye.reason, "peer closed");
                        break;
                    }
                    Some(Err(err)) => {
                        warn!(%err, "transport receive failed");
                        shutdown = Some(err);
                        break;
                    }
                    None => {
                        debug!("transport ended");
                        break;
                    }
                }
            }
        }
    }

    let error = shutdown.unwrap_or_else(|| {
        Error::network(network::CONNECTION_RESET, "connection closed")
    });
    let waiters: Vec<_> = pending
        .lock()
        .expect("pending lock")
        .drain()
        .map(|(_, tx)| tx)
        .collect();
    for tx in waiters {
        let _ = tx.send(Err(error.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ConnectionOptions {
        ConnectionOptions {
            request_timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn request_response_round_trip() {
        let ((alice, _alice_in), (_bob, mut bob_in)) = Connection::pair(options());

        let server = tokio::spawn(async move {
            let req = bob_in.recv().await.unwrap();
            assert_eq!(req.profile, Profile::SubChanges);
            let msg: crate::protocol::SubChanges = req.decode_body().unwrap();
            assert_eq!(msg.since, 42);
            req.respond_json(&serde_json::json!({"ok": true})).await.unwrap();
        });

        let response = alice
            .request(
                Profile::SubChanges,
                &crate::protocol::SubChanges {
                    since: 42,
                    continuous: false,
                    filter: None,
                    batch: None,
                },
            )
            .await
            .unwrap();
        let value: serde_json::Value = response.decode_body().unwrap();
        assert_eq!(value["ok"], true);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn error_responses_carry_the_taxonomy() {
        let ((alice, _alice_in), (_bob, mut bob_in)) = Connection::pair(options());

        tokio::spawn(async move {
            let req = bob_in.recv().await.unwrap();
            req.respond_err(Error::not_found("no such document")).await;
        });

        let err = alice
            .send_request(Profile::Rev, Bytes::new(), Bytes::new(), false)
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 404);
    }

    #[tokio::test]
    async fn concurrent_requests_multiplex() {
        let ((alice, _alice_in), (_bob, mut bob_in)) = Connection::pair(options());

        tokio::spawn(async move {
            let mut held = Vec::new();
            // Answer the second request before the first.
            held.push(bob_in.recv().await.unwrap());
            held.push(bob_in.recv().await.unwrap());
            while let Some(req) = held.pop() {
                let body = Bytes::copy_from_slice(&req.body);
                req.respond_ok(body, Bytes::new(), false).await;
            }
        });

        let first = alice.send_request(Profile::Changes, Bytes::from_static(b"1"), Bytes::new(), false);
        let second = alice.send_request(Profile::Changes, Bytes::from_static(b"2"), Bytes::new(), false);
        let (first, second) = tokio::join!(first, second);
        assert_eq!(first.unwrap().body, Bytes::from_static(b"1"));
        assert_eq!(second.unwrap().body, Bytes::from_static(b"2"));
    }

    #[tokio::test]
    async fn close_fails_pending_requests() {
        let ((alice, _alice_in), (bob, mut bob_in)) = Connection::pair(options());

        let waiter = tokio::spawn(async move {
            alice
                .send_request(Profile::Changes, Bytes::new(), Bytes::new(), false)
                .await
        });
        // Swallow the request, then close without answering.
        let _req = bob_in.recv().await.unwrap();
        bob.close(Goodbye::normal()).await;

        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn dropped_transport_times_out_cleanly() {
        let ((alice, _alice_in), (bob, bob_in)) = Connection::pair(ConnectionOptions {
            request_timeout: Duration::from_millis(200),
        });
        drop(bob_in);
        drop(bob);

        let err = alice
            .send_request(Profile::Changes, Bytes::new(), Bytes::new(), false)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
