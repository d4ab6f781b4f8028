//! WebSocket transport for replication connections.
//!
//! Frames travel as binary messages; the close handshake carries the
//! protocol's status-plus-reason payload, which is exactly the WebSocket
//! close frame format. The dialer is injected into the replicator as a
//! [`Connector`], so no process-wide socket state exists.

use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::trace;

use madrona::error::network;
use madrona::{Error, Result};

use crate::connection::{Connection, ConnectionOptions, InboundRequest};
use crate::protocol::{self, Frame, Goodbye};
use crate::replicator::Connector;

/// Dials a replication endpoint over WebSocket.
pub async fn connect(
    url: &str,
    options: ConnectionOptions,
) -> Result<(Connection, mpsc::Receiver<InboundRequest>)> {
    let (ws, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|err| Error::network(network::UNKNOWN_HOST, err))?;
    trace!(url, "websocket connected");
    Ok(Connection::spawn(WsTransport::new(ws), options))
}

/// Accepts one replication connection on an incoming socket.
pub async fn accept<S>(
    stream: S,
    options: ConnectionOptions,
) -> Result<(Connection, mpsc::Receiver<InboundRequest>)>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|err| Error::websocket(1002, err))?;
    Ok(Connection::spawn(WsTransport::new(ws), options))
}

/// A [`Connector`] that redials a fixed URL.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    options: ConnectionOptions,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, options: ConnectionOptions) -> Self {
        WsConnector {
            url: url.into(),
            options,
        }
    }
}

impl Connector for WsConnector {
    fn connect(
        &self,
    ) -> futures::future::BoxFuture<'static, Result<(Connection, mpsc::Receiver<InboundRequest>)>>
    {
        let url = self.url.clone();
        let options = self.options.clone();
        Box::pin(async move { connect(&url, options).await })
    }
}

/// Adapts a WebSocket into the [`Frame`] stream/sink the connection driver
/// consumes. Pings and pongs are handled below this layer.
#[derive(Debug)]
pub struct WsTransport<S> {
    inner: WebSocketStream<S>,
}

/// The concrete client-side transport type.
pub type ClientTransport = WsTransport<MaybeTlsStream<TcpStream>>;

impl<S> WsTransport<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        WsTransport { inner }
    }
}

fn receive_error(err: tokio_tungstenite::tungstenite::Error) -> Error {
    Error::websocket(1006, err)
}

impl<S> Stream for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Item = Result<Frame>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let message = ready!(Pin::new(&mut self.inner).poll_next(cx));
            return Poll::Ready(match message {
                None => None,
                Some(Err(err)) => Some(Err(receive_error(err))),
                Some(Ok(Message::Binary(data))) => Some(protocol::decode_frame(&data)),
                Some(Ok(Message::Close(close))) => {
                    let goodbye = match close {
                        Some(frame) => Goodbye {
                            status: frame.code.into(),
                            reason: frame.reason.into_owned(),
                        },
                        None => Goodbye {
                            status: 0,
                            reason: String::new(),
                        },
                    };
                    Some(Ok(Frame::Close(goodbye)))
                }
                // Pings are answered by the websocket layer; nothing else is
                // part of the protocol.
                Some(Ok(_)) => continue,
            });
        }
    }
}

impl<S> Sink<Frame> for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Error = Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        Pin::new(&mut self.inner)
            .poll_ready(cx)
            .map_err(receive_error)
    }

    fn start_send(mut self: Pin<&mut Self>, frame: Frame) -> Result<()> {
        let message = match frame {
            Frame::Close(goodbye) => Message::Close(Some(CloseFrame {
                code: goodbye.status.into(),
                reason: goodbye.reason.into(),
            })),
            other => Message::Binary(protocol::encode_frame(&other)?),
        };
        Pin::new(&mut self.inner)
            .start_send(message)
            .map_err(receive_error)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(receive_error)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        Pin::new(&mut self.inner)
            .poll_close(cx)
            .map_err(receive_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Profile;
    use bytes::Bytes;

    #[tokio::test]
    async fn request_over_websocket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (_conn, mut incoming) = accept(socket, ConnectionOptions::default())
                .await
                .unwrap();
            let request = incoming.recv().await.unwrap();
            assert_eq!(request.profile, Profile::GetAttachment);
            request
                .respond_ok(Bytes::new(), Bytes::from_static(b"blob bytes"), false)
                .await;
        });

        let (conn, _incoming) = connect(
            &format!("ws://{addr}"),
            ConnectionOptions::default(),
        )
        .await
        .unwrap();
        let response = conn
            .request(
                Profile::GetAttachment,
                &crate::protocol::GetAttachment {
                    digest: "sha1-2jmj7l5rSw0yVb/vlWAYkK/YBwk=".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(response.payload.as_ref(), b"blob bytes");
        server.await.unwrap();
    }
}
