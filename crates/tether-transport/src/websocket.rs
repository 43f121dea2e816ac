//! WebSocket transport implementation.
//!
//! This module adapts an axum [`WebSocket`] into a [`Transport`] handle plus
//! an inbound event reader. Outbound traffic goes through an unbounded queue
//! drained by a writer task, so handle methods never wait on the socket.

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::traits::{ConnectionId, Transport, TransportError, TransportEvent};

/// Queued outbound operation.
#[derive(Debug)]
enum Outbound {
    Text(String),
    Ping,
    Close,
}

/// State shared between the handle, the reader and the writer task.
#[derive(Debug)]
struct Shared {
    open: AtomicBool,
    terminated: Notify,
}

impl Shared {
    fn shut(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.terminated.notify_one();
    }
}

/// Registry-facing handle to a WebSocket connection.
#[derive(Debug)]
pub struct WebSocketHandle {
    id: ConnectionId,
    remote_addr: Option<SocketAddr>,
    outbound: mpsc::UnboundedSender<Outbound>,
    shared: Arc<Shared>,
}

impl WebSocketHandle {
    fn enqueue(&self, op: Outbound) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        self.outbound
            .send(op)
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

impl Transport for WebSocketHandle {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.ip().to_string())
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.enqueue(Outbound::Text(text))
    }

    fn ping(&self) -> Result<(), TransportError> {
        self.enqueue(Outbound::Ping)
    }

    fn terminate(&self) {
        if self.shared.open.swap(false, Ordering::SeqCst) {
            debug!(connection = %self.id, "Terminating WebSocket");
            let _ = self.outbound.send(Outbound::Close);
        }
        self.shared.terminated.notify_one();
    }
}

/// A WebSocket connection: the inbound half plus ownership of the writer task.
pub struct WebSocketConnection {
    handle: Arc<WebSocketHandle>,
    stream: SplitStream<WebSocket>,
    writer: JoinHandle<()>,
    max_message_size: usize,
}

impl WebSocketConnection {
    /// Wrap an upgraded socket and start its writer task.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(socket: WebSocket, remote_addr: Option<SocketAddr>, max_message_size: usize) -> Self {
        let (sink, stream) = socket.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            open: AtomicBool::new(true),
            terminated: Notify::new(),
        });

        let handle = Arc::new(WebSocketHandle {
            id: ConnectionId::generate(),
            remote_addr,
            outbound: tx,
            shared: Arc::clone(&shared),
        });

        let writer = tokio::spawn(write_loop(handle.id.clone(), sink, rx, shared));

        Self {
            handle,
            stream,
            writer,
            max_message_size,
        }
    }

    /// Get the registry-facing handle.
    #[must_use]
    pub fn handle(&self) -> Arc<WebSocketHandle> {
        Arc::clone(&self.handle)
    }

    /// Get the connection's unique identifier.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.handle.id
    }

    /// Wait for the next inbound event.
    ///
    /// After `Closed` or `Error` has been returned the connection is done and
    /// should be dropped.
    pub async fn next_event(&mut self) -> TransportEvent {
        loop {
            let msg = tokio::select! {
                biased;

                _ = self.handle.shared.terminated.notified() => {
                    return TransportEvent::Closed;
                }

                msg = self.stream.next() => msg,
            };

            match msg {
                Some(Ok(Message::Text(text))) => {
                    if text.len() > self.max_message_size {
                        return self.fail(TransportError::MessageTooLarge(text.len()));
                    }
                    return TransportEvent::Text(text);
                }
                Some(Ok(Message::Binary(data))) => {
                    if data.len() > self.max_message_size {
                        return self.fail(TransportError::MessageTooLarge(data.len()));
                    }
                    match String::from_utf8(data) {
                        Ok(text) => return TransportEvent::Text(text),
                        Err(_) => {
                            debug!(connection = %self.handle.id, "Dropping non-UTF-8 binary message");
                        }
                    }
                }
                Some(Ok(Message::Ping(_))) => {
                    // tungstenite queues the pong reply itself
                }
                Some(Ok(Message::Pong(_))) => return TransportEvent::Pong,
                Some(Ok(Message::Close(_))) | None => {
                    debug!(connection = %self.handle.id, "WebSocket closed by peer");
                    self.handle.shared.open.store(false, Ordering::SeqCst);
                    return TransportEvent::Closed;
                }
                Some(Err(e)) => {
                    return self.fail(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }

    fn fail(&self, error: TransportError) -> TransportEvent {
        warn!(connection = %self.handle.id, error = %error, "WebSocket error");
        self.handle.terminate();
        TransportEvent::Error(error)
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        self.handle.shared.open.store(false, Ordering::SeqCst);
        self.writer.abort();
    }
}

/// Drain the outbound queue into the socket until closed or a write fails.
async fn write_loop(
    id: ConnectionId,
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    shared: Arc<Shared>,
) {
    while let Some(op) = rx.recv().await {
        let result = match op {
            Outbound::Text(text) => sink.send(Message::Text(text)).await,
            Outbound::Ping => sink.send(Message::Ping(Vec::new())).await,
            Outbound::Close => {
                let _ = sink.close().await;
                break;
            }
        };

        if let Err(e) = result {
            debug!(connection = %id, error = %e, "WebSocket write failed");
            shared.shut();
            break;
        }
    }

    rx.close();
    debug!(connection = %id, "WebSocket writer finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::WebSocketUpgrade, response::Response, routing::get, Router};
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::Message as ClientMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const MAX_MESSAGE_SIZE: usize = 64;

    /// Server side of one accepted connection, as seen by a test.
    struct Accepted {
        handle: Arc<WebSocketHandle>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    }

    impl Accepted {
        async fn next(&mut self) -> TransportEvent {
            tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("no event in time")
                .expect("connection task ended")
        }
    }

    async fn pump(socket: WebSocket, accepted: mpsc::UnboundedSender<Accepted>) {
        let mut conn = WebSocketConnection::new(socket, None, MAX_MESSAGE_SIZE);
        let (tx, events) = mpsc::unbounded_channel();
        if accepted
            .send(Accepted {
                handle: conn.handle(),
                events,
            })
            .is_err()
        {
            return;
        }

        loop {
            let event = conn.next_event().await;
            let done = matches!(event, TransportEvent::Closed | TransportEvent::Error(_));
            let _ = tx.send(event);
            if done {
                break;
            }
        }
    }

    async fn connect() -> (Client, Accepted) {
        let (accepted_tx, mut accepted_rx) = mpsc::unbounded_channel();
        let app = Router::new().route(
            "/",
            get(move |ws: WebSocketUpgrade| {
                let accepted_tx = accepted_tx.clone();
                async move {
                    let response: Response = ws.on_upgrade(move |socket| pump(socket, accepted_tx));
                    response
                }
            }),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (client, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
        let accepted = tokio::time::timeout(Duration::from_secs(5), accepted_rx.recv())
            .await
            .unwrap()
            .unwrap();
        (client, accepted)
    }

    async fn client_next(client: &mut Client) -> Option<ClientMessage> {
        tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("no message in time")
            .and_then(Result::ok)
    }

    #[tokio::test]
    async fn test_text_and_pong_events() {
        let (mut client, mut server) = connect().await;

        client.send(ClientMessage::Text("hello".into())).await.unwrap();
        assert!(matches!(server.next().await, TransportEvent::Text(t) if t == "hello"));

        client.send(ClientMessage::Pong(Vec::new())).await.unwrap();
        assert!(matches!(server.next().await, TransportEvent::Pong));
    }

    #[tokio::test]
    async fn test_handle_writes_reach_peer() {
        let (mut client, server) = connect().await;

        server.handle.send_text("notify".to_string()).unwrap();
        assert_eq!(
            client_next(&mut client).await,
            Some(ClientMessage::Text("notify".into()))
        );

        server.handle.ping().unwrap();
        assert!(matches!(
            client_next(&mut client).await,
            Some(ClientMessage::Ping(_))
        ));
    }

    #[tokio::test]
    async fn test_binary_frames() {
        let (mut client, mut server) = connect().await;

        client
            .send(ClientMessage::Binary(b"{\"type\":\"heartbeat\"}".to_vec()))
            .await
            .unwrap();
        assert!(matches!(
            server.next().await,
            TransportEvent::Text(t) if t == r#"{"type":"heartbeat"}"#
        ));

        // Non-UTF-8 payloads are skipped, not surfaced.
        client
            .send(ClientMessage::Binary(vec![0xff, 0xfe, 0xfd]))
            .await
            .unwrap();
        client.send(ClientMessage::Text("after".into())).await.unwrap();
        assert!(matches!(server.next().await, TransportEvent::Text(t) if t == "after"));
    }

    #[tokio::test]
    async fn test_oversized_message_is_error() {
        let (mut client, mut server) = connect().await;

        client
            .send(ClientMessage::Text("x".repeat(MAX_MESSAGE_SIZE + 1)))
            .await
            .unwrap();
        assert!(matches!(
            server.next().await,
            TransportEvent::Error(TransportError::MessageTooLarge(n)) if n == MAX_MESSAGE_SIZE + 1
        ));
        assert!(!server.handle.is_open());
        assert!(matches!(
            server.handle.send_text("late".to_string()),
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_terminate_wakes_reader() {
        let (mut client, mut server) = connect().await;

        server.handle.terminate();
        assert!(matches!(server.next().await, TransportEvent::Closed));
        assert!(!server.handle.is_open());
        assert!(server.handle.ping().is_err());

        // Peer sees the socket go away.
        assert!(!matches!(
            client_next(&mut client).await,
            Some(ClientMessage::Text(_))
        ));
    }

    #[tokio::test]
    async fn test_writer_shutdown_ends_reader() {
        let (_client, mut server) = connect().await;

        // What the writer task does when a socket write fails.
        server.handle.shared.shut();
        assert!(matches!(server.next().await, TransportEvent::Closed));
        assert!(!server.handle.is_open());
    }

    #[tokio::test]
    async fn test_peer_close() {
        let (mut client, mut server) = connect().await;

        client.close(None).await.unwrap();
        assert!(matches!(server.next().await, TransportEvent::Closed));
        assert!(!server.handle.is_open());
        assert!(server.handle.id().as_str().starts_with("conn_"));
    }
}
