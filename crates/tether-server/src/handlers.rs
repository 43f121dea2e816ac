//! Connection and admin handlers for the Tether server.
//!
//! Agents connect over WebSocket; operators use the small JSON API to list
//! online clients and send notifications.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, State,
    },
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tether_core::{
    ConnectionRegistry, ConnectionSnapshot, FrameOutcome, HeartbeatMonitor, MemoryGateway,
    MessageDispatcher, NotifyPayload, PresencePersister, PresenceRecord, ProtocolHandler,
};
use tether_transport::{TransportEvent, WebSocketConnection};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Shared server state.
pub struct AppState {
    /// Live connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Notification delivery.
    pub dispatcher: MessageDispatcher,
    /// Presence store.
    pub gateway: Arc<MemoryGateway>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state around an existing registry.
    #[must_use]
    pub fn new(config: Config, registry: Arc<ConnectionRegistry>, gateway: Arc<MemoryGateway>) -> Self {
        Self {
            dispatcher: MessageDispatcher::new(Arc::clone(&registry)),
            registry,
            gateway,
            config,
        }
    }
}

/// Build the HTTP router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/clients", get(list_clients_handler))
        .route("/clients/:client_id/notify", post(notify_handler))
        .route("/records", get(list_records_handler))
        .route("/records/:client_id", delete(delete_record_handler))
        .route("/records/:client_id/name", put(rename_record_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let gateway = Arc::new(MemoryGateway::new());
    let (persister, writer) =
        PresencePersister::spawn(gateway.clone(), config.persistence.persister());
    let registry = Arc::new(ConnectionRegistry::new(persister.clone()));

    let heartbeat = HeartbeatMonitor::new(Arc::clone(&registry), config.heartbeat.monitor()).spawn();

    let state = Arc::new(AppState::new(config.clone(), registry, gateway));
    let app = build_router(state);

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Tether server listening on {}", addr);
    info!(
        "Agent endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    heartbeat.stop().await;
    persister.close();
    if let Err(e) = writer.await {
        error!("Presence writer failed: {}", e);
    }
    info!("Tether server stopped");

    served.context("Server error")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// List online clients.
async fn list_clients_handler(State(state): State<Arc<AppState>>) -> Json<ConnectionSnapshot> {
    Json(state.dispatcher.list_connections())
}

/// List persisted presence records.
async fn list_records_handler(State(state): State<Arc<AppState>>) -> Json<Vec<PresenceRecord>> {
    Json(state.gateway.records())
}

/// Result of a record admin action.
#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecordResponse {
    pub ok: bool,
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
}

impl RecordResponse {
    fn new(client_id: String, error: Option<&'static str>) -> Self {
        Self {
            ok: error.is_none(),
            client_id,
            error,
        }
    }
}

/// Delete a persisted presence record.
async fn delete_record_handler(
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<String>,
) -> Json<RecordResponse> {
    let client_id = client_id.trim().to_string();
    let error = match state.gateway.remove(&client_id) {
        Some(_) => {
            info!(client = %client_id, "Presence record deleted");
            None
        }
        None => Some("not_found"),
    };

    Json(RecordResponse::new(client_id, error))
}

/// Body of a rename request.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RenameRequest {
    pub name: String,
}

/// Set the operator-assigned name of a client.
async fn rename_record_handler(
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<String>,
    Json(request): Json<RenameRequest>,
) -> Json<RecordResponse> {
    let client_id = client_id.trim().to_string();
    let name = request.name.trim();

    let error = if client_id.is_empty() || name.is_empty() {
        Some("missing_fields")
    } else if state.gateway.rename(&client_id, name) {
        info!(client = %client_id, name = %name, "Client renamed");
        None
    } else {
        Some("not_found")
    };

    Json(RecordResponse::new(client_id, error))
}

/// Result of a notify request.
#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotifyResponse {
    pub ok: bool,
    pub client_id: String,
    /// `"sent"` or `"client_offline"`.
    pub status: &'static str,
}

/// Send a notification to one client.
async fn notify_handler(
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<String>,
    Json(payload): Json<NotifyPayload>,
) -> Json<NotifyResponse> {
    let client_id = client_id.trim().to_string();
    let ok = state.dispatcher.send(&client_id, payload);
    let status = if ok { "sent" } else { "client_offline" };

    metrics::record_notify(status);
    info!(client = %client_id, status, "Notify requested");

    Json(NotifyResponse {
        ok,
        client_id,
        status,
    })
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let max_message_size = state.config.transport.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, addr, state))
}

/// Handle an agent WebSocket connection.
async fn handle_websocket(socket: WebSocket, addr: SocketAddr, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let mut conn = WebSocketConnection::new(
        socket,
        Some(addr),
        state.config.transport.max_message_size,
    );
    let mut handler = ProtocolHandler::new(Arc::clone(&state.registry), conn.handle());

    debug!(connection = %conn.id(), remote = %addr, "WebSocket connected");

    loop {
        match conn.next_event().await {
            TransportEvent::Text(text) => {
                let outcome = handler.handle_text(&text);
                metrics::record_frame(outcome.label());
                if matches!(outcome, FrameOutcome::Registered(_)) {
                    metrics::set_clients_online(state.registry.len());
                }
            }
            TransportEvent::Pong => {
                handler.handle_pong();
            }
            TransportEvent::Closed => {
                handler.handle_close();
                break;
            }
            TransportEvent::Error(e) => {
                metrics::record_error("websocket");
                handler.handle_error(&e);
                break;
            }
        }
    }

    metrics::set_clients_online(state.registry.len());
    debug!(connection = %conn.id(), client = ?handler.client_id(), "WebSocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tether_core::{ClientMeta, PersisterConfig, PresencePatch};
    use tether_transport::MemoryTransport;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message as ClientMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn test_state() -> Arc<AppState> {
        let gateway = Arc::new(MemoryGateway::new());
        let (persister, _task) = PresencePersister::spawn(gateway.clone(), PersisterConfig::default());
        let registry = Arc::new(ConnectionRegistry::new(persister));
        Arc::new(AppState::new(Config::default(), registry, gateway))
    }

    #[tokio::test]
    async fn test_notify_offline_client() {
        let state = test_state();

        let Json(response) = notify_handler(
            State(state),
            Path("c1".to_string()),
            Json(NotifyPayload::text("hi")),
        )
        .await;

        assert_eq!(
            response,
            NotifyResponse {
                ok: false,
                client_id: "c1".to_string(),
                status: "client_offline",
            }
        );
    }

    #[tokio::test]
    async fn test_notify_online_client() {
        let state = test_state();
        let transport = MemoryTransport::new();
        state.registry.register_or_replace(
            "c1",
            transport.clone(),
            ClientMeta {
                display_name: "Bench1".to_string(),
                source_address: String::new(),
            },
        );

        let Json(response) = notify_handler(
            State(Arc::clone(&state)),
            Path("c1".to_string()),
            Json(NotifyPayload::text("hi")),
        )
        .await;

        assert!(response.ok);
        assert_eq!(response.status, "sent");
        assert_eq!(transport.sent().len(), 1);

        let Json(clients) = list_clients_handler(State(Arc::clone(&state))).await;
        assert_eq!(clients.len(), 1);

        state.registry.persister().flush().await;
        let Json(records) = list_records_handler(State(state)).await;
        assert_eq!(records[0].client_id, "c1");
    }

    #[tokio::test]
    async fn test_router_builds() {
        let _router = build_router(test_state());
    }

    #[tokio::test]
    async fn test_delete_record() {
        let state = test_state();
        state.registry.persister().upsert_unconditional("c1", PresencePatch::offline());
        state.registry.persister().flush().await;

        let Json(response) =
            delete_record_handler(State(Arc::clone(&state)), Path(" c1 ".to_string())).await;
        assert_eq!(response, RecordResponse::new("c1".to_string(), None));
        assert!(state.gateway.get("c1").is_none());

        let Json(response) =
            delete_record_handler(State(Arc::clone(&state)), Path("c1".to_string())).await;
        assert!(!response.ok);
        assert_eq!(response.error, Some("not_found"));
    }

    #[tokio::test]
    async fn test_rename_record() {
        let state = test_state();
        state
            .registry
            .persister()
            .upsert_unconditional("c1", PresencePatch::online("Bench1", "10.0.0.5"));
        state.registry.persister().flush().await;

        let Json(response) = rename_record_handler(
            State(Arc::clone(&state)),
            Path("c1".to_string()),
            Json(RenameRequest {
                name: "  Front desk ".to_string(),
            }),
        )
        .await;
        assert!(response.ok);

        let record = state.gateway.get("c1").unwrap();
        assert_eq!(record.name, "Front desk");
        assert_eq!(record.reported_name.as_deref(), Some("Bench1"));

        let Json(response) = rename_record_handler(
            State(Arc::clone(&state)),
            Path("c1".to_string()),
            Json(RenameRequest::default()),
        )
        .await;
        assert_eq!(response.error, Some("missing_fields"));

        let Json(response) = rename_record_handler(
            State(state),
            Path("nobody".to_string()),
            Json(RenameRequest {
                name: "X".to_string(),
            }),
        )
        .await;
        assert_eq!(response.error, Some("not_found"));
    }

    async fn serve(state: Arc<AppState>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(state);
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        addr
    }

    async fn wait_until(check: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn send_hello(client: &mut Client, client_id: &str, name: &str) {
        let hello = format!(r#"{{"type":"hello","clientId":"{client_id}","name":"{name}"}}"#);
        client.send(ClientMessage::Text(hello)).await.unwrap();
    }

    async fn next_text(client: &mut Client) -> String {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("no message in time");
            match msg {
                Some(Ok(ClientMessage::Text(text))) => return text,
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_websocket_session() {
        let state = test_state();
        let url = format!("ws://{}/", serve(Arc::clone(&state)).await);

        let (mut first, _) = connect_async(&url).await.unwrap();
        send_hello(&mut first, "c1", "Bench1").await;
        wait_until(|| state.registry.contains("c1")).await;

        let info = state.registry.snapshot().into_iter().next().unwrap();
        assert_eq!(info.display_name, "Bench1");
        assert_eq!(info.source_address, "127.0.0.1");

        assert!(state.dispatcher.send("c1", NotifyPayload::text("hi")));
        let notify: serde_json::Value = serde_json::from_str(&next_text(&mut first).await).unwrap();
        assert_eq!(notify["type"], "notify");
        assert_eq!(notify["text"], "hi");
        assert_eq!(notify["duration"], 30);

        let (mut second, _) = connect_async(&url).await.unwrap();
        send_hello(&mut second, "c1", "Bench2").await;
        wait_until(|| {
            state
                .registry
                .snapshot()
                .iter()
                .any(|c| c.display_name == "Bench2")
        })
        .await;

        // Server closes the displaced socket.
        let displaced = tokio::time::timeout(Duration::from_secs(5), first.next())
            .await
            .expect("displaced socket left open");
        assert!(matches!(
            displaced,
            None | Some(Err(_)) | Some(Ok(ClientMessage::Close(_)))
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(state.registry.len(), 1);
        assert!(state.registry.contains("c1"));

        second.close(None).await.unwrap();
        wait_until(|| !state.registry.contains("c1")).await;

        state.registry.persister().flush().await;
        let record = state.gateway.get("c1").unwrap();
        assert!(!record.online);
        assert_eq!(record.reported_name.as_deref(), Some("Bench2"));
    }
}
