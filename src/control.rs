//! Operator control channel: WebSocket + REST on axum.
//!
//! Client -> Server (JSON, tagged `type`):
//! ```json
//! {"type": "send_message", "number": "5215512345678", "message": "Ya salió tu orden"}
//! {"type": "check_status"}
//! ```
//!
//! Server -> Client (JSON, tagged `type`):
//! ```json
//! {"type": "ack", "success": true, "message": "sent"}
//! {"type": "status", "connected": true, "status": "connected"}
//! {"type": "qr", "qr": "..."}
//! {"type": "connection_status", "status": "disconnected"}
//! {"type": "new_message", "from": "...", "sender": "...", "message": "...", "timestamp": 0, "kind": "text"}
//! ```
//!
//! REST mirrors for dashboards that do not hold a socket open:
//! `POST /api/send-message`, `GET /api/status`, `GET /api/messages`.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use comanda_core::config::ControlConfig;
use comanda_core::error::ComandaError;
use comanda_core::message::InboundMessage;
use comanda_history::HistoryStore;
use comanda_whatsapp::to_jid;

use crate::menu::MenuPolicy;
use crate::session::{Session, SessionStatus};

/// Operator command over the socket or REST.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlCommand {
    SendMessage { number: String, message: String },
    CheckStatus,
}

/// Direct reply to a command.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlReply {
    Ack {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Status {
        connected: bool,
        status: String,
    },
}

/// Event pushed to every connected operator client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlBroadcast {
    Qr {
        qr: String,
    },
    ConnectionStatus {
        status: String,
    },
    NewMessage {
        from: String,
        sender: String,
        message: String,
        timestamp: i64,
        kind: String,
    },
}

/// Shared state for the control server.
#[derive(Clone)]
pub struct ControlState {
    session: Arc<Session>,
    menu: Arc<MenuPolicy>,
    history: HistoryStore,
    broadcast: broadcast::Sender<ControlBroadcast>,
    recent: Arc<Mutex<VecDeque<ControlBroadcast>>>,
    recent_limit: usize,
}

impl ControlState {
    pub fn new(
        session: Arc<Session>,
        menu: Arc<MenuPolicy>,
        history: HistoryStore,
        recent_limit: usize,
    ) -> Self {
        let (broadcast, _) = broadcast::channel(64);
        Self {
            session,
            menu,
            history,
            broadcast,
            recent: Arc::new(Mutex::new(VecDeque::new())),
            recent_limit,
        }
    }

    /// Push a pairing QR to connected clients.
    pub fn broadcast_qr(&self, qr: &str) {
        let _ = self.broadcast.send(ControlBroadcast::Qr { qr: qr.to_string() });
    }

    /// Push a connection state change to connected clients.
    pub fn broadcast_status(&self, status: SessionStatus) {
        let _ = self.broadcast.send(ControlBroadcast::ConnectionStatus {
            status: status.as_str().to_string(),
        });
    }

    /// Record an inbound message and push it to connected clients.
    pub async fn publish_inbound(&self, msg: &InboundMessage) {
        let event = ControlBroadcast::NewMessage {
            from: msg.conversation_id.clone(),
            sender: msg.sender_label.clone(),
            message: msg.text.clone(),
            timestamp: msg.timestamp_ms,
            kind: msg.kind.as_str().to_string(),
        };

        let mut recent = self.recent.lock().await;
        if recent.len() >= self.recent_limit {
            recent.pop_front();
        }
        recent.push_back(event.clone());
        drop(recent);

        let _ = self.broadcast.send(event);
    }

    async fn handle_command(&self, command: ControlCommand) -> ControlReply {
        match command {
            ControlCommand::CheckStatus => {
                let status = self.session.status().await;
                ControlReply::Status {
                    connected: status.is_connected(),
                    status: status.as_str().to_string(),
                }
            }
            ControlCommand::SendMessage { number, message } => {
                let jid = to_jid(&number);
                let user_id = comanda_whatsapp::jid_user(&jid).to_string();

                self.menu.send_if_due(&self.session, &jid, &user_id).await;

                match self.session.send_text(&jid, &message).await {
                    Ok(()) => {
                        if let Err(e) = self.history.record_exchange(&user_id, &jid).await {
                            warn!("Failed to record exchange for {user_id}: {e}");
                        }
                        ControlReply::Ack {
                            success: true,
                            message: Some("sent".to_string()),
                            error: None,
                        }
                    }
                    Err(e) => ControlReply::Ack {
                        success: false,
                        message: None,
                        error: Some(e.to_string()),
                    },
                }
            }
        }
    }
}

/// Start the control server. Runs until the process exits.
pub async fn serve(config: &ControlConfig, state: ControlState) -> Result<(), ComandaError> {
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/send-message", post(post_send_message))
        .route("/api/status", get(get_status))
        .route("/api/messages", get(get_messages))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ComandaError::Config(format!("failed to bind control server to {addr}: {e}")))?;

    info!("Control server listening on {addr}");

    axum::serve(listener, app)
        .await
        .map_err(|e| ComandaError::Transport(format!("control server error: {e}")))?;

    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ControlState>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

enum RelayStep {
    Deliver(ControlBroadcast),
    Skip,
    Stop,
}

/// A slow client that lagged the broadcast buffer skips the missed
/// events and keeps its connection; only a closed channel ends it.
fn relay_step(result: Result<ControlBroadcast, broadcast::error::RecvError>) -> RelayStep {
    match result {
        Ok(event) => RelayStep::Deliver(event),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!("Control client lagged, skipped {skipped} events");
            RelayStep::Skip
        }
        Err(broadcast::error::RecvError::Closed) => RelayStep::Stop,
    }
}

/// One operator connection. Broadcasts and command replies are interleaved
/// on the same socket; a client dropping only ends its own task.
async fn handle_socket(socket: WebSocket, state: ControlState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let mut events = state.broadcast.subscribe();

    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match relay_step(event) {
                    RelayStep::Deliver(event) => event,
                    RelayStep::Skip => continue,
                    RelayStep::Stop => break,
                };
                let Ok(json) = serde_json::to_string(&event) else { continue };
                if ws_sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            incoming = ws_receiver.next() => {
                let Some(Ok(msg)) = incoming else { break };
                match msg {
                    Message::Text(text) => {
                        let command: ControlCommand = match serde_json::from_str(&text) {
                            Ok(command) => command,
                            Err(e) => {
                                warn!("Invalid control command: {e}");
                                let reply = ControlReply::Ack {
                                    success: false,
                                    message: None,
                                    error: Some(format!("invalid command: {e}")),
                                };
                                let json = serde_json::to_string(&reply).unwrap_or_default();
                                if ws_sender.send(Message::Text(json.into())).await.is_err() {
                                    break;
                                }
                                continue;
                            }
                        };
                        let reply = state.handle_command(command).await;
                        let Ok(json) = serde_json::to_string(&reply) else { continue };
                        if ws_sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct SendMessageBody {
    number: String,
    message: String,
}

async fn post_send_message(
    State(state): State<ControlState>,
    Json(body): Json<SendMessageBody>,
) -> Json<serde_json::Value> {
    let reply = state
        .handle_command(ControlCommand::SendMessage {
            number: body.number,
            message: body.message,
        })
        .await;
    Json(serde_json::to_value(&reply).unwrap_or_default())
}

async fn get_status(State(state): State<ControlState>) -> Json<serde_json::Value> {
    let reply = state.handle_command(ControlCommand::CheckStatus).await;
    Json(serde_json::to_value(&reply).unwrap_or_default())
}

async fn get_messages(State(state): State<ControlState>) -> Json<serde_json::Value> {
    let recent = state.recent.lock().await;
    let messages: Vec<_> = recent.iter().cloned().collect();
    Json(serde_json::json!({ "messages": messages }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use comanda_core::message::DocumentPayload;
    use comanda_core::traits::{Transport, TransportEvent};
    use tokio::sync::mpsc;

    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        fn name(&self) -> &str {
            "null"
        }
        async fn start(&self) -> Result<mpsc::Receiver<TransportEvent>, ComandaError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
        async fn send_text(&self, _target: &str, _text: &str) -> Result<(), ComandaError> {
            Ok(())
        }
        async fn send_document(
            &self,
            _target: &str,
            _document: &DocumentPayload,
        ) -> Result<(), ComandaError> {
            Ok(())
        }
        async fn stop(&self) -> Result<(), ComandaError> {
            Ok(())
        }
    }

    #[test]
    fn test_command_parsing() {
        let cmd: ControlCommand = serde_json::from_str(
            r#"{"type": "send_message", "number": "+52 155 1234 5678", "message": "hola"}"#,
        )
        .unwrap();
        assert!(matches!(cmd, ControlCommand::SendMessage { .. }));

        let cmd: ControlCommand = serde_json::from_str(r#"{"type": "check_status"}"#).unwrap();
        assert!(matches!(cmd, ControlCommand::CheckStatus));
    }

    #[test]
    fn test_reply_shapes() {
        let ack = ControlReply::Ack {
            success: true,
            message: Some("sent".to_string()),
            error: None,
        };
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json["type"], "ack");
        assert_eq!(json["success"], true);
        assert_eq!(json["message"], "sent");
        assert!(json.get("error").is_none());

        let status = ControlReply::Status {
            connected: false,
            status: "disconnected".to_string(),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["connected"], false);
    }

    #[test]
    fn test_broadcast_shapes() {
        let event = ControlBroadcast::NewMessage {
            from: "1@s.whatsapp.net".to_string(),
            sender: "Ana".to_string(),
            message: "[media message]".to_string(),
            timestamp: 1700000000000,
            kind: "non-text".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "new_message");
        assert_eq!(json["kind"], "non-text");

        let qr = ControlBroadcast::Qr { qr: "pairing-data".to_string() };
        let json = serde_json::to_value(&qr).unwrap();
        assert_eq!(json["type"], "qr");
    }

    #[tokio::test]
    async fn test_lagged_client_skips_and_keeps_receiving() {
        let (tx, mut rx) = broadcast::channel(2);
        for i in 0..5 {
            tx.send(ControlBroadcast::ConnectionStatus {
                status: format!("status {i}"),
            })
            .unwrap();
        }

        // Buffer of 2 means the first recv reports the overrun.
        match relay_step(rx.recv().await) {
            RelayStep::Skip => {}
            other => panic!("expected lag to skip, got {}", step_name(&other)),
        }

        // The connection stays up and delivers what is still buffered.
        match relay_step(rx.recv().await) {
            RelayStep::Deliver(ControlBroadcast::ConnectionStatus { status }) => {
                assert_eq!(status, "status 3");
            }
            other => panic!("expected delivery, got {}", step_name(&other)),
        }

        drop(tx);
        let _ = rx.recv().await; // drain "status 4"
        match relay_step(rx.recv().await) {
            RelayStep::Stop => {}
            other => panic!("expected closed channel to stop, got {}", step_name(&other)),
        }
    }

    fn step_name(step: &RelayStep) -> &'static str {
        match step {
            RelayStep::Deliver(_) => "deliver",
            RelayStep::Skip => "skip",
            RelayStep::Stop => "stop",
        }
    }

    #[tokio::test]
    async fn test_recent_buffer_is_bounded() {
        let history = HistoryStore::in_memory().await.unwrap();
        let menu = Arc::new(MenuPolicy::new(Default::default(), history.clone()));
        let session = Arc::new(Session::new(
            Arc::new(NullTransport),
            std::time::Duration::from_secs(1),
        ));
        let state = ControlState::new(session, menu, history, 3);

        for i in 0..5 {
            state
                .publish_inbound(&InboundMessage {
                    conversation_id: "1@s.whatsapp.net".to_string(),
                    sender_id: "1".to_string(),
                    sender_label: "Ana".to_string(),
                    text: format!("msg {i}"),
                    timestamp_ms: i,
                    kind: comanda_core::message::MessageKind::Text,
                })
                .await;
        }

        let recent = state.recent.lock().await;
        assert_eq!(recent.len(), 3);
        match recent.front().unwrap() {
            ControlBroadcast::NewMessage { message, .. } => assert_eq!(message, "msg 2"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
