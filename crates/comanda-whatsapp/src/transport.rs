//! `Transport` implementation over the WhatsApp Web protocol.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use wacore::types::events::Event;
use wacore_binary::jid::Jid;
use whatsapp_rust::bot::Bot;
use whatsapp_rust::client::Client;
use whatsapp_rust_tokio_transport::TokioWebSocketTransportFactory;
use whatsapp_rust_ureq_http_client::UreqHttpClient;

use comanda_core::config::shellexpand;
use comanda_core::error::ComandaError;
use comanda_core::message::{DocumentPayload, InboundMessage, MessageKind, NON_TEXT_PLACEHOLDER};
use comanda_core::traits::{Transport, TransportEvent};

use crate::store::SessionStore;
use crate::split_message;

/// WhatsApp transport. One instance owns one paired session.
pub struct WhatsAppTransport {
    data_dir: String,
    /// Client handle for sending — set once the bot connects.
    client: Arc<Mutex<Option<Arc<Client>>>>,
    /// Background bot task; aborted on stop so a restart never runs
    /// two bots against the same session store.
    bot_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Message IDs we sent, used to drop our own echoes.
    sent_ids: Arc<Mutex<HashSet<String>>>,
}

impl WhatsAppTransport {
    pub fn new(data_dir: &str) -> Self {
        Self {
            data_dir: data_dir.to_string(),
            client: Arc::new(Mutex::new(None)),
            bot_task: Mutex::new(None),
            sent_ids: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn session_db_path(&self) -> String {
        let dir = shellexpand(&self.data_dir);
        let session_dir = format!("{dir}/whatsapp_session");
        let _ = std::fs::create_dir_all(&session_dir);
        format!("{session_dir}/session.db")
    }

    async fn client(&self) -> Result<Arc<Client>, ComandaError> {
        self.client
            .lock()
            .await
            .clone()
            .ok_or_else(|| ComandaError::Transport("whatsapp client not connected".into()))
    }

    fn parse_jid(target: &str) -> Result<Jid, ComandaError> {
        target
            .parse()
            .map_err(|e| ComandaError::Transport(format!("invalid whatsapp JID '{target}': {e}")))
    }
}

#[async_trait]
impl Transport for WhatsAppTransport {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn start(&self) -> Result<mpsc::Receiver<TransportEvent>, ComandaError> {
        let (tx, rx) = mpsc::channel(64);
        let db_path = self.session_db_path();

        info!("WhatsApp transport starting (session: {db_path})...");

        let backend = Arc::new(
            SessionStore::new(&db_path)
                .await
                .map_err(|e| ComandaError::Transport(format!("session store init failed: {e}")))?,
        );

        let tx_events = tx.clone();
        let client_for_event = self.client.clone();
        let sent_ids_for_event = self.sent_ids.clone();

        let mut bot = Bot::builder()
            .with_backend(backend)
            .with_transport_factory(TokioWebSocketTransportFactory::new())
            .with_http_client(UreqHttpClient::new())
            .on_event(move |event, client| {
                let tx = tx_events.clone();
                let client_store = client_for_event.clone();
                let sent_ids = sent_ids_for_event.clone();
                async move {
                    match event {
                        Event::PairingQrCode { code, .. } => {
                            info!("WhatsApp QR code generated (scan to pair)");
                            let _ = tx.send(TransportEvent::LoginChallenge(code)).await;
                        }
                        Event::PairSuccess(_) => {
                            info!("WhatsApp pairing successful");
                        }
                        Event::Connected(_) => {
                            info!("WhatsApp connected");
                            *client_store.lock().await = Some(client);
                            let _ = tx.send(TransportEvent::Connected).await;
                        }
                        Event::Disconnected(_) => {
                            warn!("WhatsApp disconnected");
                            *client_store.lock().await = None;
                            let _ = tx
                                .send(TransportEvent::Closed { logged_out: false })
                                .await;
                        }
                        Event::LoggedOut(_) => {
                            warn!("WhatsApp logged out, session invalidated");
                            *client_store.lock().await = None;
                            let _ = tx.send(TransportEvent::Closed { logged_out: true }).await;
                        }
                        Event::Message(msg, msg_info) => {
                            // Customer chats only: no own messages, no groups.
                            if msg_info.source.is_from_me {
                                return;
                            }
                            if msg_info.source.is_group {
                                return;
                            }

                            let msg_id = msg_info.id.clone();
                            if sent_ids.lock().await.remove(&msg_id) {
                                debug!("skipping own echo: {msg_id}");
                                return;
                            }

                            // Unwrap nested wrappers (device_sent, ephemeral, view_once).
                            let inner = msg
                                .device_sent_message
                                .as_ref()
                                .and_then(|d| d.message.as_deref())
                                .or_else(|| {
                                    msg.ephemeral_message
                                        .as_ref()
                                        .and_then(|e| e.message.as_deref())
                                })
                                .or_else(|| {
                                    msg.view_once_message
                                        .as_ref()
                                        .and_then(|v| v.message.as_deref())
                                })
                                .unwrap_or(&msg);

                            let (text, kind) = extract_text(inner);

                            let phone = msg_info.source.sender.user.clone();
                            let sender_label = if msg_info.push_name.is_empty() {
                                phone.clone()
                            } else {
                                msg_info.push_name.clone()
                            };

                            let inbound = InboundMessage {
                                conversation_id: msg_info.source.chat.to_string(),
                                sender_id: phone,
                                sender_label,
                                text,
                                timestamp_ms: inbound_timestamp_ms(msg_info.timestamp),
                                kind,
                            };

                            if tx.send(TransportEvent::Inbound(inbound)).await.is_err() {
                                info!("whatsapp event receiver dropped");
                            }
                        }
                        _ => {}
                    }
                }
            })
            .build()
            .await
            .map_err(|e| ComandaError::Transport(format!("whatsapp bot build failed: {e}")))?;

        *self.client.lock().await = Some(bot.client());

        let handle = bot
            .run()
            .await
            .map_err(|e| ComandaError::Transport(format!("whatsapp bot run failed: {e}")))?;

        // A restart leaks the previous bot task unless we abort it here.
        if let Some(old) = self.bot_task.lock().await.replace(handle) {
            old.abort();
        }

        info!("WhatsApp transport started");
        Ok(rx)
    }

    async fn send_text(&self, target: &str, text: &str) -> Result<(), ComandaError> {
        let client = self.client().await?;
        let jid = Self::parse_jid(target)?;

        for chunk in split_message(text, 4096) {
            let msg = waproto::whatsapp::Message {
                conversation: Some(chunk.to_string()),
                ..Default::default()
            };
            let msg_id = client
                .send_message(jid.clone(), msg)
                .await
                .map_err(|e| ComandaError::Transport(format!("whatsapp send failed: {e}")))?;
            self.sent_ids.lock().await.insert(msg_id);
        }

        Ok(())
    }

    async fn send_document(
        &self,
        target: &str,
        document: &DocumentPayload,
    ) -> Result<(), ComandaError> {
        let client = self.client().await?;
        let jid = Self::parse_jid(target)?;

        info!(
            "Uploading document {} ({} bytes)",
            document.file_name,
            document.bytes.len()
        );

        let upload = client
            .upload(
                document.bytes.clone(),
                whatsapp_rust::download::MediaType::Document,
            )
            .await
            .map_err(|e| ComandaError::Transport(format!("whatsapp upload failed: {e}")))?;

        let msg = waproto::whatsapp::Message {
            document_message: Some(Box::new(waproto::whatsapp::message::DocumentMessage {
                url: Some(upload.url),
                direct_path: Some(upload.direct_path),
                media_key: Some(upload.media_key),
                file_enc_sha256: Some(upload.file_enc_sha256),
                file_sha256: Some(upload.file_sha256),
                file_length: Some(upload.file_length),
                mimetype: Some(document.mimetype.clone()),
                file_name: Some(document.file_name.clone()),
                caption: (!document.caption.is_empty()).then(|| document.caption.clone()),
                ..Default::default()
            })),
            ..Default::default()
        };

        let msg_id = client
            .send_message(jid, msg)
            .await
            .map_err(|e| ComandaError::Transport(format!("whatsapp send failed: {e}")))?;
        self.sent_ids.lock().await.insert(msg_id);

        Ok(())
    }

    async fn stop(&self) -> Result<(), ComandaError> {
        if let Some(handle) = self.bot_task.lock().await.take() {
            handle.abort();
        }
        *self.client.lock().await = None;
        info!("WhatsApp transport stopped");
        Ok(())
    }
}

/// Message time as stamped by the relay. Zero means the relay didn't
/// stamp it; fall back to local receive time.
fn inbound_timestamp_ms(network: chrono::DateTime<chrono::Utc>) -> i64 {
    let ts = network.timestamp_millis();
    if ts > 0 {
        ts
    } else {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Pull relayable text out of a decrypted message.
///
/// Plain and extended text map to [`MessageKind::Text`]; media captions map
/// to [`MessageKind::Caption`]. Anything else (stickers, audio, location)
/// yields a placeholder so the conversation never silently drops a message.
fn extract_text(msg: &waproto::whatsapp::Message) -> (String, MessageKind) {
    if let Some(text) = msg.conversation.as_deref().filter(|t| !t.is_empty()) {
        return (text.to_string(), MessageKind::Text);
    }
    if let Some(text) = msg
        .extended_text_message
        .as_ref()
        .and_then(|e| e.text.as_deref())
        .filter(|t| !t.is_empty())
    {
        return (text.to_string(), MessageKind::Text);
    }

    let caption = msg
        .image_message
        .as_ref()
        .and_then(|m| m.caption.as_deref())
        .or_else(|| {
            msg.video_message
                .as_ref()
                .and_then(|m| m.caption.as_deref())
        })
        .or_else(|| {
            msg.document_message
                .as_ref()
                .and_then(|m| m.caption.as_deref())
        })
        .filter(|t| !t.is_empty());

    match caption {
        Some(text) => (text.to_string(), MessageKind::Caption),
        None => (NON_TEXT_PLACEHOLDER.to_string(), MessageKind::NonText),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_plain_text() {
        let msg = waproto::whatsapp::Message {
            conversation: Some("dos tacos al pastor".to_string()),
            ..Default::default()
        };
        let (text, kind) = extract_text(&msg);
        assert_eq!(text, "dos tacos al pastor");
        assert_eq!(kind, MessageKind::Text);
    }

    #[test]
    fn test_extract_extended_text() {
        let msg = waproto::whatsapp::Message {
            extended_text_message: Some(Box::new(
                waproto::whatsapp::message::ExtendedTextMessage {
                    text: Some("con todo".to_string()),
                    ..Default::default()
                },
            )),
            ..Default::default()
        };
        let (text, kind) = extract_text(&msg);
        assert_eq!(text, "con todo");
        assert_eq!(kind, MessageKind::Text);
    }

    #[test]
    fn test_extract_image_caption() {
        let msg = waproto::whatsapp::Message {
            image_message: Some(Box::new(waproto::whatsapp::message::ImageMessage {
                caption: Some("como esta de la foto".to_string()),
                ..Default::default()
            })),
            ..Default::default()
        };
        let (text, kind) = extract_text(&msg);
        assert_eq!(text, "como esta de la foto");
        assert_eq!(kind, MessageKind::Caption);
    }

    #[test]
    fn test_inbound_timestamp_prefers_network_time() {
        let network = chrono::DateTime::from_timestamp(1700000000, 0).unwrap();
        assert_eq!(inbound_timestamp_ms(network), 1700000000000);
    }

    #[test]
    fn test_inbound_timestamp_falls_back_when_unstamped() {
        let before = chrono::Utc::now().timestamp_millis();
        let ts = inbound_timestamp_ms(chrono::DateTime::from_timestamp(0, 0).unwrap());
        assert!(ts >= before);
    }

    #[tokio::test]
    async fn test_stop_aborts_background_task() {
        let transport = WhatsAppTransport::new("/tmp/comanda-test-stop");
        let (held, released) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _held = held;
            std::future::pending::<()>().await;
        });
        *transport.bot_task.lock().await = Some(handle);

        transport.stop().await.unwrap();

        // The aborted task drops its end of the channel.
        assert!(released.await.is_err());
        assert!(transport.bot_task.lock().await.is_none());
    }

    #[test]
    fn test_extract_non_text_uses_placeholder() {
        let msg = waproto::whatsapp::Message::default();
        let (text, kind) = extract_text(&msg);
        assert_eq!(text, NON_TEXT_PLACEHOLDER);
        assert_eq!(kind, MessageKind::NonText);
    }
}
