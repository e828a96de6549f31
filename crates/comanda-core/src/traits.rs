use crate::{
    error::ComandaError,
    message::{DocumentPayload, InboundMessage},
};
use async_trait::async_trait;

/// Event emitted by a [`Transport`] while its connection runs.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A login challenge (QR payload) that must be scanned to authenticate.
    LoginChallenge(String),
    /// The connection is open and authenticated; sends may proceed.
    Connected,
    /// The connection closed. `logged_out` means the credentials were
    /// invalidated remotely and reconnecting is pointless.
    Closed { logged_out: bool },
    /// A normalized inbound message from a remote party.
    Inbound(InboundMessage),
}

/// Messaging-network transport — the opaque capability the session manager
/// drives.
///
/// The production implementation speaks the WhatsApp Web protocol; tests
/// inject fakes. `start` may be called again after a `Closed` event to
/// establish a fresh connection with the persisted credentials.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable transport name.
    fn name(&self) -> &str;

    /// Open a connection and stream its events until it closes.
    async fn start(&self) -> Result<tokio::sync::mpsc::Receiver<TransportEvent>, ComandaError>;

    /// Send a text message to a network address.
    async fn send_text(&self, target: &str, text: &str) -> Result<(), ComandaError>;

    /// Send a document attachment to a network address.
    async fn send_document(
        &self,
        target: &str,
        document: &DocumentPayload,
    ) -> Result<(), ComandaError>;

    /// Graceful shutdown.
    async fn stop(&self) -> Result<(), ComandaError>;
}
