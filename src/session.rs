//! Messaging session supervisor.
//!
//! Owns the single transport connection, restarts it with backoff when it
//! drops, and exposes bounded, state-checked send operations. All state
//! transitions happen here; the rest of the gateway only observes them
//! through [`SessionEvent`]s.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use comanda_core::error::{ComandaError, SendError};
use comanda_core::message::{DocumentPayload, InboundMessage};
use comanda_core::traits::{Transport, TransportEvent};

const INITIAL_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 60;

/// Connection lifecycle state. `LoggedOut` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
    LoggedOut,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::LoggedOut => "logged_out",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Events the session surfaces to the gateway.
#[derive(Debug)]
pub enum SessionEvent {
    /// Pairing QR payload (rotates until scanned).
    Qr(String),
    Status(SessionStatus),
    Inbound(InboundMessage),
}

/// Supervisor for one messaging session.
pub struct Session {
    transport: Arc<dyn Transport>,
    state: Arc<Mutex<SessionStatus>>,
    send_timeout: Duration,
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>, send_timeout: Duration) -> Self {
        Self {
            transport,
            state: Arc::new(Mutex::new(SessionStatus::Disconnected)),
            send_timeout,
        }
    }

    pub async fn status(&self) -> SessionStatus {
        *self.state.lock().await
    }

    async fn set_status(
        &self,
        status: SessionStatus,
        events: &mpsc::Sender<SessionEvent>,
    ) {
        *self.state.lock().await = status;
        let _ = events.send(SessionEvent::Status(status)).await;
    }

    /// Run the session until it is logged out.
    ///
    /// Transport drops that are not logouts are retried with exponential
    /// backoff; the backoff resets on every successful connect.
    pub async fn run(&self, events: mpsc::Sender<SessionEvent>) -> Result<(), ComandaError> {
        let mut backoff_secs = INITIAL_BACKOFF_SECS;

        loop {
            self.set_status(SessionStatus::Connecting, &events).await;

            let mut rx = match self.transport.start().await {
                Ok(rx) => rx,
                Err(e) => {
                    error!("{} transport failed to start: {e}", self.transport.name());
                    self.set_status(SessionStatus::Disconnected, &events).await;
                    tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                    continue;
                }
            };

            let mut logged_out = false;

            while let Some(event) = rx.recv().await {
                match event {
                    TransportEvent::LoginChallenge(code) => {
                        let _ = events.send(SessionEvent::Qr(code)).await;
                    }
                    TransportEvent::Connected => {
                        backoff_secs = INITIAL_BACKOFF_SECS;
                        self.set_status(SessionStatus::Connected, &events).await;
                    }
                    TransportEvent::Closed { logged_out: out } => {
                        logged_out = out;
                        break;
                    }
                    TransportEvent::Inbound(msg) => {
                        let _ = events.send(SessionEvent::Inbound(msg)).await;
                    }
                }
            }

            let _ = self.transport.stop().await;

            if logged_out {
                warn!("Session logged out, not reconnecting. Re-pair to continue.");
                self.set_status(SessionStatus::LoggedOut, &events).await;
                return Ok(());
            }

            self.set_status(SessionStatus::Disconnected, &events).await;
            info!("Transport closed, reconnecting in {backoff_secs}s");
            tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
            backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
        }
    }

    /// Send a text message, bounded by the configured timeout.
    pub async fn send_text(&self, target: &str, text: &str) -> Result<(), SendError> {
        self.check_connected().await?;
        match tokio::time::timeout(self.send_timeout, self.transport.send_text(target, text)).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SendError::Transport(e.to_string())),
            Err(_) => Err(SendError::Timeout(self.send_timeout.as_secs())),
        }
    }

    /// Send a document attachment, bounded by the configured timeout.
    pub async fn send_document(
        &self,
        target: &str,
        document: &DocumentPayload,
    ) -> Result<(), SendError> {
        self.check_connected().await?;
        match tokio::time::timeout(
            self.send_timeout,
            self.transport.send_document(target, document),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SendError::Transport(e.to_string())),
            Err(_) => Err(SendError::Timeout(self.send_timeout.as_secs())),
        }
    }

    async fn check_connected(&self) -> Result<(), SendError> {
        if !self.state.lock().await.is_connected() {
            return Err(SendError::NotConnected);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use comanda_core::message::MessageKind;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Scriptable transport for session tests.
    struct FakeTransport {
        script: Mutex<Option<Vec<TransportEvent>>>,
        /// If set, sends hang long enough to trip the session timeout.
        slow_sends: AtomicBool,
        starts: AtomicUsize,
        /// Keeps the event channel open after the script is drained.
        hold: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    }

    impl FakeTransport {
        fn scripted(events: Vec<TransportEvent>) -> Self {
            Self {
                script: Mutex::new(Some(events)),
                slow_sends: AtomicBool::new(false),
                starts: AtomicUsize::new(0),
                hold: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn name(&self) -> &str {
            "fake"
        }

        async fn start(&self) -> Result<mpsc::Receiver<TransportEvent>, ComandaError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(16);
            let events = self.script.lock().await.take().unwrap_or_default();
            for event in events {
                let _ = tx.send(event).await;
            }
            *self.hold.lock().await = Some(tx);
            Ok(rx)
        }

        async fn send_text(&self, _target: &str, _text: &str) -> Result<(), ComandaError> {
            if self.slow_sends.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
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

    fn inbound(text: &str) -> InboundMessage {
        InboundMessage {
            conversation_id: "1@s.whatsapp.net".to_string(),
            sender_id: "1".to_string(),
            sender_label: "Test".to_string(),
            text: text.to_string(),
            timestamp_ms: 0,
            kind: MessageKind::Text,
        }
    }

    #[tokio::test]
    async fn test_send_fails_fast_when_disconnected() {
        let transport = Arc::new(FakeTransport::scripted(vec![]));
        let session = Session::new(transport, Duration::from_secs(25));

        let err = session.send_text("1@s.whatsapp.net", "hola").await;
        assert!(matches!(err, Err(SendError::NotConnected)));
    }

    #[tokio::test]
    async fn test_logged_out_close_is_terminal() {
        let transport = Arc::new(FakeTransport::scripted(vec![
            TransportEvent::Connected,
            TransportEvent::Closed { logged_out: true },
        ]));
        let session = Session::new(transport, Duration::from_secs(25));
        let (tx, mut rx) = mpsc::channel(16);

        // run() must return instead of looping on reconnect.
        session.run(tx).await.unwrap();
        assert_eq!(session.status().await, SessionStatus::LoggedOut);

        let mut saw_connected = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SessionEvent::Status(SessionStatus::Connected)) {
                saw_connected = true;
            }
        }
        assert!(saw_connected);
    }

    #[tokio::test]
    async fn test_inbound_events_are_forwarded() {
        let transport = Arc::new(FakeTransport::scripted(vec![
            TransportEvent::Connected,
            TransportEvent::Inbound(inbound("dos tacos")),
            TransportEvent::Closed { logged_out: true },
        ]));
        let session = Session::new(transport, Duration::from_secs(25));
        let (tx, mut rx) = mpsc::channel(16);

        session.run(tx).await.unwrap();

        let mut texts = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::Inbound(msg) = event {
                texts.push(msg.text);
            }
        }
        assert_eq!(texts, vec!["dos tacos"]);
    }

    #[tokio::test]
    async fn test_send_while_connected_succeeds() {
        let transport = Arc::new(FakeTransport::scripted(vec![TransportEvent::Connected]));
        let session = Arc::new(Session::new(transport, Duration::from_secs(25)));
        let (tx, _rx) = mpsc::channel(16);

        let runner = session.clone();
        tokio::spawn(async move {
            let _ = runner.run(tx).await;
        });

        // Wait for the session to pick up the Connected event.
        for _ in 0..50 {
            if session.status().await.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        session
            .send_text("1@s.whatsapp.net", "hola")
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_logout_close_triggers_reconnect() {
        let transport = Arc::new(FakeTransport::scripted(vec![
            TransportEvent::Connected,
            TransportEvent::Closed { logged_out: false },
        ]));
        let session = Arc::new(Session::new(transport.clone(), Duration::from_secs(25)));
        let (tx, _rx) = mpsc::channel(64);

        let runner = session.clone();
        let handle = tokio::spawn(async move {
            let _ = runner.run(tx).await;
        });

        // Paused time advances through the backoff; the transport must be
        // started again after the non-logout close.
        for _ in 0..100 {
            if transport.starts.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(transport.starts.load(Ordering::SeqCst) >= 2);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_send_maps_to_timeout() {
        let transport = Arc::new(FakeTransport::scripted(vec![TransportEvent::Connected]));
        transport.slow_sends.store(true, Ordering::SeqCst);
        let session = Arc::new(Session::new(transport, Duration::from_secs(25)));
        let (tx, _rx) = mpsc::channel(16);

        let runner = session.clone();
        tokio::spawn(async move {
            let _ = runner.run(tx).await;
        });
        while !session.status().await.is_connected() {
            tokio::task::yield_now().await;
        }

        let err = session.send_text("1@s.whatsapp.net", "hola").await;
        assert!(matches!(err, Err(SendError::Timeout(25))));
    }
}
