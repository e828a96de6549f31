//! Gateway wiring: session events -> batcher -> agent -> outbound replies.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use comanda_agent::AgentBridge;
use comanda_core::config::Config;
use comanda_core::message::Batch;
use comanda_history::HistoryStore;
use comanda_whatsapp::{generate_qr_terminal, jid_user};

use crate::batcher::Batcher;
use crate::control::{self, ControlState};
use crate::menu::MenuPolicy;
use crate::session::{Session, SessionEvent};

pub struct Gateway {
    config: Config,
    session: Arc<Session>,
    agent: AgentBridge,
    menu: Arc<MenuPolicy>,
    history: HistoryStore,
}

impl Gateway {
    pub fn new(
        config: Config,
        session: Arc<Session>,
        agent: AgentBridge,
        menu: Arc<MenuPolicy>,
        history: HistoryStore,
    ) -> Self {
        Self {
            config,
            session,
            agent,
            menu,
            history,
        }
    }

    /// Run until the messaging session is terminally logged out.
    pub async fn run(&self) -> anyhow::Result<()> {
        let control_state = ControlState::new(
            self.session.clone(),
            self.menu.clone(),
            self.history.clone(),
            self.config.control.recent_buffer,
        );

        let control_config = self.config.control.clone();
        let control_for_server = control_state.clone();
        tokio::spawn(async move {
            if let Err(e) = control::serve(&control_config, control_for_server).await {
                error!("Control server exited: {e}");
            }
        });

        let (batch_tx, mut batch_rx) = mpsc::channel::<Batch>(64);
        let batcher = Batcher::new(
            std::time::Duration::from_millis(self.config.gateway.debounce_ms),
            batch_tx,
        );

        let (event_tx, mut event_rx) = mpsc::channel::<SessionEvent>(64);
        let session_runner = self.session.clone();
        tokio::spawn(async move {
            if let Err(e) = session_runner.run(event_tx).await {
                error!("Session ended with error: {e}");
            }
        });

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else {
                        // Session task ended (logged out): shut down.
                        break;
                    };
                    self.handle_session_event(event, &batcher, &control_state).await;
                }
                batch = batch_rx.recv() => {
                    let Some(batch) = batch else { break };
                    self.dispatch_batch(batch);
                }
            }
        }

        info!("Gateway shutting down");
        Ok(())
    }

    async fn handle_session_event(
        &self,
        event: SessionEvent,
        batcher: &Batcher,
        control: &ControlState,
    ) {
        match event {
            SessionEvent::Qr(code) => {
                match generate_qr_terminal(&code) {
                    Ok(rendered) => info!("Scan to pair:\n{rendered}"),
                    Err(e) => warn!("Could not render QR: {e}"),
                }
                control.broadcast_qr(&code);
            }
            SessionEvent::Status(status) => {
                control.broadcast_status(status);
            }
            SessionEvent::Inbound(msg) => {
                control.publish_inbound(&msg).await;
                batcher.enqueue(msg).await;
            }
        }
    }

    /// One task per batch so a slow conversation never stalls the others.
    fn dispatch_batch(&self, batch: Batch) {
        let session = self.session.clone();
        let agent = self.agent.clone();
        let menu = self.menu.clone();
        let history = self.history.clone();

        tokio::spawn(async move {
            menu.send_if_due(&session, &batch.conversation_id, &batch.user_id)
                .await;

            let reply = match agent.ask(&batch).await {
                Ok(reply) => reply,
                Err(e) => {
                    error!(
                        conversation_id = %batch.conversation_id,
                        "Agent request failed, dropping batch: {e}"
                    );
                    return;
                }
            };

            match session.send_text(&batch.conversation_id, &reply).await {
                Ok(()) => {
                    let user_id = jid_user(&batch.conversation_id);
                    if let Err(e) = history.record_exchange(user_id, &batch.conversation_id).await
                    {
                        warn!("Failed to record exchange for {user_id}: {e}");
                    }
                }
                Err(e) => {
                    // The batch is already consumed; the customer gets no
                    // reply for it rather than a duplicate later.
                    error!(
                        conversation_id = %batch.conversation_id,
                        "Reply delivery failed, batch dropped: {e}"
                    );
                }
            }
        });
    }
}
