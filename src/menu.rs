//! Onboarding menu policy.
//!
//! New customers (and returning ones after a long silence) get the menu PDF
//! before their order is answered. The decision is a pure function over the
//! last recorded interaction; delivery failures never block the reply path.

use chrono::{DateTime, Duration, Utc};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use comanda_core::config::{shellexpand, MenuConfig};
use comanda_core::error::ComandaError;
use comanda_core::message::DocumentPayload;
use comanda_history::HistoryStore;

use crate::session::Session;

/// True when a customer should receive the menu: never seen before, or idle
/// for at least `resend_after`.
pub fn menu_due(
    last_interaction: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    resend_after: Duration,
) -> bool {
    match last_interaction {
        None => true,
        Some(last) => now - last >= resend_after,
    }
}

/// Read the configured menu file into a sendable document.
pub fn load_menu(config: &MenuConfig) -> Result<DocumentPayload, ComandaError> {
    let path = shellexpand(&config.path);
    let bytes = std::fs::read(&path)?;
    let file_name = Path::new(&path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("menu.pdf")
        .to_string();
    let mimetype = match Path::new(&path).extension().and_then(|e| e.to_str()) {
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
    .to_string();

    Ok(DocumentPayload {
        bytes,
        file_name,
        mimetype,
        caption: config.caption.clone(),
    })
}

/// Applies the menu policy for one conversation.
pub struct MenuPolicy {
    config: MenuConfig,
    history: HistoryStore,
}

impl MenuPolicy {
    pub fn new(config: MenuConfig, history: HistoryStore) -> Self {
        Self { config, history }
    }

    /// Whether `user_id` is due the menu. History errors fail closed.
    pub async fn should_send(&self, user_id: &str) -> bool {
        let last = match self.history.last_interaction(user_id).await {
            Ok(last) => last,
            Err(e) => {
                warn!("History lookup failed for {user_id}, skipping menu: {e}");
                return false;
            }
        };
        menu_due(last, Utc::now(), Duration::hours(self.config.resend_after_hours))
    }

    /// Send the menu if due. Every failure is logged and swallowed so the
    /// text reply always proceeds.
    pub async fn send_if_due(&self, session: &Arc<Session>, conversation_id: &str, user_id: &str) {
        if !self.should_send(user_id).await {
            return;
        }

        let document = match load_menu(&self.config) {
            Ok(document) => document,
            Err(e) => {
                warn!("Could not load menu file '{}': {e}", self.config.path);
                return;
            }
        };

        match session.send_document(conversation_id, &document).await {
            Ok(()) => info!("Menu sent to {user_id}"),
            Err(e) => warn!("Menu delivery to {user_id} failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hours(h: i64) -> Duration {
        Duration::hours(h)
    }

    #[test]
    fn test_menu_due_for_new_customer() {
        assert!(menu_due(None, Utc::now(), hours(24)));
    }

    #[test]
    fn test_menu_due_after_idle_period() {
        let now = Utc::now();
        assert!(menu_due(Some(now - hours(25)), now, hours(24)));
        assert!(menu_due(Some(now - hours(24)), now, hours(24)));
    }

    #[test]
    fn test_menu_not_due_for_recent_customer() {
        let now = Utc::now();
        assert!(!menu_due(Some(now - hours(1)), now, hours(24)));
        assert!(!menu_due(Some(now - hours(23)), now, hours(24)));
    }

    #[tokio::test]
    async fn test_should_send_tracks_history() {
        let history = HistoryStore::in_memory().await.unwrap();
        let policy = MenuPolicy::new(MenuConfig::default(), history.clone());

        assert!(policy.should_send("5215512345678").await);

        history
            .record_exchange("5215512345678", "5215512345678@s.whatsapp.net")
            .await
            .unwrap();
        assert!(!policy.should_send("5215512345678").await);
    }

    #[test]
    fn test_load_menu_missing_file() {
        let config = MenuConfig {
            path: "/nonexistent/menu.pdf".to_string(),
            ..MenuConfig::default()
        };
        assert!(load_menu(&config).is_err());
    }
}
