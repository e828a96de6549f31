//! HTTP bridge to the ordering agent.
//!
//! Batched customer messages are forwarded to the agent's chat endpoint and
//! the agent's reply is relayed back over WhatsApp. The agent owns all order
//! semantics; this crate only speaks its HTTP contract.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use comanda_core::config::AgentConfig;
use comanda_core::error::ComandaError;
use comanda_core::message::Batch;
use comanda_core::sanitize::flatten_emphasis;

/// Request body for the agent chat endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub user_id: String,
    pub conversation_id: String,
    pub conversation_name: String,
    pub query: String,
    pub restaurant_name: String,
}

/// Response body from the agent chat endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub text: Option<String>,
}

/// Client for the ordering agent service.
#[derive(Clone)]
pub struct AgentBridge {
    client: reqwest::Client,
    config: AgentConfig,
}

impl AgentBridge {
    pub fn new(config: AgentConfig) -> Result<Self, ComandaError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ComandaError::Agent(e.to_string()))?;
        Ok(Self { client, config })
    }

    /// Forward a flushed batch to the agent and return the reply to relay.
    ///
    /// A response without text is mapped to the configured fallback reply, so
    /// the customer always hears something back. WhatsApp uses single-asterisk
    /// bold, so doubled emphasis markers in the reply are flattened.
    pub async fn ask(&self, batch: &Batch) -> Result<String, ComandaError> {
        let request = ChatRequest {
            user_id: batch.user_id.clone(),
            conversation_id: batch.conversation_id.clone(),
            conversation_name: batch.sender_label.clone(),
            query: batch.combined_query.clone(),
            restaurant_name: self.config.restaurant_name.clone(),
        };

        let url = format!(
            "{}/api/agent/chat/message",
            self.config.base_url.trim_end_matches('/')
        );

        tracing::debug!(
            user_id = %batch.user_id,
            messages = batch.message_count,
            "Forwarding batch to agent"
        );

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ComandaError::Agent(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ComandaError::Agent(format!(
                "agent returned {status}: {body}"
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ComandaError::Agent(format!("invalid response body: {e}")))?;

        if parsed.text.as_deref().map_or(true, |t| t.trim().is_empty()) {
            tracing::warn!(user_id = %batch.user_id, "Agent reply carried no text, using fallback");
        }
        Ok(select_reply(parsed.text, &self.config.fallback_reply))
    }
}

/// Pick the outbound reply: agent text when present, configured fallback
/// otherwise, with emphasis markers flattened for the channel.
fn select_reply(text: Option<String>, fallback: &str) -> String {
    match text {
        Some(text) if !text.trim().is_empty() => flatten_emphasis(&text),
        _ => fallback.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch() -> Batch {
        Batch {
            conversation_id: "5215512345678@s.whatsapp.net".to_string(),
            user_id: "5215512345678".to_string(),
            sender_label: "Ana".to_string(),
            combined_query: "hola\nquiero dos tacos".to_string(),
            message_count: 2,
        }
    }

    #[test]
    fn test_chat_request_shape() {
        let b = batch();
        let req = ChatRequest {
            user_id: b.user_id.clone(),
            conversation_id: b.conversation_id.clone(),
            conversation_name: b.sender_label.clone(),
            query: b.combined_query.clone(),
            restaurant_name: "go_papa".to_string(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["user_id"], "5215512345678");
        assert_eq!(json["conversation_name"], "Ana");
        assert_eq!(json["query"], "hola\nquiero dos tacos");
        assert_eq!(json["restaurant_name"], "go_papa");
    }

    #[test]
    fn test_select_reply_prefers_agent_text() {
        let reply = select_reply(Some("Tu **orden** va en camino".to_string()), "fallback");
        assert_eq!(reply, "Tu *orden* va en camino");
    }

    #[test]
    fn test_select_reply_falls_back_on_missing_or_blank() {
        assert_eq!(select_reply(None, "intente más tarde"), "intente más tarde");
        assert_eq!(
            select_reply(Some("   ".to_string()), "intente más tarde"),
            "intente más tarde"
        );
    }

    #[test]
    fn test_chat_response_tolerates_missing_text() {
        let parsed: ChatResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.text.is_none());

        let parsed: ChatResponse =
            serde_json::from_str(r#"{"text": "Listo, son $120", "extra": 1}"#).unwrap();
        assert_eq!(parsed.text.as_deref(), Some("Listo, son $120"));
    }
}
