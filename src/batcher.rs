//! Per-conversation inbound debounce batcher.
//!
//! Customers type orders as bursts of short messages. Instead of forwarding
//! each one, the batcher holds them per conversation and flushes the whole
//! burst once the sender has been quiet for the debounce window. Each new
//! arrival re-arms the window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use comanda_core::message::{Batch, InboundMessage};

struct PendingQueue {
    messages: Vec<InboundMessage>,
    /// Bumped on every re-arm; a fired timer whose epoch no longer matches
    /// lost the race and must abandon its flush.
    epoch: u64,
    timer: JoinHandle<()>,
}

/// Debounce batcher. Cheap to clone; all clones share the queue map.
#[derive(Clone)]
pub struct Batcher {
    queues: Arc<Mutex<HashMap<String, PendingQueue>>>,
    window: Duration,
    out: mpsc::Sender<Batch>,
}

impl Batcher {
    pub fn new(window: Duration, out: mpsc::Sender<Batch>) -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            window,
            out,
        }
    }

    /// Append a message to its conversation's queue and (re)arm the timer.
    pub async fn enqueue(&self, msg: InboundMessage) {
        let conversation_id = msg.conversation_id.clone();
        let mut queues = self.queues.lock().await;

        let epoch = match queues.get_mut(&conversation_id) {
            Some(queue) => {
                queue.epoch += 1;
                queue.messages.push(msg);
                queue.epoch
            }
            None => {
                queues.insert(
                    conversation_id.clone(),
                    PendingQueue {
                        messages: vec![msg],
                        epoch: 0,
                        // Placeholder, replaced below.
                        timer: tokio::spawn(async {}),
                    },
                );
                0
            }
        };

        let batcher = self.clone();
        let id = conversation_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(batcher.window).await;
            batcher.flush(&id, epoch).await;
        });

        if let Some(queue) = queues.get_mut(&conversation_id) {
            queue.timer.abort();
            queue.timer = timer;
        }
    }

    /// Detach and emit a conversation's queue if `epoch` still matches.
    async fn flush(&self, conversation_id: &str, epoch: u64) {
        let queue = {
            let mut queues = self.queues.lock().await;
            let current_epoch = match queues.get(conversation_id) {
                Some(queue) => queue.epoch,
                None => return,
            };
            if current_epoch != epoch {
                // Superseded by a later arrival.
                return;
            }
            queues.remove(conversation_id)
        };

        let Some(queue) = queue else { return };
        let Some(last) = queue.messages.last() else {
            return;
        };

        let batch = Batch {
            conversation_id: conversation_id.to_string(),
            user_id: last.sender_id.clone(),
            sender_label: last.sender_label.clone(),
            combined_query: queue
                .messages
                .iter()
                .map(|m| m.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
            message_count: queue.messages.len(),
        };

        debug!(
            conversation_id,
            messages = batch.message_count,
            "Flushing batch"
        );

        // The queue is already cleared: at-most-once, no re-queue.
        if self.out.send(batch).await.is_err() {
            warn!("Batch receiver dropped, discarding batch for {conversation_id}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comanda_core::message::MessageKind;

    fn msg(conversation: &str, text: &str) -> InboundMessage {
        InboundMessage {
            conversation_id: conversation.to_string(),
            sender_id: conversation.trim_end_matches("@s.whatsapp.net").to_string(),
            sender_label: "Cliente".to_string(),
            text: text.to_string(),
            timestamp_ms: 0,
            kind: MessageKind::Text,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_flushes_as_one_batch() {
        let (tx, mut rx) = mpsc::channel(8);
        let batcher = Batcher::new(Duration::from_millis(5000), tx);

        batcher.enqueue(msg("1@s.whatsapp.net", "hola")).await;
        batcher.enqueue(msg("1@s.whatsapp.net", "quiero dos tacos")).await;
        batcher.enqueue(msg("1@s.whatsapp.net", "con todo")).await;

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.combined_query, "hola\nquiero dos tacos\ncon todo");
        assert_eq!(batch.message_count, 3);
        assert_eq!(batch.user_id, "1");

        // Exactly one batch.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_conversations_flush_independently() {
        let (tx, mut rx) = mpsc::channel(8);
        let batcher = Batcher::new(Duration::from_millis(5000), tx);

        batcher.enqueue(msg("1@s.whatsapp.net", "orden uno")).await;
        batcher.enqueue(msg("2@s.whatsapp.net", "orden dos")).await;

        let mut queries: Vec<String> = vec![
            rx.recv().await.unwrap().combined_query,
            rx.recv().await.unwrap().combined_query,
        ];
        queries.sort();
        assert_eq!(queries, vec!["orden dos", "orden uno"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_arrival_extends_window() {
        let (tx, mut rx) = mpsc::channel(8);
        let batcher = Batcher::new(Duration::from_millis(5000), tx);

        batcher.enqueue(msg("1@s.whatsapp.net", "primero")).await;
        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert!(rx.try_recv().is_err());

        batcher.enqueue(msg("1@s.whatsapp.net", "segundo")).await;
        // 3s after the second message the original window would have lapsed,
        // but the re-armed one has not.
        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.combined_query, "primero\nsegundo");
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_flush_arrival_starts_fresh_queue() {
        let (tx, mut rx) = mpsc::channel(8);
        let batcher = Batcher::new(Duration::from_millis(5000), tx);

        batcher.enqueue(msg("1@s.whatsapp.net", "primera orden")).await;
        let first = rx.recv().await.unwrap();
        assert_eq!(first.combined_query, "primera orden");

        batcher.enqueue(msg("1@s.whatsapp.net", "segunda orden")).await;
        let second = rx.recv().await.unwrap();
        assert_eq!(second.combined_query, "segunda orden");
        assert_eq!(second.message_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_epoch_does_not_flush() {
        let (tx, mut rx) = mpsc::channel(8);
        let batcher = Batcher::new(Duration::from_millis(5000), tx);

        batcher.enqueue(msg("1@s.whatsapp.net", "uno")).await;
        // A flush carrying a stale epoch must be a no-op.
        batcher.flush("1@s.whatsapp.net", 99).await;
        assert!(rx.try_recv().is_err());

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.combined_query, "uno");
    }
}
