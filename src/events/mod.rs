use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::ServiceError;

/// Kind of movement document an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentKind {
    Receipt,
    DeliveryOrder,
    InternalTransfer,
    StockAdjustment,
}

/// Domain events published after a movement operation commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    ReceiptValidated {
        receipt_id: Uuid,
        receipt_number: String,
        warehouse_id: Uuid,
        product_ids: Vec<Uuid>,
        validated_at: DateTime<Utc>,
    },
    DeliveryOrderCreated {
        order_id: Uuid,
        order_number: String,
        warehouse_id: Uuid,
        reserved_units: i64,
    },
    DeliveryOrderValidated {
        order_id: Uuid,
        order_number: String,
        warehouse_id: Uuid,
        product_ids: Vec<Uuid>,
        validated_at: DateTime<Utc>,
    },
    DeliveryOrderCancelled {
        order_id: Uuid,
        order_number: String,
        released_units: i64,
    },
    TransferValidated {
        transfer_id: Uuid,
        transfer_number: String,
        from_warehouse_id: Uuid,
        to_warehouse_id: Uuid,
        product_ids: Vec<Uuid>,
        validated_at: DateTime<Utc>,
    },
    AdjustmentValidated {
        adjustment_id: Uuid,
        adjustment_number: String,
        warehouse_ids: Vec<Uuid>,
        product_ids: Vec<Uuid>,
        net_change: i64,
        validated_at: DateTime<Utc>,
    },
    DocumentCancelled {
        kind: DocumentKind,
        document_id: Uuid,
        document_number: String,
    },
}

impl Event {
    /// Whether this event changes on-hand stock and therefore stale dashboard figures.
    pub fn changes_stock(&self) -> bool {
        matches!(
            self,
            Event::ReceiptValidated { .. }
                | Event::DeliveryOrderValidated { .. }
                | Event::TransferValidated { .. }
                | Event::AdjustmentValidated { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::ReceiptValidated { .. } => "receipt_validated",
            Event::DeliveryOrderCreated { .. } => "delivery_order_created",
            Event::DeliveryOrderValidated { .. } => "delivery_order_validated",
            Event::DeliveryOrderCancelled { .. } => "delivery_order_cancelled",
            Event::TransferValidated { .. } => "transfer_validated",
            Event::AdjustmentValidated { .. } => "adjustment_validated",
            Event::DocumentCancelled { .. } => "document_cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), ServiceError> {
        self.sender
            .send(event)
            .await
            .map_err(|e| ServiceError::EventError(format!("Failed to send event: {}", e)))
    }

    /// Publishes a post-commit event without waiting for channel capacity.
    ///
    /// The operation that produced it has already committed, so a full or
    /// closed channel drops the event with a warning.
    pub fn send_or_log(&self, event: Event) {
        let name = event.name();
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(event = name, "Event channel full; dropping event after commit");
            }
            Err(TrySendError::Closed(_)) => {
                warn!(event = name, "Event channel closed; dropping event after commit");
            }
        }
    }
}

/// Consumer of published events (dashboard cache invalidation, notifications).
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: &Event) -> Result<(), String>;
}

/// Drains the channel, fanning each event out to every handler.
///
/// Handler failures are logged and never stop the loop.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, handlers: Vec<Arc<dyn EventHandler>>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        debug!(event = event.name(), "Received event: {:?}", event);

        for handler in &handlers {
            if let Err(e) = handler.handle_event(&event).await {
                error!(event = event.name(), error = %e, "Event handler failed");
            }
        }
    }

    info!("Event channel closed, stopping event processing loop");
}

/// Logs stock-changing events so dashboard caches know to refresh.
#[derive(Debug, Default)]
pub struct StockChangeLogger;

#[async_trait]
impl EventHandler for StockChangeLogger {
    async fn handle_event(&self, event: &Event) -> Result<(), String> {
        if event.changes_stock() {
            info!(event = event.name(), "Stock changed; dashboard figures are stale");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle_event(&self, event: &Event) -> Result<(), String> {
            self.seen.lock().await.push(event.name());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventHandler for Failing {
        async fn handle_event(&self, _event: &Event) -> Result<(), String> {
            Err("handler down".to_string())
        }
    }

    fn cancelled() -> Event {
        Event::DocumentCancelled {
            kind: DocumentKind::Receipt,
            document_id: Uuid::new_v4(),
            document_number: "REC-20240101-001".to_string(),
        }
    }

    #[tokio::test]
    async fn process_events_fans_out_and_survives_handler_errors() {
        let (tx, rx) = mpsc::channel(8);
        let sender = EventSender::new(tx);
        let recorder = Arc::new(Recorder::default());

        sender.send(cancelled()).await.unwrap();
        sender.send(cancelled()).await.unwrap();
        drop(sender);

        process_events(rx, vec![Arc::new(Failing), recorder.clone()]).await;

        assert_eq!(
            *recorder.seen.lock().await,
            vec!["document_cancelled", "document_cancelled"]
        );
    }

    #[tokio::test]
    async fn send_to_closed_channel_is_an_event_error() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);

        assert!(matches!(
            sender.send(cancelled()).await,
            Err(ServiceError::EventError(_))
        ));
        // Must not panic or block.
        sender.send_or_log(cancelled());
    }

    #[tokio::test]
    async fn send_or_log_drops_when_channel_is_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let sender = EventSender::new(tx);

        sender.send_or_log(cancelled());
        sender.send_or_log(cancelled());

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn only_validations_change_stock() {
        assert!(!cancelled().changes_stock());
        assert!(Event::ReceiptValidated {
            receipt_id: Uuid::new_v4(),
            receipt_number: "REC-20240101-002".into(),
            warehouse_id: Uuid::new_v4(),
            product_ids: vec![],
            validated_at: Utc::now(),
        }
        .changes_stock());
    }
}
