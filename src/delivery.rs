//! Side channel that hands a result's content hash straight to the requester.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::DeliveryError;

/// Peer-to-peer delivery collaborator. Sends are fire-and-forget from the
/// scheduler's point of view.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn send(&self, recipient: &str, request_id: u64, payload: &str)
    -> Result<(), DeliveryError>;
}

/// Delivery that only logs what it would send.
#[derive(Debug, Default)]
pub struct LogDelivery;

#[async_trait]
impl Delivery for LogDelivery {
    async fn send(
        &self,
        recipient: &str,
        request_id: u64,
        payload: &str,
    ) -> Result<(), DeliveryError> {
        info!(recipient = %recipient, request_id, payload = %payload, "Delivering result");
        Ok(())
    }
}

/// One message handed to [`RecordingDelivery`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    pub recipient: String,
    pub request_id: u64,
    pub payload: String,
}

/// Delivery that keeps every message in memory.
#[derive(Debug, Default)]
pub struct RecordingDelivery {
    sent: Mutex<Vec<DeliveredMessage>>,
}

impl RecordingDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<DeliveredMessage> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Delivery for RecordingDelivery {
    async fn send(
        &self,
        recipient: &str,
        request_id: u64,
        payload: &str,
    ) -> Result<(), DeliveryError> {
        self.sent.lock().await.push(DeliveredMessage {
            recipient: recipient.to_string(),
            request_id,
            payload: payload.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_messages() {
        let delivery = RecordingDelivery::new();
        delivery.send("0xabc", 3, "f0170").await.unwrap();
        LogDelivery.send("0xabc", 3, "f0170").await.unwrap();

        let sent = delivery.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].request_id, 3);
        assert_eq!(sent[0].recipient, "0xabc");
    }
}
