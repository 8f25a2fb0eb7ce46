//! Message relays carrying feedback between identities.

use async_trait::async_trait;
use portline_core::RelayMessage;
use portline_storage::{Storage, StorageError};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Errors from sending a message.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The outbox could not be written
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The payload could not be encoded
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Delivers a payload from one identity to another on a channel.
#[async_trait]
pub trait MessageRelay: Send + Sync {
    /// Send `payload` from `from` to `to` on `channel_id`.
    async fn send(
        &self,
        channel_id: &str,
        from: &str,
        to: &str,
        payload: serde_json::Value,
    ) -> Result<(), RelayError>;
}

/// Relay that appends to the store's `messages` outbox.
#[derive(Clone)]
pub struct StorageRelay {
    storage: Arc<dyn Storage>,
}

impl StorageRelay {
    /// Create a relay writing to `storage`.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Messages on a channel, oldest first.
    pub async fn messages(&self, channel_id: &str) -> Result<Vec<RelayMessage>, RelayError> {
        Ok(self.storage.list_messages(channel_id).await?)
    }
}

#[async_trait]
impl MessageRelay for StorageRelay {
    async fn send(
        &self,
        channel_id: &str,
        from: &str,
        to: &str,
        payload: serde_json::Value,
    ) -> Result<(), RelayError> {
        let message = RelayMessage {
            channel_id: channel_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            payload,
            sent_at: chrono::Utc::now(),
        };
        self.storage.append_message(&message).await?;
        debug!("Relayed {} -> {} on {}", from, to, channel_id);
        Ok(())
    }
}

/// In-memory relay that keeps every message it is given.
#[derive(Default)]
pub struct RecordingRelay {
    messages: Mutex<Vec<RelayMessage>>,
}

impl RecordingRelay {
    /// Create an empty relay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far.
    pub async fn messages(&self) -> Vec<RelayMessage> {
        self.messages.lock().await.clone()
    }
}

#[async_trait]
impl MessageRelay for RecordingRelay {
    async fn send(
        &self,
        channel_id: &str,
        from: &str,
        to: &str,
        payload: serde_json::Value,
    ) -> Result<(), RelayError> {
        self.messages.lock().await.push(RelayMessage {
            channel_id: channel_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            payload,
            sent_at: chrono::Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portline_storage::SqliteStorage;

    #[tokio::test]
    async fn test_storage_relay_outbox() {
        let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let relay = StorageRelay::new(storage);

        relay
            .send("ch", "verifier", "impl", serde_json::json!({"iteration": 1}))
            .await
            .unwrap();
        relay
            .send("ch", "verifier", "impl", serde_json::json!({"iteration": 2}))
            .await
            .unwrap();

        let messages = relay.messages("ch").await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].payload["iteration"], 2);
        assert_eq!(messages[0].to, "impl");
    }
}
