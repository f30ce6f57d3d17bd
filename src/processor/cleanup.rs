use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::domain::ConnectorMessageId;
use crate::error::Result;
use crate::queue::QueueHandler;
use crate::storage::Storage;

/// Consumer of the cleanup queue: drops the document of finished
/// business messages. Metadata, confirmations and transport history stay.
pub struct CleanupHandler {
    storage: Arc<dyn Storage>,
}

impl CleanupHandler {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        CleanupHandler { storage }
    }
}

#[async_trait]
impl QueueHandler<ConnectorMessageId> for CleanupHandler {
    async fn handle(&self, id: &ConnectorMessageId) -> Result<()> {
        self.storage.clear_message_content(id).await?;
        info!(connector_message_id = %id, "Cleaned up finished message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BusinessDomainId, Message, MessageContent, MessageDetails, MessageDirection};
    use crate::storage::MemoryStore;

    #[tokio::test]
    async fn test_document_dropped_content_kept() {
        let store = Arc::new(MemoryStore::new());
        let msg = Message::business(
            BusinessDomainId::default_lane(),
            MessageDetails::new(MessageDirection::GatewayToBackend),
            MessageContent::new("doc.xml", b"<doc/>".to_vec()),
        );
        store.persist_message(&msg).await.unwrap();

        CleanupHandler::new(store.clone())
            .handle(&msg.connector_message_id)
            .await
            .unwrap();

        let stored = store.get_message(&msg.connector_message_id).await.unwrap().unwrap();
        let content = stored.content.unwrap();
        assert_eq!(content.document_name, "doc.xml");
        assert!(content.document.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_message_is_retryable_error() {
        let handler = CleanupHandler::new(Arc::new(MemoryStore::new()));
        let err = handler.handle(&ConnectorMessageId::new("gone")).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
