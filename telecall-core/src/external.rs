//! Collaborators outside the call core
//!
//! The core writes an "active call" flag on the chat record and asks someone
//! else to notify the callee. Failures of either are logged by the caller and
//! never affect the call.

use crate::identity::{CallId, CallParticipants};
use crate::store::DocumentStore;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Collection holding chat records
pub const CHATS_COLLECTION: &str = "chats";

/// Field carrying the flag on a chat record
pub const ACTIVE_CALL_FIELD: &str = "activeCall";

/// Write target for the "call in progress" flag
#[async_trait]
pub trait ActiveCallFlag: Send + Sync {
    /// Record whether a call is in progress
    async fn set_active(&self, call_id: &CallId, active: bool) -> anyhow::Result<()>;
}

/// Flag stored as a merged field on `chats/{call_id}`
pub struct DocumentActiveCallFlag {
    documents: Arc<dyn DocumentStore>,
}

impl DocumentActiveCallFlag {
    /// Write the flag through `documents`
    #[must_use]
    pub fn new(documents: Arc<dyn DocumentStore>) -> Self {
        Self { documents }
    }

    /// Path of the chat record for a call
    #[must_use]
    pub fn chat_path(call_id: &CallId) -> String {
        format!("{CHATS_COLLECTION}/{call_id}")
    }
}

#[async_trait]
impl ActiveCallFlag for DocumentActiveCallFlag {
    async fn set_active(&self, call_id: &CallId, active: bool) -> anyhow::Result<()> {
        let mut fields = Map::new();
        fields.insert(ACTIVE_CALL_FIELD.to_string(), Value::Bool(active));
        self.documents.merge(&Self::chat_path(call_id), fields).await?;
        Ok(())
    }
}

/// Fire-and-forget "a call is starting" notification
#[async_trait]
pub trait CalleeNotifier: Send + Sync {
    /// Tell the remote participant that `participants.local` is calling
    async fn notify_incoming(
        &self,
        call_id: &CallId,
        participants: &CallParticipants,
    ) -> anyhow::Result<()>;
}

/// Notifier that does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl CalleeNotifier for NoopNotifier {
    async fn notify_incoming(&self, _: &CallId, _: &CallParticipants) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_flag_merges_into_chat_record() {
        let store = Arc::new(MemoryStore::new());
        let call_id = CallId::new("doc1_pat2");
        let path = DocumentActiveCallFlag::chat_path(&call_id);

        let mut existing = Map::new();
        existing.insert("lastMessage".to_string(), json!("see you soon"));
        store.merge(&path, existing).await.unwrap();

        let flag = DocumentActiveCallFlag::new(store.clone());
        flag.set_active(&call_id, true).await.unwrap();
        let doc = store.get(&path).await.unwrap().unwrap();
        assert_eq!(doc.get(ACTIVE_CALL_FIELD), Some(&json!(true)));
        assert_eq!(doc.get("lastMessage"), Some(&json!("see you soon")));

        flag.set_active(&call_id, false).await.unwrap();
        let doc = store.get(&path).await.unwrap().unwrap();
        assert_eq!(doc.get(ACTIVE_CALL_FIELD), Some(&json!(false)));
    }

    #[tokio::test]
    async fn test_flag_surfaces_store_failure() {
        let store = Arc::new(MemoryStore::new());
        store.set_offline(true);
        let flag = DocumentActiveCallFlag::new(store);
        assert!(flag.set_active(&CallId::new("a_b"), true).await.is_err());
    }
}
