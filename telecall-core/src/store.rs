//! Backing store contracts for signaling
//!
//! Two primitives back the signaling channel: a document store for the
//! rarely-mutated call document, and an append-only log for candidate bursts.
//! Both deliver existing state to new subscribers before live updates.
//!
//! [`MemoryStore`] implements both in process. It is what the loopback tool and
//! the tests run against; a deployment injects its own hosted backend through
//! the same traits.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;

/// Store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend could not be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Backend rejected the operation
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Raw feed of store values. Document feeds carry the whole document
/// (`Value::Null` when absent); child feeds carry one child per message.
pub type RawFeed = mpsc::UnboundedReceiver<Value>;

/// Document read/write primitives keyed by path
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read a document
    async fn get(&self, path: &str) -> Result<Option<Map<String, Value>>, StoreError>;

    /// Merge fields into a document, creating it if missing.
    /// Fields not named in `fields` are left untouched.
    async fn merge(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError>;

    /// Watch a document: current state first, then every change
    async fn watch(&self, path: &str) -> Result<RawFeed, StoreError>;

    /// Delete a document
    async fn delete(&self, path: &str) -> Result<(), StoreError>;
}

/// Append-only, low-latency list primitives keyed by path
#[async_trait]
pub trait AppendLog: Send + Sync {
    /// Append a child, returning its generated key
    async fn push(&self, path: &str, value: Value) -> Result<String, StoreError>;

    /// Watch children: every existing child first, then each new one
    async fn watch_children(&self, path: &str) -> Result<RawFeed, StoreError>;

    /// Remove a path and everything below it
    async fn remove(&self, path: &str) -> Result<(), StoreError>;
}

/// Decoded subscription over a raw feed.
///
/// Once [`Subscription::cancel`] returns, `recv` yields `None` forever, even if
/// the backend had already queued more values.
pub struct Subscription<T> {
    feed: RawFeed,
    decode: Box<dyn Fn(Value) -> Option<T> + Send + Sync>,
    cancelled: bool,
}

impl<T> Subscription<T> {
    /// Wrap a raw feed with a decoder; values the decoder rejects are skipped
    pub fn new(feed: RawFeed, decode: impl Fn(Value) -> Option<T> + Send + Sync + 'static) -> Self {
        Self {
            feed,
            decode: Box::new(decode),
            cancelled: false,
        }
    }

    /// Next decoded value, or `None` once cancelled or the feed ends
    pub async fn recv(&mut self) -> Option<T> {
        while !self.cancelled {
            let raw = self.feed.recv().await?;
            if let Some(value) = (self.decode)(raw) {
                return Some(value);
            }
        }
        None
    }

    /// Stop delivery; safe to call more than once
    pub fn cancel(&mut self) {
        if !self.cancelled {
            self.cancelled = true;
            self.feed.close();
        }
    }

    /// Whether `cancel` has been called
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

#[derive(Default)]
struct MemoryState {
    documents: HashMap<String, Map<String, Value>>,
    document_watchers: HashMap<String, Vec<mpsc::UnboundedSender<Value>>>,
    logs: HashMap<String, Vec<Value>>,
    log_watchers: HashMap<String, Vec<mpsc::UnboundedSender<Value>>>,
    next_key: u64,
    merges: usize,
    offline: bool,
}

impl MemoryState {
    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline {
            Err(StoreError::Unavailable("memory store is offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn document_value(&self, path: &str) -> Value {
        self.documents
            .get(path)
            .map_or(Value::Null, |doc| Value::Object(doc.clone()))
    }

    fn notify_document(&mut self, path: &str) {
        let value = self.document_value(path);
        if let Some(watchers) = self.document_watchers.get_mut(path) {
            watchers.retain(|tx| tx.send(value.clone()).is_ok());
        }
    }
}

/// In-process document store and append log
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with `StoreError::Unavailable`
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Number of successful document merges so far
    #[must_use]
    pub fn merge_count(&self) -> usize {
        self.state.lock().merges
    }

    /// Number of children currently stored under a log path
    #[must_use]
    pub fn child_count(&self, path: &str) -> usize {
        self.state.lock().logs.get(path).map_or(0, Vec::len)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Map<String, Value>>, StoreError> {
        let state = self.state.lock();
        state.check_online()?;
        Ok(state.documents.get(path).cloned())
    }

    async fn merge(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.check_online()?;
        state
            .documents
            .entry(path.to_string())
            .or_default()
            .extend(fields);
        state.merges += 1;
        state.notify_document(path);
        Ok(())
    }

    async fn watch(&self, path: &str) -> Result<RawFeed, StoreError> {
        let mut state = self.state.lock();
        state.check_online()?;
        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(state.document_value(path)).is_ok() {
            state
                .document_watchers
                .entry(path.to_string())
                .or_default()
                .push(tx);
        }
        Ok(rx)
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.check_online()?;
        if state.documents.remove(path).is_some() {
            state.notify_document(path);
        }
        Ok(())
    }
}

#[async_trait]
impl AppendLog for MemoryStore {
    async fn push(&self, path: &str, value: Value) -> Result<String, StoreError> {
        let mut state = self.state.lock();
        state.check_online()?;
        state.next_key += 1;
        let key = format!("{:020}", state.next_key);
        state
            .logs
            .entry(path.to_string())
            .or_default()
            .push(value.clone());
        if let Some(watchers) = state.log_watchers.get_mut(path) {
            watchers.retain(|tx| tx.send(value.clone()).is_ok());
        }
        Ok(key)
    }

    async fn watch_children(&self, path: &str) -> Result<RawFeed, StoreError> {
        let mut state = self.state.lock();
        state.check_online()?;
        let (tx, rx) = mpsc::unbounded_channel();
        for child in state.logs.get(path).into_iter().flatten() {
            // Receiver is still in scope, so this cannot fail
            let _ = tx.send(child.clone());
        }
        state
            .log_watchers
            .entry(path.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.check_online()?;
        let prefix = format!("{path}/");
        state
            .logs
            .retain(|key, _| key != path && !key.starts_with(&prefix));
        Ok(())
    }
}
