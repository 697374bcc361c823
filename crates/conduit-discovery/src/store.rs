use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone)]
pub enum WatcherError {
    #[error("no node at path {0}")]
    NotFound(String),
    #[error("coordination store error: {0}")]
    Store(String),
}

/// Abstraction over a hierarchical coordination store (the kind backing service discovery in
/// most production RPC stacks: ZooKeeper-shaped, a child set per service path). Only the
/// operations the membership watcher needs are exposed.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn list_children(&self, path: &str) -> Result<Vec<String>, WatcherError>;

    async fn get_data(&self, child_path: &str) -> Result<Bytes, WatcherError>;

    /// Subscribes to the child set under `path`. Each send on the returned channel carries the
    /// *full* current set of child names, not a delta — the watcher itself diffs consecutive
    /// snapshots against what it already knows about.
    async fn watch_children(
        &self,
        path: &str,
    ) -> Result<mpsc::UnboundedReceiver<Vec<String>>, WatcherError>;
}

struct Inner {
    children: HashMap<String, Vec<String>>,
    data: HashMap<String, Bytes>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<Vec<String>>>>,
}

/// An in-memory `CoordinationStore` for tests and local development: the watcher's logic
/// doesn't care what backs the store, only that it speaks this trait.
pub struct InMemoryCoordinationStore {
    inner: Mutex<Inner>,
}

impl InMemoryCoordinationStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                children: HashMap::new(),
                data: HashMap::new(),
                subscribers: HashMap::new(),
            }),
        })
    }

    /// Publishes (or updates) a child node's data and notifies every active watcher of `path`.
    pub fn put_child(&self, path: &str, child: &str, data: impl Into<Bytes>) {
        let mut inner = self.inner.lock();
        let full_path = format!("{path}/{child}");
        inner.data.insert(full_path, data.into());
        let children = inner.children.entry(path.to_string()).or_default();
        if !children.iter().any(|c| c == child) {
            children.push(child.to_string());
        }
        let snapshot = children.clone();
        Self::notify(&mut inner, path, snapshot);
    }

    /// Removes a child node, simulating the member disappearing from the coordination store.
    pub fn remove_child(&self, path: &str, child: &str) {
        let mut inner = self.inner.lock();
        let full_path = format!("{path}/{child}");
        inner.data.remove(&full_path);
        if let Some(children) = inner.children.get_mut(path) {
            children.retain(|c| c != child);
        }
        let snapshot = inner.children.get(path).cloned().unwrap_or_default();
        Self::notify(&mut inner, path, snapshot);
    }

    /// Removes a child's data without first publishing its removal from the child list,
    /// modelling the "child vanishes between listing and fetch" race the watcher must
    /// tolerate.
    pub fn remove_data_only(&self, path: &str, child: &str) {
        let mut inner = self.inner.lock();
        inner.data.remove(&format!("{path}/{child}"));
    }

    fn notify(inner: &mut Inner, path: &str, snapshot: Vec<String>) {
        if let Some(subs) = inner.subscribers.get_mut(path) {
            subs.retain(|tx| tx.send(snapshot.clone()).is_ok());
        }
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn list_children(&self, path: &str) -> Result<Vec<String>, WatcherError> {
        Ok(self.inner.lock().children.get(path).cloned().unwrap_or_default())
    }

    async fn get_data(&self, child_path: &str) -> Result<Bytes, WatcherError> {
        self.inner
            .lock()
            .data
            .get(child_path)
            .cloned()
            .ok_or_else(|| WatcherError::NotFound(child_path.to_string()))
    }

    async fn watch_children(
        &self,
        path: &str,
    ) -> Result<mpsc::UnboundedReceiver<Vec<String>>, WatcherError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let current = inner.children.get(path).cloned().unwrap_or_default();
        let _ = tx.send(current);
        inner.subscribers.entry(path.to_string()).or_default().push(tx);
        Ok(rx)
    }
}

impl Default for InMemoryCoordinationStore {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                children: HashMap::new(),
                data: HashMap::new(),
                subscribers: HashMap::new(),
            }),
        }
    }
}
