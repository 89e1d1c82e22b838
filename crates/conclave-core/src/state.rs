use std::collections::HashMap;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::Result;
use crate::traits::StateProvider;

/// Key layout used for externally visible state.
pub struct StateKey;

impl StateKey {
    pub fn agent(id: impl std::fmt::Display) -> String {
        format!("agent:{}", id)
    }

    pub fn system(id: impl std::fmt::Display) -> String {
        format!("system:{}", id)
    }

    pub fn task(id: impl std::fmt::Display) -> String {
        format!("task:{}", id)
    }
}

/// In-process state provider.
///
/// Each key is backed by a watch channel; deleting a key publishes `None`
/// and keeps the channel so existing watchers stay attached.
#[derive(Default)]
pub struct MemoryStateStore {
    entries: Mutex<HashMap<String, watch::Sender<Option<serde_json::Value>>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys that currently hold a value, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, tx)| tx.borrow().is_some())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    fn write(&self, key: &str, value: Option<serde_json::Value>) -> Option<serde_json::Value> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(tx) => tx.send_replace(value),
            None => {
                let (tx, _) = watch::channel(value);
                entries.insert(key.to_string(), tx);
                None
            }
        }
    }

    fn read(&self, key: &str) -> Option<serde_json::Value> {
        self.entries.lock().get(key).and_then(|tx| tx.borrow().clone())
    }
}

/// Shallow-merge `patch` into `base`. Non-object values are replaced.
pub fn merge_json(base: Option<serde_json::Value>, patch: serde_json::Value) -> serde_json::Value {
    match (base, patch) {
        (Some(serde_json::Value::Object(mut base)), serde_json::Value::Object(patch)) => {
            for (k, v) in patch {
                base.insert(k, v);
            }
            serde_json::Value::Object(base)
        }
        (_, patch) => patch,
    }
}

impl StateProvider for MemoryStateStore {
    fn get_state(&self, key: &str) -> BoxFuture<'_, Result<Option<serde_json::Value>>> {
        let value = self.read(key);
        Box::pin(async move { Ok(value) })
    }

    fn set_state(&self, key: &str, value: serde_json::Value) -> BoxFuture<'_, Result<()>> {
        self.write(key, Some(value));
        Box::pin(async { Ok(()) })
    }

    fn update_state(
        &self,
        key: &str,
        patch: serde_json::Value,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        let merged = {
            let mut entries = self.entries.lock();
            let tx = entries
                .entry(key.to_string())
                .or_insert_with(|| watch::channel(None).0);
            let merged = merge_json(tx.borrow().clone(), patch);
            tx.send_replace(Some(merged.clone()));
            merged
        };
        Box::pin(async move { Ok(merged) })
    }

    fn delete_state(&self, key: &str) -> BoxFuture<'_, Result<bool>> {
        let existed = self
            .entries
            .lock()
            .get(key)
            .map(|tx| tx.send_replace(None).is_some())
            .unwrap_or(false);
        Box::pin(async move { Ok(existed) })
    }

    fn watch_state(
        &self,
        key: &str,
    ) -> BoxFuture<'_, Result<watch::Receiver<Option<serde_json::Value>>>> {
        let rx = self
            .entries
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe();
        Box::pin(async move { Ok(rx) })
    }
}
