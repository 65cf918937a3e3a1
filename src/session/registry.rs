//! Streaming subscriptions keyed by channel and topic.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::protocol::{InboundFrame, SubscriptionKey};

/// Watcher buffer per subscription
const WATCHER_CAPACITY: usize = 1000;

/// What a watcher observes on its subscription
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// A new value; also stored as the subscription's last value
    Update(Value),
    /// The connection dropped; the subscription no longer exists
    Stale,
    /// The subscription was removed, with the reason
    Ended(String),
}

struct SubscriptionEntry {
    /// Distinguishes this entry from a later one under the same key
    epoch: u64,
    stream_id: Option<String>,
    last_value: Arc<RwLock<Option<Value>>>,
    sender: broadcast::Sender<SubscriptionEvent>,
}

/// One watcher of a subscription
pub struct SubscriptionHandle {
    key: SubscriptionKey,
    epoch: u64,
    receiver: broadcast::Receiver<SubscriptionEvent>,
    last_value: Arc<RwLock<Option<Value>>>,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Next event; `None` once the subscription is gone and drained
    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(key = %self.key, skipped, "Watcher lagged; skipping updates");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Most recent value delivered to the subscription
    pub fn last_value(&self) -> Option<Value> {
        self.last_value
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Active subscriptions, their last values and watchers
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: DashMap<SubscriptionKey, SubscriptionEntry>,
    by_stream: DashMap<String, SubscriptionKey>,
    next_epoch: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch `key`, creating the subscription if absent.
    ///
    /// The flag is true when this call created it; only the creator
    /// sends the subscribe request.
    pub fn attach(&self, key: &SubscriptionKey) -> (SubscriptionHandle, bool) {
        let mut created = false;
        let entry = self.entries.entry(key.clone()).or_insert_with(|| {
            created = true;
            let (sender, _) = broadcast::channel(WATCHER_CAPACITY);
            SubscriptionEntry {
                epoch: self.next_epoch.fetch_add(1, Ordering::Relaxed),
                stream_id: None,
                last_value: Arc::new(RwLock::new(None)),
                sender,
            }
        });

        let handle = SubscriptionHandle {
            key: key.clone(),
            epoch: entry.epoch,
            receiver: entry.sender.subscribe(),
            last_value: Arc::clone(&entry.last_value),
        };
        (handle, created)
    }

    /// Bind the subscribe response to the entry created for it.
    ///
    /// Records the stream id and delivers the response body as the first
    /// value. False when that entry was removed or replaced meanwhile.
    pub(crate) fn confirm(
        &self,
        key: &SubscriptionKey,
        epoch: u64,
        stream_id: Option<&str>,
        value: Value,
    ) -> bool {
        let Some(mut entry) = self.entries.get_mut(key) else {
            return false;
        };
        if entry.epoch != epoch {
            return false;
        }
        if let Some(id) = stream_id {
            entry.stream_id = Some(id.to_string());
            self.by_stream.insert(id.to_string(), key.clone());
        }
        *entry
            .last_value
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(value.clone());
        let _ = entry.sender.send(SubscriptionEvent::Update(value));
        true
    }

    pub fn stream_id(&self, key: &SubscriptionKey) -> Option<String> {
        self.entries.get(key).and_then(|e| e.stream_id.clone())
    }

    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn last_value(&self, key: &SubscriptionKey) -> Option<Value> {
        self.entries.get(key).and_then(|e| {
            e.last_value
                .read()
                .unwrap_or_else(|p| p.into_inner())
                .clone()
        })
    }

    pub fn keys(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<SubscriptionKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hand a push frame to its subscription; false when nothing matches
    pub fn route(&self, frame: &InboundFrame) -> bool {
        let by_id = frame
            .subscription_id
            .as_ref()
            .and_then(|id| self.by_stream.get(id).map(|k| k.clone()));
        let key = match by_id.or_else(|| frame.stream_key()) {
            Some(key) => key,
            None => return false,
        };
        self.deliver(&key, frame.body.clone())
    }

    /// Store `value` as last value, then notify watchers
    pub fn deliver(&self, key: &SubscriptionKey, value: Value) -> bool {
        let Some(entry) = self.entries.get(key) else {
            return false;
        };
        *entry
            .last_value
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(value.clone());
        // No receivers is fine; the value is still recorded
        let _ = entry.sender.send(SubscriptionEvent::Update(value));
        true
    }

    /// Remove `key` locally, returning its server stream id if known
    pub fn remove(&self, key: &SubscriptionKey, reason: &str) -> Option<Option<String>> {
        let (_, entry) = self.entries.remove(key)?;
        if let Some(id) = &entry.stream_id {
            self.by_stream.remove(id);
        }
        let _ = entry.sender.send(SubscriptionEvent::Ended(reason.to_string()));
        debug!(key = %key, reason, "Subscription removed");
        Some(entry.stream_id)
    }

    /// Remove `key` only if it is still the entry with `epoch`
    pub(crate) fn remove_epoch(&self, key: &SubscriptionKey, epoch: u64, reason: &str) {
        let current = self.entries.get(key).is_some_and(|e| e.epoch == epoch);
        if current {
            self.remove(key, reason);
        }
    }

    /// Remove every subscription of `channel`
    pub fn remove_channel(&self, channel: &str, reason: &str) -> Vec<SubscriptionKey> {
        let keys: Vec<SubscriptionKey> = self
            .keys()
            .into_iter()
            .filter(|k| k.channel == channel)
            .collect();
        for key in &keys {
            self.remove(key, reason);
        }
        keys
    }

    /// Drop every subscription after a disconnect, telling watchers
    pub fn mark_all_stale(&self) -> usize {
        let keys = self.keys();
        for key in &keys {
            if let Some((_, entry)) = self.entries.remove(key) {
                let _ = entry.sender.send(SubscriptionEvent::Stale);
            }
        }
        self.by_stream.clear();
        if !keys.is_empty() {
            info!(count = keys.len(), "Subscriptions marked stale");
        }
        keys.len()
    }
}
