//! Message routing table.
//!
//! The router is the exclusive owner of the kind -> instances table and the
//! channel subscription sets. It resolves a [`Recipient`] to concrete
//! instance ids; health and load filtering happen in the hub, which holds
//! the registry and delivery state.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::message::Recipient;

#[derive(Default)]
struct RouterInner {
    by_kind: HashMap<String, BTreeSet<String>>,
    channels: HashMap<String, BTreeSet<String>>,
    kind_of: HashMap<String, String>,
}

/// Owner of the routing table.
#[derive(Default)]
pub struct MessageRouter {
    inner: Mutex<RouterInner>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RouterInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register_instance(&self, worker_kind: &str, instance_id: &str) {
        let mut inner = self.lock();
        inner
            .by_kind
            .entry(worker_kind.to_owned())
            .or_default()
            .insert(instance_id.to_owned());
        inner
            .kind_of
            .insert(instance_id.to_owned(), worker_kind.to_owned());
    }

    pub fn unregister_instance(&self, instance_id: &str) {
        let mut inner = self.lock();
        if let Some(kind) = inner.kind_of.remove(instance_id) {
            if let Some(instances) = inner.by_kind.get_mut(&kind) {
                instances.remove(instance_id);
                if instances.is_empty() {
                    inner.by_kind.remove(&kind);
                }
            }
        }
        for subscribers in inner.channels.values_mut() {
            subscribers.remove(instance_id);
        }
    }

    pub fn subscribe_channel(&self, channel: &str, instance_id: &str) {
        self.lock()
            .channels
            .entry(channel.to_owned())
            .or_default()
            .insert(instance_id.to_owned());
    }

    pub fn unsubscribe_channel(&self, channel: &str, instance_id: &str) {
        let mut inner = self.lock();
        if let Some(subscribers) = inner.channels.get_mut(channel) {
            subscribers.remove(instance_id);
        }
    }

    /// Resolve a recipient to instance ids, deterministically ordered.
    pub fn resolve(&self, recipient: &Recipient) -> Vec<String> {
        let inner = self.lock();
        match recipient {
            Recipient::Kind(kind) => inner
                .by_kind
                .get(kind)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default(),
            Recipient::Instance(id) => vec![id.clone()],
            Recipient::Broadcast => {
                let mut all: BTreeSet<String> = BTreeSet::new();
                for instances in inner.by_kind.values() {
                    all.extend(instances.iter().cloned());
                }
                all.into_iter().collect()
            }
            Recipient::Channel(name) => inner
                .channels
                .get(name)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default(),
        }
    }

    /// The worker kind an instance registered under.
    pub fn kind_of(&self, instance_id: &str) -> Option<String> {
        self.lock().kind_of.get(instance_id).cloned()
    }

    pub fn knows_kind(&self, worker_kind: &str) -> bool {
        self.lock().by_kind.contains_key(worker_kind)
    }

    pub fn registered_kinds(&self) -> Vec<String> {
        self.lock().by_kind.keys().cloned().collect()
    }

    pub fn instance_count(&self) -> usize {
        self.lock().kind_of.len()
    }
}
