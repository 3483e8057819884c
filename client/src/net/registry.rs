//! Subscription and observer bookkeeping owned by the connection manager.
//!
//! Both registries live inside the manager's mutex. Callers clone the
//! handlers they need out of the registry and invoke them after the lock is
//! released.

#[cfg(test)]
#[path = "registry_test.rs"]
mod registry_test;

use std::collections::HashMap;
use std::sync::Arc;

use super::types::Payload;

/// Callback invoked for every message on a subscribed destination.
pub type Handler = Arc<dyn Fn(Payload) + Send + Sync>;

/// Handle returned by observer registration; pass it to `remove_observer`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(pub(crate) u64);

pub(crate) struct SubscriptionEntry {
    /// STOMP subscription id sent in `SUBSCRIBE` and echoed on `MESSAGE`.
    pub id: String,
    pub handler: Handler,
}

/// Destination → live subscription. At most one entry per destination.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    by_destination: HashMap<String, SubscriptionEntry>,
    by_id: HashMap<String, String>,
}

impl SubscriptionRegistry {
    /// Register `entry`, returning the entry it replaced.
    pub fn insert(&mut self, destination: &str, entry: SubscriptionEntry) -> Option<SubscriptionEntry> {
        self.by_id.insert(entry.id.clone(), destination.to_owned());
        let previous = self.by_destination.insert(destination.to_owned(), entry);
        if let Some(prev) = &previous {
            self.by_id.remove(&prev.id);
        }
        previous
    }

    pub fn remove(&mut self, destination: &str) -> Option<SubscriptionEntry> {
        let entry = self.by_destination.remove(destination)?;
        self.by_id.remove(&entry.id);
        Some(entry)
    }

    /// Remove the entry for `destination` only if it is still subscription `id`.
    pub fn remove_if_current(&mut self, destination: &str, id: &str) -> Option<SubscriptionEntry> {
        let current = self.by_destination.get(destination)?;
        if current.id != id {
            return None;
        }
        self.remove(destination)
    }

    pub fn is_current(&self, destination: &str, id: &str) -> bool {
        self.by_destination
            .get(destination)
            .is_some_and(|entry| entry.id == id)
    }

    /// Destination and handler for a `MESSAGE` frame's `subscription` header.
    pub fn route(&self, id: &str) -> Option<(String, Handler)> {
        let destination = self.by_id.get(id)?;
        let entry = self.by_destination.get(destination)?;
        Some((destination.clone(), Arc::clone(&entry.handler)))
    }

    pub fn destinations(&self) -> Vec<String> {
        let mut destinations = self.by_destination.keys().cloned().collect::<Vec<_>>();
        destinations.sort();
        destinations
    }

    pub fn len(&self) -> usize {
        self.by_destination.len()
    }

    pub fn clear(&mut self) {
        self.by_destination.clear();
        self.by_id.clear();
    }
}

/// Ordered, removable list of callbacks.
pub(crate) struct ObserverRegistry<F: ?Sized> {
    entries: Vec<(ObserverId, Arc<F>)>,
}

impl<F: ?Sized> Default for ObserverRegistry<F> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<F: ?Sized> ObserverRegistry<F> {
    pub fn add(&mut self, id: ObserverId, observer: Arc<F>) {
        self.entries.push((id, observer));
    }

    pub fn remove(&mut self, id: ObserverId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    /// Registration-ordered copy for fan-out outside the lock.
    pub fn snapshot(&self) -> Vec<Arc<F>> {
        self.entries.iter().map(|(_, observer)| Arc::clone(observer)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
