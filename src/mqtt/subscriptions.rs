//! Subscription bookkeeping that outlives individual broker sessions
//!
//! Listeners are grouped by filter and keyed inside a filter by a caller supplied
//! reference, so several owners (or one owner several times) can listen on the
//! same filter independently. The registry is what the connection manager
//! replays after every successful connect, so it must never contain a filter
//! without listeners: removing the last listener drops the filter and tells the
//! caller to cancel it on the wire.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::message::{InboundMessage, Qos};
use super::topic;
use super::users::OwnerId;

/// Delivery callback of a subscription
pub type Listener = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// Sub-identifier of a listener within one filter; `None` is the default slot.
pub type ListenerRef = Option<String>;

#[derive(Clone)]
pub struct Subscription {
    pub filter: String,
    pub qos: Qos,
    pub owner: OwnerId,
    pub listener: Listener,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("filter", &self.filter)
            .field("qos", &self.qos)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    filters: HashMap<String, HashMap<ListenerRef, Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the listener stored under `(filter, reference)`.
    pub fn add(
        &mut self,
        filter: &str,
        qos: Qos,
        owner: impl Into<OwnerId>,
        listener: Listener,
        reference: ListenerRef,
    ) {
        let subscription = Subscription {
            filter: filter.to_string(),
            qos,
            owner: owner.into(),
            listener,
        };
        self.filters
            .entry(filter.to_string())
            .or_default()
            .insert(reference, subscription);
    }

    /// Removes the listener under `(filter, reference)`.
    ///
    /// Returns true when this emptied the filter, i.e. the filter should be
    /// unsubscribed on the wire.
    pub fn remove(&mut self, filter: &str, reference: &ListenerRef) -> bool {
        let Some(listeners) = self.filters.get_mut(filter) else {
            return false;
        };
        if listeners.remove(reference).is_none() {
            return false;
        }
        if listeners.is_empty() {
            self.filters.remove(filter);
            return true;
        }
        false
    }

    /// Drops every listener of `owner` and returns the filters that drained.
    pub fn remove_owner(&mut self, owner: &str) -> Vec<String> {
        let mut drained = Vec::new();
        self.filters.retain(|filter, listeners| {
            listeners.retain(|_, subscription| subscription.owner != owner);
            if listeners.is_empty() {
                drained.push(filter.clone());
                false
            } else {
                true
            }
        });
        drained
    }

    /// Highest QoS requested for `filter`, or `None` if nobody listens on it.
    pub fn effective_qos(&self, filter: &str) -> Option<Qos> {
        self.filters
            .get(filter)
            .and_then(|listeners| listeners.values().map(|s| s.qos).max())
    }

    /// Every registered filter with its effective QoS, for wire-level replay.
    pub fn filters(&self) -> Vec<(String, Qos)> {
        self.filters
            .iter()
            .filter_map(|(filter, listeners)| {
                let qos = listeners.values().map(|s| s.qos).max()?;
                Some((filter.clone(), qos))
            })
            .collect()
    }

    pub fn contains(&self, filter: &str) -> bool {
        self.filters.contains_key(filter)
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.filters.values().map(HashMap::len).sum()
    }

    /// Listeners whose filter covers `topic`, one entry per matching listener.
    pub fn listeners_for(&self, topic: &str) -> Vec<Listener> {
        self.filters
            .iter()
            .filter(|(filter, _)| topic::matches(filter, topic))
            .flat_map(|(_, listeners)| listeners.values().map(|s| s.listener.clone()))
            .collect()
    }

    /// Delivers `message` to every matching listener and returns how many fired.
    pub fn dispatch(&self, message: &InboundMessage) -> usize {
        let listeners = self.listeners_for(&message.topic);
        for listener in &listeners {
            listener(message);
        }
        listeners.len()
    }
}
