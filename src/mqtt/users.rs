//! Owners sharing the broker connection
//!
//! The shared connection is reference counted by its owners: the first owner to
//! register causes a connect and the last one to leave ends the session. The
//! registry itself only tracks membership; the connection manager acts on the
//! outcomes it reports.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::BridgeError;

pub type OwnerId = String;

/// Connection status as shown to owners
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    #[default]
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Disconnected => "disconnected",
        };
        f.write_str(text)
    }
}

/// An endpoint using the shared connection
///
/// Notifications are delivered outside the manager's lock, so implementations
/// may call back into the manager.
pub trait Owner: Send + Sync {
    fn id(&self) -> &str;

    fn on_status(&self, status: ConnectionStatus);

    fn on_error(&self, _error: &BridgeError) {}
}

/// Outcome of removing an owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    /// The owner was not registered
    Unknown,
    /// Other owners still use the connection
    Remaining(usize),
    /// The owner set is now empty
    Last,
}

#[derive(Default)]
pub struct UserRegistry {
    owners: HashMap<OwnerId, Arc<dyn Owner>>,
}

impl UserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `owner`; returns true when it is the first one.
    ///
    /// Registering an id twice replaces the previous handle and is never
    /// reported as first.
    pub fn register(&mut self, owner: Arc<dyn Owner>) -> bool {
        let replaced = self.owners.insert(owner.id().to_string(), owner);
        replaced.is_none() && self.owners.len() == 1
    }

    pub fn deregister(&mut self, owner: &str) -> Departure {
        if self.owners.remove(owner).is_none() {
            return Departure::Unknown;
        }
        match self.owners.len() {
            0 => Departure::Last,
            remaining => Departure::Remaining(remaining),
        }
    }

    pub fn contains(&self, owner: &str) -> bool {
        self.owners.contains_key(owner)
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// Snapshot of the current owners for broadcasting.
    pub fn owners(&self) -> Vec<Arc<dyn Owner>> {
        self.owners.values().cloned().collect()
    }
}

impl fmt::Debug for UserRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.owners.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl Owner for Named {
        fn id(&self) -> &str {
            self.0
        }

        fn on_status(&self, _status: ConnectionStatus) {}
    }

    #[test]
    fn first_registration_is_reported_once() {
        let mut users = UserRegistry::new();
        assert!(users.register(Arc::new(Named("a"))));
        assert!(!users.register(Arc::new(Named("b"))));
        assert!(!users.register(Arc::new(Named("a"))));
        assert_eq!(users.len(), 2);
    }

    #[test]
    fn last_departure() {
        let mut users = UserRegistry::new();
        users.register(Arc::new(Named("a")));
        users.register(Arc::new(Named("b")));
        users.register(Arc::new(Named("c")));

        assert_eq!(users.deregister("a"), Departure::Remaining(2));
        assert_eq!(users.deregister("a"), Departure::Unknown);
        assert_eq!(users.deregister("b"), Departure::Remaining(1));
        assert_eq!(users.deregister("c"), Departure::Last);
        assert!(users.is_empty());
    }

    #[test]
    fn status_text() {
        assert_eq!(ConnectionStatus::Connected.to_string(), "connected");
        assert_eq!(ConnectionStatus::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionStatus::Disconnected.to_string(), "disconnected");
    }
}
