use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use super::config::EndpointKey;
use super::connection::{ConnectionManager, ConnectionState, ManagerOptions};
use super::transport::Connector;
use crate::error::Result;
use crate::util::lock;

/// Hands out one shared manager per `(host, port, client_id)`
///
/// A manager that has been closed is replaced on the next request.
#[derive(Default)]
pub struct ConnectionPool {
    managers: Mutex<HashMap<EndpointKey, Arc<ConnectionManager>>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the running manager for `options.endpoint`, creating and
    /// starting one if needed. Options of an existing manager win.
    pub fn get_or_create(
        &self,
        options: ManagerOptions,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<ConnectionManager>> {
        let key = options.endpoint.key();
        let mut managers = lock(&self.managers);

        if let Some(existing) = managers.get(&key) {
            if existing.state() != ConnectionState::Closing {
                debug!("Reusing connection manager for {}", existing.endpoint());
                return Ok(existing.clone());
            }
        }

        let manager = ConnectionManager::new(options, connector);
        manager.spawn()?;
        info!("Created connection manager for {}", manager.endpoint());
        managers.insert(key, manager.clone());
        Ok(manager)
    }

    pub fn len(&self) -> usize {
        lock(&self.managers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::testing::{options, MockConnector};

    #[tokio::test]
    async fn same_identity_shares_one_manager() {
        let pool = ConnectionPool::new();
        let connector = MockConnector::new();

        let first = pool.get_or_create(options(), connector.clone()).unwrap();
        let mut tuned = options();
        tuned.endpoint.keep_alive = std::time::Duration::from_secs(5);
        let second = pool.get_or_create(tuned, connector.clone()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let mut other = options();
        other.endpoint.client_id = "projects/p/devices/other".to_string();
        let third = pool.get_or_create(other, connector.clone()).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn closed_manager_is_replaced() {
        let pool = ConnectionPool::new();
        let connector = MockConnector::new();

        let first = pool.get_or_create(options(), connector.clone()).unwrap();
        first.close(false).await.unwrap();
        let second = pool.get_or_create(options(), connector.clone()).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.state(), ConnectionState::Disconnected);
    }
}
