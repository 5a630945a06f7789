//! # MQTT Integration Module
//!
//! Shares one authenticated broker session between every endpoint of a device.
//! Endpoints register as owners, add listeners for topic filters and publish
//! through the shared [`connection::ConnectionManager`], which keeps the
//! session alive while anyone still uses it.
//!
//! ## Why This Module Exists
//!
//! The broker accepts a single session per client id and authenticates it with
//! a short-lived signed token instead of a password. Opening a connection per
//! endpoint therefore kicks the other endpoints off, and a token has to be
//! minted for every connect attempt. This module centralizes both concerns.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs         - Broker endpoint and store settings
//! ├── connection.rs     - Shared session state machine
//! ├── credential.rs     - RS256 token issuing
//! ├── endpoints.rs      - Device config (inbound) and events (outbound) endpoints
//! ├── message.rs        - QoS, payloads, outbound and inbound messages
//! ├── pool.rs           - One manager per endpoint identity
//! ├── rumqtt.rs         - Transport implementation over rumqttc
//! ├── subscriptions.rs  - Filter -> listener registry
//! ├── topic.rs          - Wildcard matching and device topics
//! ├── transport.rs      - Transport/connector seam and session events
//! └── users.rs          - Owners and their reference count
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! rumqttc EventLoop ──▶ SessionDriver ──TransportEvent──▶ dispatcher task
//!                                                              │
//!                                     ConnectionManager::handle_event
//!                                          │                 │
//!                               owner status/errors    listener fan-out
//! ```

pub mod config;
pub mod connection;
pub mod credential;
pub mod endpoints;
pub mod message;
pub mod pool;
pub mod rumqtt;
pub mod subscriptions;
pub mod topic;
pub mod transport;
pub mod users;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{BrokerEndpoint, EndpointKey, StoreSettings};
pub use connection::{ConnectionManager, ConnectionState, ManagerOptions};
pub use credential::{Credential, CredentialIssuer};
pub use endpoints::{InboundEndpoint, OutboundEndpoint, OutboundSettings};
pub use message::{InboundMessage, Message, Payload, Qos};
pub use pool::ConnectionPool;
pub use rumqtt::RumqttConnector;
pub use subscriptions::{Listener, ListenerRef, SubscriptionRegistry};
pub use transport::{Connector, Transport, TransportEvent};
pub use users::{ConnectionStatus, Owner, UserRegistry};
