//! Device-facing endpoints on top of the shared connection
//!
//! The inbound endpoint listens on the device's config topic and forwards what
//! arrives over a channel; the outbound endpoint publishes telemetry to the
//! device's events topic. Both are owners of the shared connection and mirror
//! its status in a `watch` channel.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::connection::ConnectionManager;
use super::message::{InboundMessage, Message, Payload, Qos};
use super::subscriptions::{Listener, ListenerRef};
use super::topic;
use super::users::{ConnectionStatus, Owner};
use crate::error::{BridgeError, Result};

/// Owner handle shared by both endpoint kinds
struct EndpointOwner {
    id: String,
    status: watch::Sender<ConnectionStatus>,
}

impl Owner for EndpointOwner {
    fn id(&self) -> &str {
        &self.id
    }

    fn on_status(&self, status: ConnectionStatus) {
        debug!("Endpoint {} is {}", self.id, status);
        self.status.send_replace(status);
    }

    fn on_error(&self, error: &BridgeError) {
        warn!("Endpoint {}: {}", self.id, error);
    }
}

fn owner(id: &str) -> (Arc<EndpointOwner>, watch::Receiver<ConnectionStatus>) {
    let (status, rx) = watch::channel(ConnectionStatus::Disconnected);
    let owner = Arc::new(EndpointOwner {
        id: id.to_string(),
        status,
    });
    (owner, rx)
}

/// Receives the configuration the broker pushes to a device
pub struct InboundEndpoint {
    id: String,
    manager: Arc<ConnectionManager>,
    filter: String,
    reference: ListenerRef,
    status: watch::Receiver<ConnectionStatus>,
}

impl InboundEndpoint {
    /// Subscribes to `/devices/{device_id}/config` and registers as an owner.
    ///
    /// A `qos` outside 0..=1 falls back to 1.
    pub fn attach(
        manager: Arc<ConnectionManager>,
        id: &str,
        device_id: &str,
        qos: u8,
    ) -> Result<(Self, mpsc::UnboundedReceiver<InboundMessage>)> {
        let qos = Qos::try_from(qos).unwrap_or_else(|e| {
            warn!("{}, subscribing with QoS 1", e);
            Qos::AtLeastOnce
        });
        let filter = topic::device_config_topic(device_id);
        let reference: ListenerRef = Some(id.to_string());

        let (tx, rx) = mpsc::unbounded_channel();
        let listener: Listener = Arc::new(move |message: &InboundMessage| {
            if tx.send(message.clone()).is_err() {
                debug!("Inbound receiver dropped, discarding message on {}", message.topic);
            }
        });

        let (owner, status) = owner(id);
        manager.subscribe(&filter, qos, id, listener, reference.clone())?;
        if let Err(e) = manager.register(owner) {
            let _ = manager.unsubscribe(&filter, &reference);
            return Err(e);
        }

        Ok((
            Self {
                id: id.to_string(),
                manager,
                filter,
                reference,
                status,
            },
            rx,
        ))
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Stops listening and leaves the shared connection.
    pub async fn detach(self) -> Result<()> {
        self.manager.unsubscribe(&self.filter, &self.reference)?;
        self.manager.deregister(&self.id).await
    }
}

/// How an outbound endpoint addresses and flags its messages
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboundSettings {
    pub device_id: String,
    pub subfolder: Option<String>,
    /// Overrides any per-message QoS when set
    pub qos: Option<u8>,
    pub retain: bool,
}

/// Publishes device telemetry
pub struct OutboundEndpoint {
    id: String,
    manager: Arc<ConnectionManager>,
    topic: String,
    qos: Option<Qos>,
    retain: bool,
    status: watch::Receiver<ConnectionStatus>,
}

impl OutboundEndpoint {
    pub fn attach(
        manager: Arc<ConnectionManager>,
        id: &str,
        settings: &OutboundSettings,
    ) -> Result<Self> {
        let qos = settings.qos.and_then(|level| match Qos::try_from(level) {
            Ok(qos) => Some(qos),
            Err(e) => {
                warn!("{}, ignoring configured QoS", e);
                None
            }
        });
        let topic = topic::device_events_topic(&settings.device_id, settings.subfolder.as_deref());

        let (owner, status) = owner(id);
        manager.register(owner)?;

        Ok(Self {
            id: id.to_string(),
            manager,
            topic,
            qos,
            retain: settings.retain,
            status,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Publishes `payload`; dropped quietly while not connected.
    pub fn send(&self, payload: impl Into<Payload>, qos: Option<u8>, retain: bool) -> Result<()> {
        let message = Message::new(self.topic.clone(), payload)
            .with_qos(resolve_qos(self.qos, qos))
            .with_retain(self.retain || retain);
        self.manager.publish(&message)
    }

    pub async fn detach(self) -> Result<()> {
        self.manager.deregister(&self.id).await
    }
}

/// Configured QoS wins, then a valid per-message QoS, then 0.
fn resolve_qos(configured: Option<Qos>, requested: Option<u8>) -> Qos {
    configured
        .or_else(|| requested.and_then(|level| Qos::try_from(level).ok()))
        .unwrap_or_default()
}
