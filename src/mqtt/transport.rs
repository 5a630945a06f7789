//! Seam between the connection manager and the MQTT client library
//!
//! A [`Connector`] opens one physical session per call and reports what happens
//! to it as [`TransportEvent`]s tagged with the session id it was opened under.
//! The manager drives its state machine from those events only, which keeps the
//! wire protocol replaceable (and mockable in tests).

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::config::BrokerEndpoint;
use super::credential::Credential;
use super::message::{InboundMessage, Qos};
use crate::error::Result;
use crate::persistence::SessionStore;

pub type SessionId = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Broker accepted the session (CONNACK)
    Connect,
    /// The transport starts another attempt after a drop
    Reconnect,
    /// The session is gone, either dropped or ended
    Close,
    /// Failure the owners should hear about, e.g. a refused CONNECT
    Error(String),
    /// Publish received from the broker; `receipt` is set when the message was
    /// journaled and must be acknowledged once delivered
    Message {
        message: InboundMessage,
        receipt: Option<u64>,
    },
}

#[derive(Debug)]
pub struct SessionEvent {
    pub session: SessionId,
    pub event: TransportEvent,
}

/// Channel end handed to a transport for reporting its events
#[derive(Debug, Clone)]
pub struct EventSink {
    session: SessionId,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub fn new(session: SessionId, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Returns false once the receiving side is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        let delivered = self
            .tx
            .send(SessionEvent {
                session: self.session,
                event,
            })
            .is_ok();
        if !delivered {
            debug!("Event receiver for session {} is gone", self.session);
        }
        delivered
    }
}

/// One physical broker session
///
/// Requests are non-blocking hand-offs; their outcome shows up later as events.
pub trait Transport: Send + Sync {
    fn subscribe(&self, filter: &str, qos: Qos) -> Result<()>;

    fn unsubscribe(&self, filter: &str) -> Result<()>;

    fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos, retain: bool) -> Result<()>;

    /// Credential to present on the next (re)connect of this session.
    fn refresh_credential(&self, credential: &Credential);

    /// Confirms that a journaled inbound message reached its listeners.
    fn delivered(&self, _receipt: u64) {}

    /// Graceful end; a [`TransportEvent::Close`] follows once the session is down.
    fn end(&self) -> Result<()>;

    /// Tears the session down immediately. No further events are reported.
    fn force_end(&self);

    /// Cancelled once nothing of the session holds on to its store any more.
    fn finished(&self) -> CancellationToken {
        let token = CancellationToken::new();
        token.cancel();
        token
    }
}

pub trait Connector: Send + Sync {
    fn open(
        &self,
        endpoint: &BrokerEndpoint,
        credential: &Credential,
        store: Option<Arc<SessionStore>>,
        events: EventSink,
    ) -> Result<Arc<dyn Transport>>;
}
