//! Recording connector for exercising the manager without a broker

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::config::{BrokerEndpoint, StoreSettings};
use super::connection::ManagerOptions;
use super::credential::tests::PRIVATE_KEY;
use super::credential::{Credential, CredentialIssuer};
use super::message::Qos;
use super::transport::{Connector, EventSink, SessionId, Transport, TransportEvent};
use super::users::{ConnectionStatus, Owner};
use crate::error::{BridgeError, Result};
use crate::persistence::SessionStore;

pub type Log = Arc<Mutex<Vec<String>>>;

pub fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

pub fn options() -> ManagerOptions {
    let mut endpoint = BrokerEndpoint::new("broker.test", 8883, "projects/p/devices/d");
    endpoint.tls = false;
    ManagerOptions {
        endpoint,
        issuer: CredentialIssuer::from_rsa_pem("p", PRIVATE_KEY).unwrap(),
        birth: None,
        store: None,
        close_timeout: Duration::from_secs(2),
    }
}

pub fn store_settings(dir: PathBuf) -> StoreSettings {
    StoreSettings {
        dir,
        persist_in: true,
        persist_out: true,
        compact_interval: Duration::ZERO,
    }
}

/// Opens [`MockTransport`]s and remembers their event sinks
///
/// `end` answers with a `Close` event the way a broker session would; every
/// other event is fed in by the test through `handle_event`.
#[derive(Default)]
pub struct MockConnector {
    pub log: Log,
    sinks: Mutex<Vec<EventSink>>,
    fail_open: AtomicBool,
    presence: Mutex<Option<PathBuf>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_open(&self) {
        self.fail_open.store(true, Ordering::SeqCst);
    }

    /// Makes `force_end` record whether `path` still exists at that moment.
    pub fn track_store_presence(&self, path: PathBuf) {
        *self.presence.lock().unwrap() = Some(path);
    }

    pub fn opened(&self) -> usize {
        self.sinks.lock().unwrap().len()
    }

    pub fn last_session(&self) -> SessionId {
        self.sinks.lock().unwrap().last().map(|s| s.session()).unwrap()
    }
}

impl Connector for MockConnector {
    fn open(
        &self,
        _endpoint: &BrokerEndpoint,
        _credential: &Credential,
        _store: Option<Arc<SessionStore>>,
        events: EventSink,
    ) -> Result<Arc<dyn Transport>> {
        if self.fail_open.swap(false, Ordering::SeqCst) {
            return Err(BridgeError::Transport("refused".to_string()));
        }
        self.log.lock().unwrap().push(format!("open {}", events.session()));
        self.sinks.lock().unwrap().push(events.clone());
        Ok(Arc::new(MockTransport {
            log: self.log.clone(),
            events,
            presence: self.presence.lock().unwrap().clone(),
        }))
    }
}

pub struct MockTransport {
    log: Log,
    events: EventSink,
    presence: Option<PathBuf>,
}

impl MockTransport {
    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

impl Transport for MockTransport {
    fn subscribe(&self, filter: &str, qos: Qos) -> Result<()> {
        self.record(format!("subscribe {} {}", filter, u8::from(qos)));
        Ok(())
    }

    fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.record(format!("unsubscribe {}", filter));
        Ok(())
    }

    fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos, retain: bool) -> Result<()> {
        self.record(format!(
            "publish {} {} {} {}",
            topic,
            String::from_utf8_lossy(&payload),
            u8::from(qos),
            retain
        ));
        Ok(())
    }

    fn refresh_credential(&self, _credential: &Credential) {
        self.record("refresh".to_string());
    }

    fn delivered(&self, receipt: u64) {
        self.record(format!("delivered {}", receipt));
    }

    fn end(&self) -> Result<()> {
        self.record("end".to_string());
        self.events.emit(TransportEvent::Close);
        Ok(())
    }

    fn force_end(&self) {
        match &self.presence {
            Some(path) => self.record(format!("force_end store_present={}", path.exists())),
            None => self.record("force_end".to_string()),
        }
    }
}

/// Owner that records every notification it receives
pub struct RecordingOwner {
    id: String,
    pub statuses: Mutex<Vec<ConnectionStatus>>,
    pub errors: Mutex<Vec<String>>,
}

impl RecordingOwner {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            statuses: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
        })
    }

    pub fn statuses(&self) -> Vec<ConnectionStatus> {
        self.statuses.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

impl Owner for RecordingOwner {
    fn id(&self) -> &str {
        &self.id
    }

    fn on_status(&self, status: ConnectionStatus) {
        self.statuses.lock().unwrap().push(status);
    }

    fn on_error(&self, error: &BridgeError) {
        self.errors.lock().unwrap().push(error.to_string());
    }
}
