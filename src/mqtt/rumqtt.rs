//! `rumqttc` implementation of the transport seam
//!
//! Each opened session owns an `AsyncClient` for requests and a driver task
//! that polls the `EventLoop`. A [`SessionLedger`] turns every polled packet
//! into [`TransportEvent`]s and keeps the QoS 1 journals in step with the wire.
//! The driver survives drops: after a failed poll it waits for the reconnect
//! period and polls again, which makes `rumqttc` reconnect with whatever
//! password was handed over last.

use rumqttc::tokio_rustls::rustls::{
    self,
    client::danger,
    crypto,
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, SignatureScheme,
};
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, LastWill, MqttOptions, NetworkOptions,
    Outgoing, Packet, TlsConfiguration,
};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use super::config::BrokerEndpoint;
use super::credential::Credential;
use super::message::{InboundMessage, Qos};
use super::transport::{Connector, EventSink, SessionId, Transport, TransportEvent};
use crate::error::{BridgeError, Result};
use crate::persistence::{SessionStore, StoredMessage};
use crate::util::lock;

/// Username sent alongside the token; the broker ignores it.
pub const USERNAME: &str = "unused";

const REQUEST_CAPACITY: usize = 100;

/// Keys of journaled outbound publishes, in the order they were requested
type Journal = Arc<Mutex<VecDeque<u64>>>;

#[derive(Debug, Default, Clone, Copy)]
pub struct RumqttConnector;

impl RumqttConnector {
    pub fn new() -> Self {
        Self
    }

    fn options(endpoint: &BrokerEndpoint, credential: &Credential) -> MqttOptions {
        let mut options = MqttOptions::new(&endpoint.client_id, &endpoint.host, endpoint.port);
        options
            .set_keep_alive(endpoint.keep_alive)
            .set_clean_session(endpoint.clean_session)
            .set_credentials(USERNAME, credential.token.clone());

        if let Some(will) = &endpoint.will {
            options.set_last_will(LastWill::new(
                will.topic.clone(),
                will.payload.to_bytes(),
                will.qos.into(),
                will.retain,
            ));
        }

        if endpoint.tls {
            options.set_transport(rumqttc::Transport::Tls(Self::tls(endpoint)));
        }

        options
    }

    fn tls(endpoint: &BrokerEndpoint) -> TlsConfiguration {
        if endpoint.verify_server_cert {
            return TlsConfiguration::default();
        }
        warn!("Server certificate verification disabled for {}", endpoint);
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
            .with_no_client_auth();
        TlsConfiguration::Rustls(Arc::new(config))
    }
}

impl Connector for RumqttConnector {
    fn open(
        &self,
        endpoint: &BrokerEndpoint,
        credential: &Credential,
        store: Option<Arc<SessionStore>>,
        events: EventSink,
    ) -> Result<Arc<dyn Transport>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BridgeError::Transport(format!("no async runtime: {}", e)))?;

        let (client, mut eventloop) =
            AsyncClient::new(Self::options(endpoint, credential), REQUEST_CAPACITY);
        let mut network = NetworkOptions::new();
        network.set_connection_timeout(endpoint.connect_timeout.as_secs().max(1));
        eventloop.set_network_options(network);

        let (password_tx, password_rx) = watch::channel(credential.token.clone());
        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();
        let journal = Journal::default();

        info!("Opening session {} to {}", events.session(), endpoint);

        let driver = SessionDriver {
            eventloop,
            client: client.clone(),
            password: password_rx,
            cancel: cancel.clone(),
            reconnect_period: endpoint.reconnect_period,
            ledger: SessionLedger::new(events.session(), store.clone(), journal.clone()),
            events,
            _finished: finished.clone().drop_guard(),
        };
        runtime.spawn(driver.run());

        Ok(Arc::new(RumqttTransport {
            client,
            password: password_tx,
            cancel,
            finished,
            store,
            journal,
        }))
    }
}

pub struct RumqttTransport {
    client: AsyncClient,
    password: watch::Sender<String>,
    cancel: CancellationToken,
    /// Cancelled once the driver task has let go of the session
    finished: CancellationToken,
    store: Option<Arc<SessionStore>>,
    journal: Journal,
}

impl RumqttTransport {
    fn journal_outgoing(&self, topic: &str, payload: &[u8], qos: Qos, retain: bool) -> Option<u64> {
        let outgoing = self.store.as_ref()?.outgoing()?;
        let record = StoredMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
        };
        match outgoing.put(&record) {
            Ok(key) => {
                lock(&self.journal).push_back(key);
                Some(key)
            }
            Err(e) => {
                warn!("Failed to journal publish to {}: {}", topic, e);
                None
            }
        }
    }

    /// Drops a journal entry whose publish never reached the request queue.
    fn forget_outgoing(&self, key: u64) {
        lock(&self.journal).retain(|queued| *queued != key);
        if let Some(outgoing) = self.store.as_ref().and_then(|s| s.outgoing()) {
            if let Err(e) = outgoing.remove(key) {
                warn!("Failed to drop outbound journal entry {}: {}", key, e);
            }
        }
    }
}

impl Transport for RumqttTransport {
    fn subscribe(&self, filter: &str, qos: Qos) -> Result<()> {
        self.client
            .try_subscribe(filter, qos.into())
            .map_err(|e| BridgeError::Transport(e.to_string()))
    }

    fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.client
            .try_unsubscribe(filter)
            .map_err(|e| BridgeError::Transport(e.to_string()))
    }

    fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos, retain: bool) -> Result<()> {
        let journaled = if qos == Qos::AtLeastOnce {
            self.journal_outgoing(topic, &payload, qos, retain)
        } else {
            None
        };
        if let Err(e) = self.client.try_publish(topic, qos.into(), retain, payload) {
            if let Some(key) = journaled {
                self.forget_outgoing(key);
            }
            return Err(BridgeError::Publish(e.to_string()));
        }
        Ok(())
    }

    fn refresh_credential(&self, credential: &Credential) {
        self.password.send_replace(credential.token.clone());
    }

    fn delivered(&self, receipt: u64) {
        if let Some(incoming) = self.store.as_ref().and_then(|s| s.incoming()) {
            if let Err(e) = incoming.remove(receipt) {
                warn!("Failed to release inbound journal entry {}: {}", receipt, e);
            }
        }
    }

    fn end(&self) -> Result<()> {
        self.client
            .try_disconnect()
            .map_err(|e| BridgeError::Transport(e.to_string()))
    }

    fn force_end(&self) {
        self.cancel.cancel();
    }

    fn finished(&self) -> CancellationToken {
        self.finished.clone()
    }
}

impl Drop for RumqttTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// What the driver does after a packet
#[derive(Debug, PartialEq)]
enum Flow {
    Continue(Vec<TransportEvent>),
    /// The session was ended on request; report and stop polling
    End(Vec<TransportEvent>),
}

/// What the driver does after a failed poll
#[derive(Debug, PartialEq)]
enum Recovery {
    /// The client side is gone, nothing left to drive
    Stop,
    /// Wait and poll again; `Some` carries a failure the owners should hear about
    Retry(Option<String>),
}

fn classify(error: &ConnectionError) -> Recovery {
    match error {
        ConnectionError::RequestsDone => Recovery::Stop,
        ConnectionError::Io(_) | ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => {
            Recovery::Retry(None)
        }
        other => Recovery::Retry(Some(other.to_string())),
    }
}

/// Packet bookkeeping of one session: event translation and QoS 1 journals
struct SessionLedger {
    session: SessionId,
    store: Option<Arc<SessionStore>>,
    journal: Journal,
    /// Packet id -> journal key of unacknowledged outbound publishes
    in_flight: HashMap<u16, u64>,
    replayed: bool,
}

impl SessionLedger {
    fn new(session: SessionId, store: Option<Arc<SessionStore>>, journal: Journal) -> Self {
        Self {
            session,
            store,
            journal,
            in_flight: HashMap::new(),
            replayed: false,
        }
    }

    fn on_event(&mut self, event: Event, client: &AsyncClient) -> Flow {
        let mut events = Vec::new();
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                debug!("Session {} acknowledged: {:?}", self.session, ack.code);
                if self.replayed {
                    events.push(TransportEvent::Connect);
                } else {
                    self.replayed = true;
                    self.replay_outgoing(client);
                    events.push(TransportEvent::Connect);
                    self.replay_incoming(&mut events);
                }
            }
            Event::Incoming(Packet::Publish(publish)) => {
                let qos = Qos::from(publish.qos);
                let receipt = if qos == Qos::AtLeastOnce {
                    self.journal_incoming(&publish.topic, &publish.payload, qos, publish.retain)
                } else {
                    None
                };
                let message =
                    InboundMessage::from_wire(publish.topic, &publish.payload, qos, publish.retain);
                events.push(TransportEvent::Message { message, receipt });
            }
            Event::Incoming(Packet::PubAck(ack)) => {
                if let Some(key) = self.in_flight.remove(&ack.pkid) {
                    if let Some(outgoing) = self.store.as_ref().and_then(|s| s.outgoing()) {
                        if let Err(e) = outgoing.remove(key) {
                            warn!("Failed to release outbound journal entry {}: {}", key, e);
                        }
                    }
                }
            }
            Event::Outgoing(Outgoing::Publish(pkid)) if pkid != 0 => {
                if !self.in_flight.contains_key(&pkid) {
                    if let Some(key) = lock(&self.journal).pop_front() {
                        self.in_flight.insert(pkid, key);
                    }
                }
            }
            Event::Outgoing(Outgoing::Disconnect) => {
                info!("Session {} ended", self.session);
                return Flow::End(vec![TransportEvent::Close]);
            }
            _ => {}
        }
        Flow::Continue(events)
    }

    fn journal_incoming(&self, topic: &str, payload: &[u8], qos: Qos, retain: bool) -> Option<u64> {
        let incoming = self.store.as_ref()?.incoming()?;
        let record = StoredMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
        };
        match incoming.put(&record) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!("Failed to journal inbound message on {}: {}", topic, e);
                None
            }
        }
    }

    /// Re-sends outbound publishes a previous session left unacknowledged.
    fn replay_outgoing(&self, client: &AsyncClient) {
        let Some(outgoing) = self.store.as_ref().and_then(|s| s.outgoing()) else {
            return;
        };
        let pending = outgoing.pending();
        if pending.is_empty() {
            return;
        }
        info!("Replaying {} stored outbound messages", pending.len());
        let mut journal = lock(&self.journal);
        for (key, stored) in pending {
            match client.try_publish(&stored.topic, stored.qos.into(), stored.retain, stored.payload) {
                Ok(()) => journal.push_back(key),
                Err(e) => warn!("Failed to replay stored publish to {}: {}", stored.topic, e),
            }
        }
    }

    /// Hands inbound messages a previous session left undelivered to the manager.
    fn replay_incoming(&self, events: &mut Vec<TransportEvent>) {
        let Some(incoming) = self.store.as_ref().and_then(|s| s.incoming()) else {
            return;
        };
        for (key, stored) in incoming.pending() {
            events.push(TransportEvent::Message {
                message: stored.into_inbound(),
                receipt: Some(key),
            });
        }
    }
}

/// Polls one session's event loop until it is ended or cancelled
struct SessionDriver {
    eventloop: EventLoop,
    client: AsyncClient,
    events: EventSink,
    password: watch::Receiver<String>,
    cancel: CancellationToken,
    reconnect_period: Duration,
    ledger: SessionLedger,
    /// Declared last so it fires after the ledger has released the store
    _finished: DropGuard,
}

impl SessionDriver {
    async fn run(mut self) {
        let session = self.events.session();
        loop {
            if self.password.has_changed().unwrap_or(false) {
                let token = self.password.borrow_and_update().clone();
                self.eventloop.mqtt_options.set_credentials(USERNAME, token);
            }

            let polled = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Session {} cancelled", session);
                    return;
                }
                polled = self.eventloop.poll() => polled,
            };

            let error = match polled {
                Ok(event) => {
                    match self.ledger.on_event(event, &self.client) {
                        Flow::Continue(events) => self.emit(events),
                        Flow::End(events) => {
                            self.emit(events);
                            return;
                        }
                    }
                    continue;
                }
                Err(e) => e,
            };

            match classify(&error) {
                Recovery::Stop => {
                    debug!("Session {} has no request handles left", session);
                    return;
                }
                Recovery::Retry(None) => warn!("Session {} dropped: {}", session, error),
                Recovery::Retry(Some(reason)) => {
                    error!("Session {} failed: {}", session, reason);
                    self.events.emit(TransportEvent::Error(reason));
                }
            }
            self.events.emit(TransportEvent::Close);

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.reconnect_period) => {}
            }
            self.events.emit(TransportEvent::Reconnect);
        }
    }

    fn emit(&self, events: Vec<TransportEvent>) {
        for event in events {
            self.events.emit(event);
        }
    }
}

/// Certificate verifier for brokers configured with verification turned off.
///
/// Chains are accepted as presented; handshake signatures are still checked.
struct AcceptAnyServerCert {
    algorithms: crypto::WebPkiSupportedAlgorithms,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self {
            algorithms: crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl fmt::Debug for AcceptAnyServerCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptAnyServerCert").finish_non_exhaustive()
    }
}

impl danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<danger::ServerCertVerified, rustls::Error> {
        Ok(danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<danger::HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<danger::HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::message::Message;
    use crate::mqtt::testing::store_settings;
    use chrono::Utc;
    use rumqttc::{ConnAck, ConnectReturnCode, PubAck, Publish, QoS};
    use tempfile::{tempdir, TempDir};

    fn credential() -> Credential {
        let now = Utc::now();
        Credential {
            audience: "project".to_string(),
            token: "token".to_string(),
            issued_at: now,
            expires_at: now,
        }
    }

    /// Client whose event loop is kept alive but never polled
    fn idle_client(capacity: usize) -> (AsyncClient, EventLoop) {
        AsyncClient::new(MqttOptions::new("client", "127.0.0.1", 1), capacity)
    }

    fn open_store() -> (TempDir, Arc<SessionStore>) {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(&store_settings(dir.path().join("store"))).unwrap();
        (dir, Arc::new(store))
    }

    fn stored(topic: &str) -> StoredMessage {
        StoredMessage {
            topic: topic.to_string(),
            payload: b"reading".to_vec(),
            qos: Qos::AtLeastOnce,
            retain: false,
        }
    }

    fn connack() -> Event {
        Event::Incoming(Packet::ConnAck(ConnAck::new(ConnectReturnCode::Success, false)))
    }

    fn events(flow: Flow) -> Vec<TransportEvent> {
        match flow {
            Flow::Continue(events) => events,
            Flow::End(events) => panic!("session ended early: {:?}", events),
        }
    }

    #[test]
    fn options_carry_identity_and_session_settings() {
        let mut endpoint = BrokerEndpoint::new("mqtt.googleapis.com", 8883, "projects/p/devices/d");
        endpoint.clean_session = false;
        endpoint.will = Some(Message::new("/devices/d/state", "offline"));

        let options = RumqttConnector::options(&endpoint, &credential());
        assert_eq!(options.client_id(), "projects/p/devices/d");
        assert_eq!(options.broker_address(), ("mqtt.googleapis.com".to_string(), 8883));
        assert_eq!(options.keep_alive(), endpoint.keep_alive);
        assert!(!options.clean_session());
        assert_eq!(
            options.credentials(),
            Some((USERNAME.to_string(), "token".to_string()))
        );
        assert!(options.last_will().is_some());
    }

    #[test]
    fn unverified_tls_installs_its_own_client_config() {
        let mut endpoint = BrokerEndpoint::new("broker.local", 8883, "client");
        endpoint.tls = true;
        endpoint.verify_server_cert = false;

        let options = RumqttConnector::options(&endpoint, &credential());
        assert!(matches!(
            options.transport(),
            rumqttc::Transport::Tls(TlsConfiguration::Rustls(_))
        ));

        endpoint.tls = false;
        let options = RumqttConnector::options(&endpoint, &credential());
        assert!(matches!(options.transport(), rumqttc::Transport::Tcp));
    }

    #[tokio::test]
    async fn open_requires_nothing_from_the_broker() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut endpoint = BrokerEndpoint::new("127.0.0.1", 1, "client");
        endpoint.tls = false;

        let transport = RumqttConnector::new()
            .open(&endpoint, &credential(), None, EventSink::new(1, tx))
            .unwrap();
        transport.subscribe("a/b", Qos::AtLeastOnce).unwrap();
        transport.force_end();

        tokio::time::timeout(Duration::from_secs(5), transport.finished().cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rejected_publish_leaves_no_journal_entry() {
        let (_dir, store) = open_store();
        let (client, _eventloop) = idle_client(1);
        let (password, _) = watch::channel(String::new());
        let transport = RumqttTransport {
            client,
            password,
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
            store: Some(store.clone()),
            journal: Journal::default(),
        };

        transport
            .publish("a", b"1".to_vec(), Qos::AtLeastOnce, false)
            .unwrap();
        let rejected = transport.publish("b", b"2".to_vec(), Qos::AtLeastOnce, false);
        assert!(matches!(rejected, Err(BridgeError::Publish(_))));

        assert_eq!(lock(&transport.journal).len(), 1);
        let pending = store.outgoing().unwrap().pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1.topic, "a");
    }

    #[test]
    fn first_connack_replays_journals_around_connect() {
        let (_dir, store) = open_store();
        let out_key = store.outgoing().unwrap().put(&stored("out")).unwrap();
        let in_key = store.incoming().unwrap().put(&stored("in")).unwrap();
        let (client, _eventloop) = idle_client(10);
        let journal = Journal::default();
        let mut ledger = SessionLedger::new(1, Some(store), journal.clone());

        let first = events(ledger.on_event(connack(), &client));
        assert_eq!(first.len(), 2);
        assert_eq!(first[0], TransportEvent::Connect);
        match &first[1] {
            TransportEvent::Message { message, receipt } => {
                assert_eq!(message.topic, "in");
                assert_eq!(*receipt, Some(in_key));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(lock(&journal).iter().copied().collect::<Vec<_>>(), vec![out_key]);

        let second = events(ledger.on_event(connack(), &client));
        assert_eq!(second, vec![TransportEvent::Connect]);
        assert_eq!(lock(&journal).len(), 1);
    }

    #[test]
    fn puback_releases_the_mapped_journal_entry() {
        let (_dir, store) = open_store();
        let outgoing_key = store.outgoing().unwrap().put(&stored("out")).unwrap();
        let (client, _eventloop) = idle_client(10);
        let journal = Journal::default();
        lock(&journal).push_back(outgoing_key);
        let mut ledger = SessionLedger::new(1, Some(store.clone()), journal.clone());

        ledger.on_event(Event::Outgoing(Outgoing::Publish(5)), &client);
        assert!(lock(&journal).is_empty());
        assert_eq!(ledger.in_flight.get(&5), Some(&outgoing_key));

        // An unrelated ack leaves the entry alone.
        ledger.on_event(Event::Incoming(Packet::PubAck(PubAck::new(6))), &client);
        assert_eq!(store.outgoing().unwrap().len(), 1);

        ledger.on_event(Event::Incoming(Packet::PubAck(PubAck::new(5))), &client);
        assert!(store.outgoing().unwrap().is_empty());
        assert!(ledger.in_flight.is_empty());
    }

    #[test]
    fn only_qos1_publishes_are_journaled() {
        let (_dir, store) = open_store();
        let (client, _eventloop) = idle_client(10);
        let mut ledger = SessionLedger::new(1, Some(store.clone()), Journal::default());

        let mut qos1 = Publish::new("a/b", QoS::AtLeastOnce, "x");
        qos1.pkid = 3;
        let delivered = events(ledger.on_event(Event::Incoming(Packet::Publish(qos1)), &client));
        assert!(matches!(
            delivered.as_slice(),
            [TransportEvent::Message { receipt: Some(_), .. }]
        ));

        let qos0 = Publish::new("a/c", QoS::AtMostOnce, "y");
        let delivered = events(ledger.on_event(Event::Incoming(Packet::Publish(qos0)), &client));
        assert!(matches!(
            delivered.as_slice(),
            [TransportEvent::Message { receipt: None, .. }]
        ));
        assert_eq!(store.incoming().unwrap().len(), 1);
    }

    #[test]
    fn requested_disconnect_ends_the_session() {
        let (client, _eventloop) = idle_client(10);
        let mut ledger = SessionLedger::new(1, None, Journal::default());
        assert_eq!(
            ledger.on_event(Event::Outgoing(Outgoing::Disconnect), &client),
            Flow::End(vec![TransportEvent::Close])
        );
        assert_eq!(
            ledger.on_event(Event::Outgoing(Outgoing::PingReq), &client),
            Flow::Continue(Vec::new())
        );
    }

    #[test]
    fn poll_failures_are_classified() {
        let io = ConnectionError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert_eq!(classify(&io), Recovery::Retry(None));
        assert_eq!(classify(&ConnectionError::NetworkTimeout), Recovery::Retry(None));
        assert!(matches!(
            classify(&ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized)),
            Recovery::Retry(Some(reason)) if reason.contains("NotAuthorized")
        ));
        assert_eq!(classify(&ConnectionError::RequestsDone), Recovery::Stop);
    }
}
