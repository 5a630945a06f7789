//! # Shared Connection Manager
//!
//! ## Why This Module Exists
//! Several endpoints in one process talk to the broker as the same device, and
//! the broker only tolerates one session per client id. The manager owns that
//! single session and multiplexes it: owners register and deregister, listeners
//! subscribe and unsubscribe, and every inbound publish fans out to the
//! listeners whose filter matches.
//!
//! ## State Machine
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──Connect──▶ Connected
//!      ▲                          │  ▲                   │
//!      │        Error (force)     │  └────Reconnect──────┤
//!      └──────────────────────────┘                      │
//!      └────────────────────────Close────────────────────┘
//!
//! any state ──close()──▶ Closing (absorbing)
//! ```
//!
//! A dropped session stays open while the transport retries, so `connect()`
//! does nothing until the session is actually gone. Only an error on the first
//! attempt of a session opened by `connect()` forces it closed; errors on the
//! transport's own retries are reported and the retries go on. A session that
//! ends while owners are still registered is replaced right away.
//!
//! ## Concurrency
//! All state sits behind one mutex. Transport events arrive on a channel and
//! are applied by a single dispatcher task through [`ConnectionManager::handle_event`].
//! Listener callbacks and owner notifications are collected while the lock is
//! held and run after it is released, so they are free to call back into the
//! manager. Events carry the id of the session that produced them and events
//! from a replaced session are dropped.

use chrono::Utc;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{BrokerEndpoint, StoreSettings};
use super::credential::{Credential, CredentialIssuer};
use super::message::{InboundMessage, Message, Qos};
use super::subscriptions::{Listener, ListenerRef, SubscriptionRegistry};
use super::topic;
use super::transport::{Connector, EventSink, SessionEvent, SessionId, Transport, TransportEvent};
use super::users::{ConnectionStatus, Departure, Owner, OwnerId, UserRegistry};
use crate::error::{BridgeError, Result};
use crate::persistence::{self, SessionStore};
use crate::util::lock;

/// How long `deregister`/`close` wait for the broker to confirm a graceful end
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Torn down for good; nothing reconnects from here
    Closing,
}

impl From<ConnectionState> for ConnectionStatus {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Connected => ConnectionStatus::Connected,
            ConnectionState::Connecting => ConnectionStatus::Connecting,
            ConnectionState::Disconnected | ConnectionState::Closing => {
                ConnectionStatus::Disconnected
            }
        }
    }
}

/// Everything a manager needs besides its connector
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub endpoint: BrokerEndpoint,
    pub issuer: CredentialIssuer,
    /// Published after every successful connect, once subscriptions are restored
    pub birth: Option<Message>,
    pub store: Option<StoreSettings>,
    pub close_timeout: Duration,
}

struct ActiveSession {
    id: SessionId,
    transport: Arc<dyn Transport>,
    /// A graceful end was requested; its `Close` finishes the session
    ending: bool,
    /// The broker acknowledged this session and it has not dropped since
    live: bool,
    /// Still on the attempt `connect()` started; cleared by the first
    /// acknowledgement or transport retry
    initiated: bool,
}

struct ManagerState {
    state: ConnectionState,
    session: Option<ActiveSession>,
    next_session: SessionId,
    credential: Option<Credential>,
    subscriptions: SubscriptionRegistry,
    users: UserRegistry,
    close_waiters: Vec<oneshot::Sender<()>>,
    store: Option<Arc<SessionStore>>,
    /// Completion of sessions that were let go but may still hold the store
    retired: Vec<CancellationToken>,
}

impl ManagerState {
    fn resolve_waiters(&mut self) {
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    /// Takes the current session, remembering when its transport lets go.
    fn take_session(&mut self) -> Option<ActiveSession> {
        let session = self.session.take()?;
        self.retired.retain(|done| !done.is_cancelled());
        self.retired.push(session.transport.finished());
        Some(session)
    }
}

struct Delivery {
    message: InboundMessage,
    listeners: Vec<Listener>,
    receipt: Option<(Arc<dyn Transport>, u64)>,
}

/// Callbacks gathered under the lock, run once it is released
#[derive(Default)]
struct Notifications {
    statuses: Vec<(Arc<dyn Owner>, ConnectionStatus)>,
    deliveries: Vec<Delivery>,
    failure: Option<(Vec<Arc<dyn Owner>>, BridgeError)>,
}

impl Notifications {
    fn broadcast(&mut self, users: &UserRegistry, status: ConnectionStatus) {
        for owner in users.owners() {
            self.statuses.push((owner, status));
        }
    }

    fn fail(&mut self, users: &UserRegistry, error: BridgeError) {
        self.failure = Some((users.owners(), error));
    }

    /// Runs the collected callbacks and hands back the error, if any.
    fn deliver(self) -> Option<BridgeError> {
        for (owner, status) in self.statuses {
            owner.on_status(status);
        }
        for delivery in self.deliveries {
            for listener in &delivery.listeners {
                listener(&delivery.message);
            }
            if let Some((transport, receipt)) = delivery.receipt {
                transport.delivered(receipt);
            }
        }
        let (owners, error) = self.failure?;
        for owner in owners {
            owner.on_error(&error);
        }
        Some(error)
    }
}

/// Single broker session shared by every owner of one endpoint
pub struct ConnectionManager {
    endpoint: BrokerEndpoint,
    issuer: CredentialIssuer,
    birth: Option<Message>,
    store_settings: Option<StoreSettings>,
    close_timeout: Duration,
    connector: Arc<dyn Connector>,
    inner: Mutex<ManagerState>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
}

impl ConnectionManager {
    /// Creates an idle manager. Events are only applied once [`Self::spawn`]
    /// has started the dispatcher.
    pub fn new(options: ManagerOptions, connector: Arc<dyn Connector>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            endpoint: options.endpoint,
            issuer: options.issuer,
            birth: options.birth,
            store_settings: options.store,
            close_timeout: options.close_timeout,
            connector,
            inner: Mutex::new(ManagerState {
                state: ConnectionState::Disconnected,
                session: None,
                next_session: 1,
                credential: None,
                subscriptions: SubscriptionRegistry::new(),
                users: UserRegistry::new(),
                close_waiters: Vec::new(),
                store: None,
                retired: Vec::new(),
            }),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    /// Starts the dispatcher task that feeds transport events into
    /// [`Self::handle_event`].
    ///
    /// The task only holds a weak reference and stops once the manager is
    /// dropped. Can be called once; later calls fail.
    pub fn spawn(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BridgeError::Transport(format!("no async runtime: {}", e)))?;
        let mut events = lock(&self.events_rx)
            .take()
            .ok_or_else(|| BridgeError::Transport("dispatcher already running".to_string()))?;

        let manager: Weak<Self> = Arc::downgrade(self);
        let endpoint = self.endpoint.to_string();
        Ok(runtime.spawn(async move {
            debug!("Dispatcher for {} started", endpoint);
            while let Some(SessionEvent { session, event }) = events.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.handle_event(session, event);
            }
            debug!("Dispatcher for {} stopped", endpoint);
        }))
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner).state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state().into()
    }

    pub fn owner_count(&self) -> usize {
        lock(&self.inner).users.len()
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.inner).subscriptions.len()
    }

    /// Opens the session unless one exists or the manager is not disconnected.
    pub fn connect(&self) -> Result<()> {
        let mut notes = Notifications::default();
        {
            let mut st = lock(&self.inner);
            self.connect_locked(&mut st, &mut notes);
        }
        match notes.deliver() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn connect_locked(&self, st: &mut ManagerState, notes: &mut Notifications) {
        if st.state != ConnectionState::Disconnected || st.session.is_some() {
            debug!("Connect to {} skipped in state {:?}", self.endpoint, st.state);
            return;
        }

        st.state = ConnectionState::Connecting;
        notes.broadcast(&st.users, ConnectionStatus::Connecting);

        if st.store.is_none() {
            if let Some(settings) = self.store_settings.as_ref().filter(|s| s.enabled()) {
                match SessionStore::open(settings) {
                    Ok(store) => st.store = Some(Arc::new(store)),
                    Err(e) => warn!("Session store unavailable, continuing without it: {}", e),
                }
            }
        }

        let id = st.next_session;
        st.next_session += 1;

        let opened = self.issuer.issue(Utc::now()).and_then(|credential| {
            let events = EventSink::new(id, self.events_tx.clone());
            let transport =
                self.connector
                    .open(&self.endpoint, &credential, st.store.clone(), events)?;
            Ok((credential, transport))
        });

        match opened {
            Ok((credential, transport)) => {
                info!("Connecting to {} (session {})", self.endpoint, id);
                st.credential = Some(credential);
                st.session = Some(ActiveSession {
                    id,
                    transport,
                    ending: false,
                    live: false,
                    initiated: true,
                });
            }
            Err(e) => {
                error!("Failed to connect to {}: {}", self.endpoint, e);
                st.state = ConnectionState::Disconnected;
                notes.broadcast(&st.users, ConnectionStatus::Disconnected);
                notes.fail(&st.users, e);
            }
        }
    }

    /// Applies one transport event. Events from any session other than the
    /// current one are ignored.
    pub fn handle_event(&self, session: SessionId, event: TransportEvent) {
        let mut notes = Notifications::default();
        {
            let mut st = lock(&self.inner);
            let Some(current) = st.session.as_ref().map(|s| s.id) else {
                debug!("Ignoring {:?} from session {}, none active", event, session);
                return;
            };
            if current != session {
                debug!("Ignoring {:?} from stale session {}", event, session);
                return;
            }

            match event {
                TransportEvent::Connect => self.on_connect(&mut st, &mut notes),
                TransportEvent::Reconnect => self.on_reconnect(&mut st, &mut notes),
                TransportEvent::Close => self.on_close(&mut st, &mut notes),
                TransportEvent::Error(reason) => self.on_error(&mut st, &mut notes, reason),
                TransportEvent::Message { message, receipt } => {
                    let listeners = st.subscriptions.listeners_for(&message.topic);
                    if listeners.is_empty() {
                        debug!("No listener for message on {}", message.topic);
                    }
                    let receipt = receipt.and_then(|receipt| {
                        let transport = st.session.as_ref()?.transport.clone();
                        Some((transport, receipt))
                    });
                    notes.deliveries.push(Delivery {
                        message,
                        listeners,
                        receipt,
                    });
                }
            }
        }
        notes.deliver();
    }

    fn on_connect(&self, st: &mut ManagerState, notes: &mut Notifications) {
        if st.state == ConnectionState::Closing {
            debug!("Connect acknowledged while closing {}", self.endpoint);
            return;
        }
        let Some(session) = st.session.as_mut() else {
            return;
        };
        session.live = true;
        session.initiated = false;
        let transport = session.transport.clone();

        st.state = ConnectionState::Connected;
        info!("Connected to {}", self.endpoint);
        notes.broadcast(&st.users, ConnectionStatus::Connected);

        for (filter, qos) in st.subscriptions.filters() {
            if let Err(e) = transport.subscribe(&filter, qos) {
                warn!("Failed to restore subscription {}: {}", filter, e);
            }
        }

        if let Some(birth) = &self.birth {
            if let Err(e) =
                transport.publish(&birth.topic, birth.payload.to_bytes(), birth.qos, birth.retain)
            {
                warn!("Failed to publish birth message to {}: {}", birth.topic, e);
            }
        }
    }

    fn on_reconnect(&self, st: &mut ManagerState, notes: &mut Notifications) {
        if st.state == ConnectionState::Closing {
            return;
        }
        debug!("Reconnecting to {}", self.endpoint);
        if let Some(session) = st.session.as_mut() {
            session.initiated = false;
        }
        st.state = ConnectionState::Connecting;
        notes.broadcast(&st.users, ConnectionStatus::Connecting);
    }

    fn on_close(&self, st: &mut ManagerState, notes: &mut Notifications) {
        self.refresh_credential(st, notes);

        let Some(session) = st.session.as_mut() else {
            return;
        };
        let was_live = std::mem::replace(&mut session.live, false);

        if session.ending {
            info!("Session {} to {} ended", session.id, self.endpoint);
            st.take_session();
            if st.state != ConnectionState::Closing {
                st.state = ConnectionState::Disconnected;
            }
            if was_live {
                notes.broadcast(&st.users, ConnectionStatus::Disconnected);
            }
            st.resolve_waiters();
            self.reopen_for_owners(st, notes);
            return;
        }

        match st.state {
            ConnectionState::Connected => {
                warn!("Connection to {} lost", self.endpoint);
                st.state = ConnectionState::Disconnected;
                notes.broadcast(&st.users, ConnectionStatus::Disconnected);
            }
            ConnectionState::Connecting => {
                warn!("Connection attempt to {} failed", self.endpoint);
            }
            ConnectionState::Disconnected | ConnectionState::Closing => {}
        }
    }

    fn on_error(&self, st: &mut ManagerState, notes: &mut Notifications, reason: String) {
        error!("Transport error on {}: {}", self.endpoint, reason);
        self.refresh_credential(st, notes);

        let initiated = st.session.as_ref().is_some_and(|s| s.initiated);
        if st.state == ConnectionState::Connecting && initiated {
            if let Some(session) = st.take_session() {
                session.transport.force_end();
            }
            st.state = ConnectionState::Disconnected;
            notes.broadcast(&st.users, ConnectionStatus::Disconnected);
            st.resolve_waiters();
        }

        notes.fail(&st.users, BridgeError::Transport(reason));
    }

    /// Issues a fresh token for the transport's next attempt.
    fn refresh_credential(&self, st: &mut ManagerState, notes: &mut Notifications) {
        let Some(transport) = st.session.as_ref().map(|s| s.transport.clone()) else {
            return;
        };
        let now = Utc::now();
        if let Some(expired) = st.credential.as_ref().filter(|c| c.is_expired(now)) {
            info!(
                "Credential for {} expired at {}, issuing a new one",
                self.endpoint, expired.expires_at
            );
        }
        match self.issuer.issue(now) {
            Ok(credential) => {
                transport.refresh_credential(&credential);
                st.credential = Some(credential);
            }
            Err(e) => {
                error!("Failed to refresh credential for {}: {}", self.endpoint, e);
                notes.fail(&st.users, e);
            }
        }
    }

    /// Adds an owner; the first owner opens the session.
    ///
    /// The new owner immediately hears the current status.
    pub fn register(&self, owner: Arc<dyn Owner>) -> Result<()> {
        let mut notes = Notifications::default();
        {
            let mut st = lock(&self.inner);
            if st.state == ConnectionState::Closing {
                warn!("Owner {} rejected, {} is closed", owner.id(), self.endpoint);
                return Err(BridgeError::Closed(self.endpoint.to_string()));
            }
            debug!("Registering owner {}", owner.id());
            notes.statuses.push((owner.clone(), st.state.into()));
            if st.users.register(owner) {
                self.connect_locked(&mut st, &mut notes);
            }
        }
        match notes.deliver() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Removes an owner together with its listeners.
    ///
    /// When the last owner leaves the session is ended and the future resolves
    /// once the broker has confirmed it, or after the close timeout.
    pub async fn deregister(&self, owner: &str) -> Result<()> {
        let mut notes = Notifications::default();
        let waiter = {
            let mut st = lock(&self.inner);
            let departure = st.users.deregister(owner);
            self.drop_listeners(&mut st, owner);

            if st.state == ConnectionState::Closing {
                None
            } else {
                match departure {
                    Departure::Unknown => {
                        debug!("Owner {} was not registered", owner);
                        None
                    }
                    Departure::Remaining(remaining) => {
                        debug!("Owner {} left, {} remaining", owner, remaining);
                        None
                    }
                    Departure::Last => {
                        info!("Last owner {} left {}", owner, self.endpoint);
                        self.end_session_locked(&mut st, &mut notes)
                    }
                }
            }
        };
        notes.deliver();

        if let Some(waiter) = waiter {
            self.await_close(waiter).await;
        }
        Ok(())
    }

    fn drop_listeners(&self, st: &mut ManagerState, owner: &str) {
        let drained = st.subscriptions.remove_owner(owner);
        if st.state != ConnectionState::Connected {
            return;
        }
        if let Some(session) = &st.session {
            for filter in drained {
                if let Err(e) = session.transport.unsubscribe(&filter) {
                    warn!("Failed to unsubscribe {}: {}", filter, e);
                }
            }
        }
    }

    /// Ends the current session: gracefully when connected, by force otherwise.
    ///
    /// Returns a receiver that fires when a graceful end has been observed.
    fn end_session_locked(
        &self,
        st: &mut ManagerState,
        notes: &mut Notifications,
    ) -> Option<oneshot::Receiver<()>> {
        let session = st.session.as_mut()?;

        if session.live && !session.ending {
            match session.transport.end() {
                Ok(()) => session.ending = true,
                Err(e) => warn!("Graceful end of {} failed, forcing: {}", self.endpoint, e),
            }
        }

        if session.ending {
            let (tx, rx) = oneshot::channel();
            st.close_waiters.push(tx);
            return Some(rx);
        }

        self.force_end_locked(st, notes);
        None
    }

    fn force_end_locked(&self, st: &mut ManagerState, notes: &mut Notifications) {
        if let Some(session) = st.take_session() {
            info!("Forcing session {} to {} closed", session.id, self.endpoint);
            session.transport.force_end();
            notes.broadcast(&st.users, ConnectionStatus::Disconnected);
        }
        if st.state != ConnectionState::Closing {
            st.state = ConnectionState::Disconnected;
        }
        st.resolve_waiters();
    }

    async fn await_close(&self, waiter: oneshot::Receiver<()>) {
        if tokio::time::timeout(self.close_timeout, waiter).await.is_ok() {
            return;
        }
        warn!(
            "No close confirmation from {} within {:?}",
            self.endpoint, self.close_timeout
        );
        let mut notes = Notifications::default();
        {
            let mut st = lock(&self.inner);
            if st.session.as_ref().is_some_and(|s| s.ending) {
                self.force_end_locked(&mut st, &mut notes);
                self.reopen_for_owners(&mut st, &mut notes);
            }
        }
        notes.deliver();
    }

    /// Starts a new session for owners that registered while the last one was
    /// ending.
    fn reopen_for_owners(&self, st: &mut ManagerState, notes: &mut Notifications) {
        if st.state != ConnectionState::Disconnected || st.users.is_empty() {
            return;
        }
        info!(
            "{} owner(s) still registered with {}, reconnecting",
            st.users.len(),
            self.endpoint
        );
        self.connect_locked(st, notes);
    }

    /// Waits until every session let go of so far has released the store.
    async fn await_retired(&self) {
        let retired = std::mem::take(&mut lock(&self.inner).retired);
        let released = async {
            for done in &retired {
                done.cancelled().await;
            }
        };
        if tokio::time::timeout(self.close_timeout, released).await.is_err() {
            warn!(
                "Sessions of {} still running after {:?}",
                self.endpoint, self.close_timeout
            );
        }
    }

    /// Adds a listener for `filter`; the wire subscription follows when connected.
    pub fn subscribe(
        &self,
        filter: &str,
        qos: Qos,
        owner: impl Into<OwnerId>,
        listener: Listener,
        reference: ListenerRef,
    ) -> Result<()> {
        if let Err(e) = topic::validate_filter(filter) {
            warn!("Rejecting subscription: {}", e);
            return Err(e);
        }

        let mut st = lock(&self.inner);
        st.subscriptions
            .add(filter, qos, owner, listener, reference);

        if st.state != ConnectionState::Connected {
            return Ok(());
        }
        let (Some(session), Some(qos)) = (&st.session, st.subscriptions.effective_qos(filter))
        else {
            return Ok(());
        };
        session.transport.subscribe(filter, qos).inspect_err(|e| {
            warn!("Failed to subscribe {}: {}", filter, e);
        })
    }

    /// Removes the listener under `(filter, reference)`; a drained filter is
    /// unsubscribed on the wire when connected.
    pub fn unsubscribe(&self, filter: &str, reference: &ListenerRef) -> Result<()> {
        let mut st = lock(&self.inner);
        if !st.subscriptions.remove(filter, reference) {
            return Ok(());
        }
        if st.state != ConnectionState::Connected {
            return Ok(());
        }
        let Some(session) = &st.session else {
            return Ok(());
        };
        session.transport.unsubscribe(filter).inspect_err(|e| {
            warn!("Failed to unsubscribe {}: {}", filter, e);
        })
    }

    /// Sends `message` when connected; silently dropped otherwise.
    pub fn publish(&self, message: &Message) -> Result<()> {
        if let Err(e) = topic::validate_topic(&message.topic) {
            warn!("Rejecting publish: {}", e);
            return Err(e);
        }

        let transport = {
            let st = lock(&self.inner);
            match (&st.state, &st.session) {
                (ConnectionState::Connected, Some(session)) => session.transport.clone(),
                _ => {
                    debug!(
                        "Dropping publish to {} while {:?}",
                        message.topic, st.state
                    );
                    return Ok(());
                }
            }
        };

        transport
            .publish(
                &message.topic,
                message.payload.to_bytes(),
                message.qos,
                message.retain,
            )
            .inspect_err(|e| error!("Failed to publish to {}: {}", message.topic, e))
    }

    /// Tears the manager down for good.
    ///
    /// A connected session is ended gracefully, anything else is forced. With
    /// `remove_entirely` the session store is deleted afterwards. Further
    /// calls return immediately.
    pub async fn close(&self, remove_entirely: bool) -> Result<()> {
        let mut notes = Notifications::default();
        let (waiter, store) = {
            let mut st = lock(&self.inner);
            if st.state == ConnectionState::Closing {
                debug!("{} already closing", self.endpoint);
                return Ok(());
            }
            info!("Closing connection to {}", self.endpoint);
            st.state = ConnectionState::Closing;
            let waiter = self.end_session_locked(&mut st, &mut notes);
            (waiter, st.store.take())
        };
        notes.deliver();

        if let Some(waiter) = waiter {
            self.await_close(waiter).await;
        }
        self.await_retired().await;
        drop(store);

        if remove_entirely {
            if let Some(dir) = self.store_dir() {
                if let Err(e) = persistence::purge(&dir).await {
                    warn!("Failed to remove session store {}: {}", dir.display(), e);
                }
            }
        }
        info!("Connection to {} closed", self.endpoint);
        Ok(())
    }

    fn store_dir(&self) -> Option<PathBuf> {
        self.store_settings.as_ref().map(|s| s.dir.clone())
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let st = match self.inner.get_mut() {
            Ok(st) => st,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(session) = st.session.take() {
            session.transport.force_end();
        }
    }
}
