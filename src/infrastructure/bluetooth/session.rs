//! Session State Machine
//!
//! Owns the lifecycle of the single peripheral connection:
//!
//! ```text
//! Idle ──scan──▶ Scanning ──match──▶ Connecting ──▶ Discovering ──▶ Ready
//!  ▲               │ timeout              │ fail          │ fail       │ │
//!  ├───────────────┘                      ▼               ▼            │ │
//!  ├─────────────── reset ────────────── Error ◀──────────┘            │ │
//!  ├──────────────────────── remote disconnect ────────────────────────┘ │
//!  └──────── confirmed ──────── Disconnecting ◀──── disconnect ──────────┘
//! ```
//!
//! Every mutation happens through `&mut self`; transport callbacks arrive as
//! [`TransportEvent`]s and are applied by [`Session::handle_event`].

use crate::domain::models::{
    AppEvent, MessageSeverity, PeripheralIdentity, SessionSnapshot, SessionState, StatusMessage,
};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::connection::BleConnection;
use crate::infrastructure::bluetooth::error::SessionError;
use crate::infrastructure::bluetooth::scanner::BleScanner;
use crate::infrastructure::bluetooth::synchronizer::{
    cancel_all, CharacteristicSynchronizer, Subscriptions, SyncedValues,
};
use crate::infrastructure::bluetooth::transport::{EventIngress, Transport, TransportEvent};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub target_name: String,
    pub scan_timeout: Duration,
    pub disconnect_confirm_timeout: Duration,
    pub disconnect_poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for SessionConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            target_name: settings.target_name.clone(),
            scan_timeout: Duration::from_millis(settings.scan_timeout_ms),
            disconnect_confirm_timeout: Duration::from_millis(
                settings.disconnect_confirm_timeout_ms,
            ),
            disconnect_poll_interval: Duration::from_millis(
                settings.disconnect_poll_interval_ms.max(1),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected(PeripheralIdentity),
    /// The scan timed out without seeing the target.
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    Confirmed,
    /// The transport has not confirmed yet; poll the connection to finish.
    Pending,
}

struct Link<C> {
    identity: PeripheralIdentity,
    connection: Option<C>,
}

pub struct Session<T: Transport> {
    transport: T,
    config: SessionConfig,
    ingress: EventIngress,
    state: SessionState,
    /// Bumped for every connection attempt; stale disconnect events carry an old one
    epoch: u64,
    link: Option<Link<T::Connection>>,
    subscriptions: Subscriptions,
    values: SyncedValues,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    app_events: mpsc::UnboundedSender<AppEvent>,
}

impl<T: Transport> Session<T> {
    /// Build a session that owns `transport`. Transport events for this
    /// session arrive on the returned receiver.
    pub fn new(
        transport: T,
        config: SessionConfig,
        app_events: mpsc::UnboundedSender<AppEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (ingress, events) = EventIngress::new();
        let (snapshot_tx, _) = watch::channel(SessionSnapshot::default());
        let session = Self {
            transport,
            config,
            ingress,
            state: SessionState::Idle,
            epoch: 0,
            link: None,
            subscriptions: Subscriptions::default(),
            values: SyncedValues::default(),
            snapshot_tx,
            app_events,
        };
        (session, events)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            peripheral: self.link.as_ref().map(|l| l.identity.clone()),
            connected: self.state.is_connected(),
            status_text: self.values.status_text.clone(),
            actuator: self.values.actuator,
        }
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Scan for the target, connect, resolve and synchronize.
    pub async fn start_scan(&mut self) -> Result<ConnectOutcome, SessionError> {
        if !self.state.accepts_scan() {
            return Err(SessionError::Busy(self.state));
        }
        if self.state == SessionState::Error {
            self.reset().await;
        }

        self.set_state(SessionState::Scanning);
        self.send_log("Scanning...", MessageSeverity::Info);

        let found = BleScanner::new(&self.transport)
            .find(&self.config.target_name, self.config.scan_timeout)
            .await;

        match found {
            Ok(Some(identity)) => self.establish(identity).await,
            Ok(None) => {
                self.set_state(SessionState::Idle);
                self.send_log(
                    &format!("{} not found", self.config.target_name),
                    MessageSeverity::Warning,
                );
                Ok(ConnectOutcome::NotFound)
            }
            Err(e) => {
                self.set_state(SessionState::Idle);
                self.send_log(&format!("Scan failed: {}", e), MessageSeverity::Error);
                Err(SessionError::Transport(e))
            }
        }
    }

    async fn establish(
        &mut self,
        identity: PeripheralIdentity,
    ) -> Result<ConnectOutcome, SessionError> {
        self.epoch += 1;
        self.link = Some(Link {
            identity: identity.clone(),
            connection: None,
        });
        self.set_state(SessionState::Connecting);

        let sink = self.ingress.disconnect_sink(self.epoch);
        let connected = BleConnection::new(&self.transport)
            .connect(&identity, sink)
            .await;
        let connection = match connected {
            Ok(connection) => connection,
            Err(e) => return Err(self.fail_setup(e).await),
        };
        if let Some(link) = self.link.as_mut() {
            link.connection = Some(connection.clone());
        }

        self.set_state(SessionState::Discovering);
        let discovered = BleConnection::new(&self.transport)
            .discover(&connection)
            .await;
        if let Err(e) = discovered {
            return Err(self.fail_setup(e).await);
        }

        self.set_state(SessionState::Ready);
        let synced = CharacteristicSynchronizer::new(&self.transport, &connection)
            .initial_sync(&mut self.values, &mut self.subscriptions, &mut self.ingress)
            .await;
        if let Err(e) = synced {
            return Err(self.fail_setup(e).await);
        }
        self.publish();

        info!(peripheral = %identity, "Connection established");
        self.send_log(
            &format!("Connected to {}", identity.name),
            MessageSeverity::Success,
        );
        Ok(ConnectOutcome::Connected(identity))
    }

    /// Error, then tear down whatever was set up, then back to Idle.
    async fn fail_setup(&mut self, e: SessionError) -> SessionError {
        error!(state = %self.state, "Connection attempt failed: {}", e);
        self.set_state(SessionState::Error);
        self.send_log(&format!("Connection failed: {}", e), MessageSeverity::Error);
        self.reset().await;
        e
    }

    /// Return to a clean Idle state, closing any link left from setup.
    async fn reset(&mut self) {
        cancel_all(&self.transport, &mut self.subscriptions).await;
        if let Some(connection) = self.link.take().and_then(|l| l.connection) {
            if let Err(e) = self.transport.disconnect(&connection).await {
                debug!("Disconnect during reset failed: {}", e);
            }
        }
        self.clear();
        self.set_state(SessionState::Idle);
    }

    /// Tear the session down on request.
    pub async fn disconnect(&mut self) -> Result<DisconnectOutcome, SessionError> {
        match self.state {
            SessionState::Ready => {}
            SessionState::Disconnecting => return self.confirm_disconnect().await,
            SessionState::Idle | SessionState::Error => return Err(SessionError::NotConnected),
            busy => return Err(SessionError::Busy(busy)),
        }

        let Some(connection) = self.current_connection() else {
            return Err(SessionError::NotConnected);
        };

        info!("Disconnecting");
        self.set_state(SessionState::Disconnecting);

        let still_up = self.transport.is_connected(&connection).await.unwrap_or(true);
        cancel_all(&self.transport, &mut self.subscriptions).await;
        if still_up {
            if let Err(e) = self.transport.disconnect(&connection).await {
                warn!("Disconnect request failed: {}", e);
            }
        } else {
            debug!("Link already down, skipping disconnect request");
        }

        self.confirm_disconnect().await
    }

    /// Poll the link until it reports down or the confirmation window closes.
    async fn confirm_disconnect(&mut self) -> Result<DisconnectOutcome, SessionError> {
        let Some(connection) = self.current_connection() else {
            self.finish_disconnect();
            return Ok(DisconnectOutcome::Confirmed);
        };

        let deadline = tokio::time::Instant::now() + self.config.disconnect_confirm_timeout;
        loop {
            match self.transport.is_connected(&connection).await {
                Ok(false) => {
                    self.finish_disconnect();
                    return Ok(DisconnectOutcome::Confirmed);
                }
                Ok(true) => trace!("Link still up"),
                Err(e) => debug!("Connection status unavailable: {}", e),
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("Disconnect not confirmed yet");
                self.send_log("Disconnect pending", MessageSeverity::Warning);
                return Ok(DisconnectOutcome::Pending);
            }
            tokio::time::sleep(self.config.disconnect_poll_interval).await;
        }
    }

    fn finish_disconnect(&mut self) {
        self.link = None;
        self.clear();
        self.set_state(SessionState::Idle);
        info!("Disconnected");
        self.send_log("Disconnected", MessageSeverity::Info);
    }

    /// Ask the transport whether the link is up and settle pending
    /// transitions accordingly. Returns the connected flag.
    pub async fn poll_connection(&mut self) -> Result<bool, SessionError> {
        let Some(connection) = self.current_connection() else {
            return Ok(false);
        };
        match self.state {
            SessionState::Disconnecting => {
                if !self.transport.is_connected(&connection).await.unwrap_or(true) {
                    self.finish_disconnect();
                }
            }
            SessionState::Ready => {
                if !self.transport.is_connected(&connection).await.unwrap_or(true) {
                    self.connection_lost().await;
                }
            }
            _ => {}
        }
        Ok(self.state.is_connected())
    }

    /// Write the actuator flag; the local value changes only on acknowledgement.
    pub async fn set_actuator(&mut self, value: bool) -> Result<(), SessionError> {
        if self.state != SessionState::Ready {
            return Err(SessionError::NotConnected);
        }
        let Some(connection) = self.current_connection() else {
            return Err(SessionError::NotConnected);
        };

        CharacteristicSynchronizer::new(&self.transport, &connection)
            .write_actuator(&mut self.values, value)
            .await?;
        self.publish();
        Ok(())
    }

    /// Apply one queued transport event.
    pub async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Notification {
                subscription,
                payload,
            } => {
                if self.state != SessionState::Ready {
                    trace!(%subscription, state = %self.state, "Dropping notification");
                    return;
                }
                let Some(kind) = self.subscriptions.kind_of(subscription) else {
                    trace!(%subscription, "Dropping notification for inactive subscription");
                    return;
                };
                match self.values.apply(kind, &payload) {
                    Ok(true) => {
                        debug!(characteristic = %kind, "Value update received");
                        self.publish();
                    }
                    Ok(false) => trace!(characteristic = %kind, "Value unchanged"),
                    Err(e) => warn!(characteristic = %kind, "Ignoring update: {}", e),
                }
            }
            TransportEvent::Disconnected { epoch } => {
                if epoch != self.epoch {
                    trace!(epoch, current = self.epoch, "Ignoring stale disconnect");
                    return;
                }
                match self.state {
                    SessionState::Ready => self.connection_lost().await,
                    SessionState::Disconnecting => self.finish_disconnect(),
                    other => trace!(state = %other, "Ignoring disconnect event"),
                }
            }
        }
    }

    /// The link dropped on its own: clean up without asking the transport
    /// to disconnect.
    async fn connection_lost(&mut self) {
        warn!("Device disconnected unexpectedly");
        cancel_all(&self.transport, &mut self.subscriptions).await;
        let identity = self.link.take().map(|l| l.identity);
        self.clear();
        self.set_state(SessionState::Idle);
        if let Some(identity) = identity {
            let _ = self.app_events.send(AppEvent::ConnectionLost(identity));
        }
    }

    /// Close a live session before the owner goes away.
    pub async fn shutdown(&mut self) {
        match self.state {
            SessionState::Ready | SessionState::Disconnecting => {
                if let Err(e) = self.disconnect().await {
                    warn!("Disconnect on shutdown failed: {}", e);
                }
            }
            SessionState::Idle => {}
            _ => self.reset().await,
        }
    }

    fn current_connection(&self) -> Option<T::Connection> {
        self.link.as_ref().and_then(|l| l.connection.clone())
    }

    fn clear(&mut self) {
        self.subscriptions = Subscriptions::default();
        self.values = SyncedValues::default();
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            info!(from = %self.state, to = %state, "Session state changed");
            self.state = state;
        }
        self.publish();
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.app_events.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}
