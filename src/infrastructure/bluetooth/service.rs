//! Bluetooth Service Module
//!
//! Runs the session on a single task. Presentation requests and transport
//! events are both queued to that task, so session state is only ever
//! touched from one place.

use crate::domain::models::{AppEvent, SessionSnapshot, SessionState};
use crate::infrastructure::bluetooth::error::SessionError;
use crate::infrastructure::bluetooth::session::{
    ConnectOutcome, DisconnectOutcome, Session, SessionConfig,
};
use crate::infrastructure::bluetooth::transport::{Transport, TransportEvent};
use std::future::Future;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

const COMMAND_QUEUE_DEPTH: usize = 16;

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

#[derive(Debug)]
pub enum BluetoothCommand {
    Scan(Reply<ConnectOutcome>),
    Disconnect(Reply<DisconnectOutcome>),
    SetActuator(bool, Reply<()>),
    PollConnection(Reply<bool>),
}

/// Owner task for the session
pub struct BluetoothService<T: Transport> {
    session: Session<T>,
    commands: mpsc::Receiver<BluetoothCommand>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl<T: Transport> BluetoothService<T> {
    /// Create the service and the handle the presentation layer talks to.
    pub fn new(
        transport: T,
        config: SessionConfig,
        app_events: mpsc::UnboundedSender<AppEvent>,
    ) -> (Self, SessionHandle) {
        let (session, transport_events) = Session::new(transport, config, app_events);
        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let snapshot = session.watch();
        let handle = SessionHandle {
            commands: command_tx,
            snapshot: snapshot.clone(),
        };
        (
            Self {
                session,
                commands,
                transport_events,
                snapshot,
            },
            handle,
        )
    }

    /// Serve until every [`SessionHandle`] is dropped, then close the session.
    pub async fn run(mut self) {
        info!("Bluetooth service started");
        loop {
            tokio::select! {
                Some(event) = self.transport_events.recv() => {
                    self.session.handle_event(event).await;
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.dispatch(command).await,
                    None => break,
                },
            }
        }
        self.session.shutdown().await;
        info!("Bluetooth service stopped");
    }

    async fn dispatch(&mut self, command: BluetoothCommand) {
        match command {
            BluetoothCommand::Scan(reply) => {
                let outcome = drive(
                    &mut self.commands,
                    &self.snapshot,
                    self.session.start_scan(),
                )
                .await;
                let _ = reply.send(outcome);
            }
            BluetoothCommand::Disconnect(reply) => {
                let _ = reply.send(self.session.disconnect().await);
            }
            BluetoothCommand::SetActuator(value, reply) => {
                let _ = reply.send(self.session.set_actuator(value).await);
            }
            BluetoothCommand::PollConnection(reply) => {
                let _ = reply.send(self.session.poll_connection().await);
            }
        }
    }
}

/// Run a setup operation to completion while turning away requests that
/// would start a second one.
async fn drive<F: Future>(
    commands: &mut mpsc::Receiver<BluetoothCommand>,
    snapshot: &watch::Receiver<SessionSnapshot>,
    operation: F,
) -> F::Output {
    tokio::pin!(operation);
    loop {
        tokio::select! {
            output = &mut operation => return output,
            Some(command) = commands.recv() => {
                let state = snapshot.borrow().state;
                reject_busy(command, state);
            }
        }
    }
}

fn reject_busy(command: BluetoothCommand, state: SessionState) {
    debug!(%state, ?command, "Rejecting request during setup");
    match command {
        BluetoothCommand::Scan(reply) => {
            let _ = reply.send(Err(SessionError::Busy(state)));
        }
        BluetoothCommand::Disconnect(reply) => {
            let _ = reply.send(Err(SessionError::Busy(state)));
        }
        BluetoothCommand::SetActuator(_, reply) => {
            let _ = reply.send(Err(SessionError::NotConnected));
        }
        BluetoothCommand::PollConnection(reply) => {
            let _ = reply.send(Ok(false));
        }
    }
}

/// Presentation-side handle: observe the session and request changes.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<BluetoothCommand>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    pub async fn request_scan(&self) -> Result<ConnectOutcome, SessionError> {
        self.request(BluetoothCommand::Scan).await
    }

    pub async fn request_disconnect(&self) -> Result<DisconnectOutcome, SessionError> {
        self.request(BluetoothCommand::Disconnect).await
    }

    pub async fn request_set_actuator(&self, value: bool) -> Result<(), SessionError> {
        self.request(|reply| BluetoothCommand::SetActuator(value, reply))
            .await
    }

    pub async fn poll_connection(&self) -> Result<bool, SessionError> {
        self.request(BluetoothCommand::PollConnection).await
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    async fn request<R>(
        &self,
        command: impl FnOnce(Reply<R>) -> BluetoothCommand,
    ) -> Result<R, SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SessionError::ServiceStopped)?;
        response.await.map_err(|_| SessionError::ServiceStopped)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Advertisement;
    use crate::infrastructure::bluetooth::fake::FakeTransport;
    use crate::infrastructure::bluetooth::protocol::{ACTUATOR, STATUS};
    use std::time::Duration;

    fn spawn(fake: &FakeTransport) -> (SessionHandle, mpsc::UnboundedReceiver<AppEvent>) {
        let (app_tx, app_rx) = mpsc::unbounded_channel();
        let config = SessionConfig {
            target_name: "ESP32".into(),
            scan_timeout: Duration::from_secs(5),
            disconnect_confirm_timeout: Duration::from_millis(200),
            disconnect_poll_interval: Duration::from_millis(20),
        };
        let (service, handle) = BluetoothService::new(fake.clone(), config, app_tx);
        tokio::spawn(service.run());
        (handle, app_rx)
    }

    async fn wait_for_state(handle: &SessionHandle, state: SessionState) {
        let mut watch = handle.watch();
        watch
            .wait_for(|snapshot| snapshot.state == state)
            .await
            .expect("service dropped the snapshot channel");
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_scan_rejected_while_scanning() {
        let fake = FakeTransport::default();
        fake.state().advertisements = vec![Advertisement::named("other-id", "Other")];
        let (handle, _app) = spawn(&fake);

        let first = tokio::spawn({
            let handle = handle.clone();
            async move { handle.request_scan().await }
        });
        wait_for_state(&handle, SessionState::Scanning).await;

        assert!(matches!(
            handle.request_scan().await,
            Err(SessionError::Busy(SessionState::Scanning))
        ));
        assert!(!handle.poll_connection().await.unwrap());

        let first = first.await.unwrap().unwrap();
        assert_eq!(first, ConnectOutcome::NotFound);
        assert_eq!(fake.state().start_scan_calls, 1);
        assert_eq!(fake.state().stop_scan_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_scan_rejected_while_connecting() {
        let fake = FakeTransport::with_device("ESP32");
        let gate = fake.gate_connect();
        let (handle, _app) = spawn(&fake);

        let first = tokio::spawn({
            let handle = handle.clone();
            async move { handle.request_scan().await }
        });
        wait_for_state(&handle, SessionState::Connecting).await;

        let second = handle.request_scan().await;
        assert!(matches!(
            second,
            Err(SessionError::Busy(SessionState::Connecting))
        ));
        assert!(matches!(
            handle.request_set_actuator(true).await,
            Err(SessionError::NotConnected)
        ));

        gate.notify_one();
        let first = first.await.unwrap().unwrap();
        assert!(matches!(first, ConnectOutcome::Connected(_)));
        assert_eq!(fake.state().start_scan_calls, 1);
        assert_eq!(fake.state().connect_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_scan_rejected_while_discovering() {
        let fake = FakeTransport::with_device("ESP32");
        let gate = fake.gate_discover();
        let (handle, _app) = spawn(&fake);

        let first = tokio::spawn({
            let handle = handle.clone();
            async move { handle.request_scan().await }
        });
        wait_for_state(&handle, SessionState::Discovering).await;

        assert!(matches!(
            handle.request_scan().await,
            Err(SessionError::Busy(SessionState::Discovering))
        ));
        assert!(matches!(
            handle.request_disconnect().await,
            Err(SessionError::Busy(SessionState::Discovering))
        ));

        gate.notify_one();
        assert!(first.await.unwrap().is_ok());
        assert_eq!(handle.snapshot().state, SessionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_scan_rejected_while_ready() {
        let fake = FakeTransport::with_device("ESP32");
        let (handle, _app) = spawn(&fake);

        handle.request_scan().await.unwrap();
        assert!(matches!(
            handle.request_scan().await,
            Err(SessionError::Busy(SessionState::Ready))
        ));
        assert_eq!(fake.state().start_scan_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_round_trip_through_handle() {
        let fake = FakeTransport::with_device("ESP32");
        let (handle, _app) = spawn(&fake);
        let mut watch = handle.watch();

        handle.request_scan().await.unwrap();
        handle.request_set_actuator(true).await.unwrap();
        assert!(handle.snapshot().actuator);

        fake.notify(&STATUS, b"Button pressed");
        watch
            .wait_for(|s| s.status_text == "Button pressed")
            .await
            .unwrap();

        let outcome = handle.request_disconnect().await.unwrap();
        assert_eq!(outcome, DisconnectOutcome::Confirmed);
        assert_eq!(handle.snapshot(), SessionSnapshot::default());
        assert!(!handle.poll_connection().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_disconnect_flips_connected_flag() {
        let fake = FakeTransport::with_device("ESP32");
        let (handle, mut app) = spawn(&fake);

        handle.request_scan().await.unwrap();
        fake.notify(&ACTUATOR, b"1");
        let mut watch = handle.watch();
        watch.wait_for(|s| s.actuator).await.unwrap();

        fake.drop_link();
        watch.wait_for(|s| !s.connected).await.unwrap();

        assert_eq!(fake.cancel_count(&STATUS), 1);
        assert_eq!(fake.cancel_count(&ACTUATOR), 1);
        let mut lost = false;
        while let Ok(event) = app.try_recv() {
            lost |= matches!(event, AppEvent::ConnectionLost(_));
        }
        assert!(lost);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_disconnect_during_write_is_applied_after_reply() {
        let fake = FakeTransport::with_device("ESP32");
        let (handle, mut app) = spawn(&fake);
        handle.request_scan().await.unwrap();
        let gate = fake.gate_write();

        let write = tokio::spawn({
            let handle = handle.clone();
            async move { handle.request_set_actuator(true).await }
        });
        // Let the owner park inside the write
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fake.state().write_calls, 1);

        fake.drop_link();
        gate.notify_one();

        assert!(write.await.unwrap().is_ok());
        let mut watch = handle.watch();
        watch
            .wait_for(|s| s.state == SessionState::Idle && !s.connected)
            .await
            .unwrap();

        let snapshot = handle.snapshot();
        assert_eq!(snapshot, SessionSnapshot::default());
        assert_eq!(fake.cancel_count(&STATUS), 1);
        assert_eq!(fake.cancel_count(&ACTUATOR), 1);
        assert_eq!(fake.state().disconnect_calls, 0);
        let mut lost = 0;
        while let Ok(event) = app.try_recv() {
            if matches!(event, AppEvent::ConnectionLost(_)) {
                lost += 1;
            }
        }
        assert_eq!(lost, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handles_shuts_session_down() {
        let fake = FakeTransport::with_device("ESP32");
        let (app_tx, _app_rx) = mpsc::unbounded_channel();
        let (service, handle) =
            BluetoothService::new(fake.clone(), SessionConfig::default(), app_tx);
        let task = tokio::spawn(service.run());

        handle.request_scan().await.unwrap();
        drop(handle);
        task.await.unwrap();

        assert_eq!(fake.state().disconnect_calls, 1);
        assert!(!fake.state().connected);
    }

    #[tokio::test]
    async fn test_stopped_service_reports_error() {
        let fake = FakeTransport::with_device("ESP32");
        let (app_tx, _app_rx) = mpsc::unbounded_channel();
        let (service, handle) = BluetoothService::new(fake, SessionConfig::default(), app_tx);
        drop(service);

        assert!(matches!(
            handle.request_scan().await,
            Err(SessionError::ServiceStopped)
        ));
    }
}
