//! Scriptable in-memory transport used by the unit tests.

use crate::domain::models::{Advertisement, PeripheralId};
use crate::infrastructure::bluetooth::error::TransportError;
use crate::infrastructure::bluetooth::protocol::{
    self, CharacteristicDescriptor, DiscoveredCharacteristic, WireValue,
};
use crate::infrastructure::bluetooth::transport::{
    AdvertisementStream, DisconnectSink, NotificationSink, SubscriptionHandle, SubscriptionId,
    Transport,
};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeConnection {
    pub id: PeripheralId,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub advertisements: Vec<Advertisement>,
    pub scan_error: Option<TransportError>,
    pub start_scan_calls: usize,
    pub stop_scan_calls: usize,

    pub connect_gate: Option<Arc<Notify>>,
    pub discover_gate: Option<Arc<Notify>>,
    pub connect_error: Option<TransportError>,
    pub discover_error: Option<TransportError>,
    pub characteristics: Vec<DiscoveredCharacteristic>,

    pub values: HashMap<Uuid, Vec<u8>>,
    pub read_errors: HashMap<Uuid, TransportError>,
    pub write_gate: Option<Arc<Notify>>,
    pub write_calls: usize,
    pub write_error: Option<TransportError>,
    pub writes: Vec<(Uuid, Vec<u8>)>,
    pub subscribe_error: Option<TransportError>,

    /// Order of read/subscribe calls, e.g. `read:status`
    pub calls: Vec<String>,
    pub sinks: HashMap<Uuid, NotificationSink>,
    pub cancelled: Vec<(SubscriptionId, Uuid)>,
    pub disconnect_sink: Option<DisconnectSink>,

    pub connected: bool,
    pub connect_calls: usize,
    pub disconnect_calls: usize,
    /// Keep reporting a live link after `disconnect` until the test clears it
    pub ignore_disconnect: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
}

fn label(uuid: &Uuid) -> &'static str {
    if *uuid == protocol::STATUS_CHAR_UUID {
        "status"
    } else if *uuid == protocol::ACTUATOR_CHAR_UUID {
        "actuator"
    } else {
        "other"
    }
}

impl FakeTransport {
    /// A healthy peripheral named `name` with both characteristics present.
    pub fn with_device(name: &str) -> Self {
        let fake = Self::default();
        {
            let mut state = fake.state();
            state
                .advertisements
                .push(Advertisement::named(format!("{}-id", name), name));
            state.characteristics = protocol::REQUIRED_CHARACTERISTICS
                .iter()
                .map(|d| DiscoveredCharacteristic::from(*d))
                .collect();
            state
                .values
                .insert(protocol::STATUS_CHAR_UUID, b"Hello".to_vec());
            state
                .values
                .insert(protocol::ACTUATOR_CHAR_UUID, b"0".to_vec());
        }
        fake
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn gate_connect(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state().connect_gate = Some(gate.clone());
        gate
    }

    /// Hold the next writes open until the returned gate is notified.
    pub fn gate_write(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state().write_gate = Some(gate.clone());
        gate
    }

    pub fn gate_discover(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state().discover_gate = Some(gate.clone());
        gate
    }

    /// Push a notification through the installed sink, as the radio would.
    pub fn notify(&self, descriptor: &CharacteristicDescriptor, payload: &[u8]) -> bool {
        let sink = self.state().sinks.get(&descriptor.characteristic).cloned();
        sink.map(|s| s.deliver(payload)).unwrap_or(false)
    }

    /// Drop the link from the peripheral side.
    pub fn drop_link(&self) {
        let sink = {
            let mut state = self.state();
            state.connected = false;
            state.disconnect_sink.clone()
        };
        if let Some(sink) = sink {
            sink.notify();
        }
    }

    pub fn cancel_count(&self, descriptor: &CharacteristicDescriptor) -> usize {
        self.state()
            .cancelled
            .iter()
            .filter(|(_, uuid)| *uuid == descriptor.characteristic)
            .count()
    }
}

impl Transport for FakeTransport {
    type Connection = FakeConnection;

    async fn start_scan(&self) -> Result<AdvertisementStream, TransportError> {
        let (advertisements, scan_error) = {
            let mut state = self.state();
            state.start_scan_calls += 1;
            (state.advertisements.clone(), state.scan_error.clone())
        };
        let seen = stream::iter(advertisements.into_iter().map(Ok));
        Ok(match scan_error {
            Some(error) => seen.chain(stream::iter([Err(error)])).chain(stream::pending()).boxed(),
            None => seen.chain(stream::pending()).boxed(),
        })
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.state().stop_scan_calls += 1;
        Ok(())
    }

    async fn connect(&self, id: &PeripheralId) -> Result<FakeConnection, TransportError> {
        let gate = {
            let mut state = self.state();
            state.connect_calls += 1;
            state.connect_gate.clone()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let mut state = self.state();
        if let Some(error) = state.connect_error.clone() {
            return Err(error);
        }
        state.connected = true;
        Ok(FakeConnection { id: id.clone() })
    }

    async fn discover(
        &self,
        _connection: &FakeConnection,
    ) -> Result<Vec<DiscoveredCharacteristic>, TransportError> {
        let gate = self.state().discover_gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let state = self.state();
        match state.discover_error.clone() {
            Some(error) => Err(error),
            None => Ok(state.characteristics.clone()),
        }
    }

    async fn read(
        &self,
        _connection: &FakeConnection,
        descriptor: &CharacteristicDescriptor,
    ) -> Result<WireValue, TransportError> {
        let uuid = descriptor.characteristic;
        let mut state = self.state();
        state.calls.push(format!("read:{}", label(&uuid)));
        if let Some(error) = state.read_errors.get(&uuid) {
            return Err(error.clone());
        }
        state
            .values
            .get(&uuid)
            .map(|bytes| WireValue::from(bytes.clone()))
            .ok_or(TransportError::MissingCharacteristic(uuid))
    }

    async fn write(
        &self,
        _connection: &FakeConnection,
        descriptor: &CharacteristicDescriptor,
        value: &WireValue,
    ) -> Result<(), TransportError> {
        let gate = {
            let mut state = self.state();
            state.write_calls += 1;
            state.write_gate.clone()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let mut state = self.state();
        if let Some(error) = state.write_error.clone() {
            return Err(error);
        }
        state
            .writes
            .push((descriptor.characteristic, value.as_bytes().to_vec()));
        state
            .values
            .insert(descriptor.characteristic, value.as_bytes().to_vec());
        Ok(())
    }

    async fn subscribe(
        &self,
        _connection: &FakeConnection,
        descriptor: &CharacteristicDescriptor,
        sink: NotificationSink,
    ) -> Result<SubscriptionHandle, TransportError> {
        let uuid = descriptor.characteristic;
        let mut state = self.state();
        state.calls.push(format!("subscribe:{}", label(&uuid)));
        if let Some(error) = state.subscribe_error.clone() {
            return Err(error);
        }
        let handle = SubscriptionHandle::new(sink.id(), *descriptor);
        state.sinks.insert(uuid, sink);
        Ok(handle)
    }

    async fn cancel(&self, handle: SubscriptionHandle) -> Result<(), TransportError> {
        let uuid = handle.descriptor().characteristic;
        let mut state = self.state();
        state.cancelled.push((handle.id(), uuid));
        // Keep the sink so tests can push a late notification after cancellation
        Ok(())
    }

    async fn disconnect(&self, _connection: &FakeConnection) -> Result<(), TransportError> {
        let mut state = self.state();
        state.disconnect_calls += 1;
        if !state.ignore_disconnect {
            state.connected = false;
        }
        Ok(())
    }

    async fn is_connected(&self, _connection: &FakeConnection) -> Result<bool, TransportError> {
        Ok(self.state().connected)
    }

    async fn on_unexpected_disconnect(
        &self,
        _connection: &FakeConnection,
        sink: DisconnectSink,
    ) -> Result<(), TransportError> {
        self.state().disconnect_sink = Some(sink);
        Ok(())
    }
}
