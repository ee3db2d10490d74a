//! Transport Handle Contract
//!
//! The radio is reached only through [`Transport`]. Callbacks from the radio
//! never touch session state directly: they go through a sink that enqueues a
//! [`TransportEvent`] for the session owner to apply in order.

use crate::domain::models::{Advertisement, PeripheralId};
use crate::infrastructure::bluetooth::error::TransportError;
use crate::infrastructure::bluetooth::protocol::{
    CharacteristicDescriptor, DiscoveredCharacteristic, WireValue,
};
use futures::stream::BoxStream;
use std::fmt;
use std::future::Future;
use tokio::sync::mpsc;

/// Advertisements seen while a scan is running, in arrival order
pub type AdvertisementStream = BoxStream<'static, Result<Advertisement, TransportError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Token for a standing notification listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    descriptor: CharacteristicDescriptor,
}

impl SubscriptionHandle {
    pub fn new(id: SubscriptionId, descriptor: CharacteristicDescriptor) -> Self {
        Self { id, descriptor }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn descriptor(&self) -> &CharacteristicDescriptor {
        &self.descriptor
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Notification {
        subscription: SubscriptionId,
        payload: WireValue,
    },
    /// The link of connection attempt `epoch` went down.
    Disconnected { epoch: u64 },
}

/// Ingress for one subscription's notifications.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    subscription: SubscriptionId,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl NotificationSink {
    pub fn id(&self) -> SubscriptionId {
        self.subscription
    }

    /// Queue a payload for the session owner. Returns `false` once the owner is gone.
    pub fn deliver(&self, payload: impl Into<WireValue>) -> bool {
        self.tx
            .send(TransportEvent::Notification {
                subscription: self.subscription,
                payload: payload.into(),
            })
            .is_ok()
    }
}

/// Ingress for the unexpected-disconnect callback of one connection attempt.
#[derive(Debug, Clone)]
pub struct DisconnectSink {
    epoch: u64,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl DisconnectSink {
    pub fn notify(&self) -> bool {
        self.tx
            .send(TransportEvent::Disconnected { epoch: self.epoch })
            .is_ok()
    }
}

/// Owner side of the event queue; hands out sinks.
#[derive(Debug)]
pub struct EventIngress {
    tx: mpsc::UnboundedSender<TransportEvent>,
    next_subscription: u64,
}

impl EventIngress {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                next_subscription: 1,
            },
            rx,
        )
    }

    pub fn notification_sink(&mut self) -> NotificationSink {
        let subscription = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        NotificationSink {
            subscription,
            tx: self.tx.clone(),
        }
    }

    pub fn disconnect_sink(&self, epoch: u64) -> DisconnectSink {
        DisconnectSink {
            epoch,
            tx: self.tx.clone(),
        }
    }
}

/// Platform radio as seen by the session.
///
/// Only the session state machine calls scan, connect, and disconnect.
pub trait Transport: Send + Sync + 'static {
    type Connection: Clone + fmt::Debug + Send + Sync + 'static;

    fn start_scan(
        &self,
    ) -> impl Future<Output = Result<AdvertisementStream, TransportError>> + Send;

    fn stop_scan(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn connect(
        &self,
        id: &PeripheralId,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;

    fn discover(
        &self,
        connection: &Self::Connection,
    ) -> impl Future<Output = Result<Vec<DiscoveredCharacteristic>, TransportError>> + Send;

    fn read(
        &self,
        connection: &Self::Connection,
        descriptor: &CharacteristicDescriptor,
    ) -> impl Future<Output = Result<WireValue, TransportError>> + Send;

    /// Write-with-response; resolves once the peripheral acknowledged.
    fn write(
        &self,
        connection: &Self::Connection,
        descriptor: &CharacteristicDescriptor,
        value: &WireValue,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn subscribe(
        &self,
        connection: &Self::Connection,
        descriptor: &CharacteristicDescriptor,
        sink: NotificationSink,
    ) -> impl Future<Output = Result<SubscriptionHandle, TransportError>> + Send;

    fn cancel(
        &self,
        handle: SubscriptionHandle,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn disconnect(
        &self,
        connection: &Self::Connection,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn is_connected(
        &self,
        connection: &Self::Connection,
    ) -> impl Future<Output = Result<bool, TransportError>> + Send;

    fn on_unexpected_disconnect(
        &self,
        connection: &Self::Connection,
        sink: DisconnectSink,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}
