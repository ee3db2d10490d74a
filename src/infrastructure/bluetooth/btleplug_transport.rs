//! btleplug Transport
//!
//! [`Transport`] over the host's first Bluetooth adapter. Notification and
//! disconnect callbacks run on spawned tasks and only ever hand their data to
//! the sinks they were given.

use crate::domain::models::{Advertisement, PeripheralId};
use crate::infrastructure::bluetooth::error::TransportError;
use crate::infrastructure::bluetooth::protocol::{
    Capabilities, CharacteristicDescriptor, DiscoveredCharacteristic, WireValue,
};
use crate::infrastructure::bluetooth::transport::{
    AdvertisementStream, DisconnectSink, NotificationSink, SubscriptionHandle, SubscriptionId,
    Transport,
};
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

type PeripheralCache = Arc<Mutex<HashMap<PeripheralId, Peripheral>>>;

/// Live link to one peripheral
#[derive(Debug, Clone)]
pub struct BtleplugConnection {
    id: PeripheralId,
    peripheral: Peripheral,
}

impl BtleplugConnection {
    pub fn id(&self) -> &PeripheralId {
        &self.id
    }
}

struct ActiveSubscription {
    peripheral: Peripheral,
    characteristic: Characteristic,
    task: JoinHandle<()>,
}

pub struct BtleplugTransport {
    adapter: Adapter,
    peripherals: PeripheralCache,
    subscriptions: Mutex<HashMap<SubscriptionId, ActiveSubscription>>,
    disconnect_watchers: Mutex<HashMap<PeripheralId, JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BtleplugTransport {
    /// Open the first adapter the platform reports.
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                TransportError::AdapterUnavailable("no Bluetooth adapter found".into())
            })?;

        match adapter.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter {}", info),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }

        Ok(Self {
            adapter,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            subscriptions: Mutex::new(HashMap::new()),
            disconnect_watchers: Mutex::new(HashMap::new()),
        })
    }

    fn peripheral(&self, id: &PeripheralId) -> Result<Peripheral, TransportError> {
        lock(&self.peripherals)
            .get(id)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeripheral(id.clone()))
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        for (_, subscription) in lock(&self.subscriptions).drain() {
            subscription.task.abort();
        }
        for (_, watcher) in lock(&self.disconnect_watchers).drain() {
            watcher.abort();
        }
    }
}

/// Resolve an adapter event into an advertisement, remembering the
/// peripheral so a later `connect` can find it.
async fn advertisement(
    adapter: &Adapter,
    cache: &PeripheralCache,
    id: &btleplug::platform::PeripheralId,
) -> Option<Advertisement> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;
    let key = PeripheralId::new(peripheral.id().to_string());
    lock(cache).insert(key.clone(), peripheral);
    Some(Advertisement {
        id: key,
        name: properties.local_name,
        rssi: properties.rssi,
    })
}

fn find_characteristic(
    peripheral: &Peripheral,
    descriptor: &CharacteristicDescriptor,
) -> Result<Characteristic, TransportError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == descriptor.characteristic && c.service_uuid == descriptor.service)
        .ok_or(TransportError::MissingCharacteristic(descriptor.characteristic))
}

fn capabilities(flags: CharPropFlags) -> Capabilities {
    Capabilities {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        notify: flags.intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE),
    }
}

impl Transport for BtleplugTransport {
    type Connection = BtleplugConnection;

    async fn start_scan(&self) -> Result<AdvertisementStream, TransportError> {
        if let Ok(CentralState::PoweredOff) = self.adapter.adapter_state().await {
            return Err(TransportError::AdapterUnavailable("adapter is powered off".into()));
        }

        let events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;
        debug!("Adapter scan started");

        let adapter = self.adapter.clone();
        let cache = self.peripherals.clone();
        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            let cache = cache.clone();
            async move {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        advertisement(&adapter, &cache, &id).await.map(Ok)
                    }
                    CentralEvent::StateUpdate(CentralState::PoweredOff) => {
                        Some(Err(TransportError::AdapterUnavailable(
                            "adapter powered off while scanning".into(),
                        )))
                    }
                    other => {
                        trace!(?other, "Ignoring adapter event");
                        None
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.adapter.stop_scan().await?;
        debug!("Adapter scan stopped");
        Ok(())
    }

    async fn connect(&self, id: &PeripheralId) -> Result<BtleplugConnection, TransportError> {
        let peripheral = self.peripheral(id)?;
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        Ok(BtleplugConnection {
            id: id.clone(),
            peripheral,
        })
    }

    async fn discover(
        &self,
        connection: &BtleplugConnection,
    ) -> Result<Vec<DiscoveredCharacteristic>, TransportError> {
        connection.peripheral.discover_services().await?;
        Ok(connection
            .peripheral
            .characteristics()
            .into_iter()
            .map(|c| DiscoveredCharacteristic {
                service: c.service_uuid,
                uuid: c.uuid,
                capabilities: capabilities(c.properties),
            })
            .collect())
    }

    async fn read(
        &self,
        connection: &BtleplugConnection,
        descriptor: &CharacteristicDescriptor,
    ) -> Result<WireValue, TransportError> {
        let characteristic = find_characteristic(&connection.peripheral, descriptor)?;
        let bytes = connection.peripheral.read(&characteristic).await?;
        Ok(WireValue::from(bytes))
    }

    async fn write(
        &self,
        connection: &BtleplugConnection,
        descriptor: &CharacteristicDescriptor,
        value: &WireValue,
    ) -> Result<(), TransportError> {
        let characteristic = find_characteristic(&connection.peripheral, descriptor)?;
        connection
            .peripheral
            .write(&characteristic, value.as_bytes(), WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        connection: &BtleplugConnection,
        descriptor: &CharacteristicDescriptor,
        sink: NotificationSink,
    ) -> Result<SubscriptionHandle, TransportError> {
        let characteristic = find_characteristic(&connection.peripheral, descriptor)?;
        let id = sink.id();

        // Open the stream first so nothing sent right after subscribing is missed
        let mut notifications = connection.peripheral.notifications().await?;
        let uuid = characteristic.uuid;
        let task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != uuid {
                    continue;
                }
                if !sink.deliver(notification.value) {
                    break;
                }
            }
            trace!(subscription = %sink.id(), "Notification stream closed");
        });

        if let Err(e) = connection.peripheral.subscribe(&characteristic).await {
            task.abort();
            return Err(e.into());
        }

        lock(&self.subscriptions).insert(
            id,
            ActiveSubscription {
                peripheral: connection.peripheral.clone(),
                characteristic,
                task,
            },
        );
        Ok(SubscriptionHandle::new(id, *descriptor))
    }

    async fn cancel(&self, handle: SubscriptionHandle) -> Result<(), TransportError> {
        let Some(subscription) = lock(&self.subscriptions).remove(&handle.id()) else {
            return Ok(());
        };
        subscription.task.abort();
        if subscription.peripheral.is_connected().await? {
            subscription
                .peripheral
                .unsubscribe(&subscription.characteristic)
                .await?;
        }
        Ok(())
    }

    async fn disconnect(&self, connection: &BtleplugConnection) -> Result<(), TransportError> {
        connection.peripheral.disconnect().await?;
        Ok(())
    }

    async fn is_connected(&self, connection: &BtleplugConnection) -> Result<bool, TransportError> {
        Ok(connection.peripheral.is_connected().await?)
    }

    async fn on_unexpected_disconnect(
        &self,
        connection: &BtleplugConnection,
        sink: DisconnectSink,
    ) -> Result<(), TransportError> {
        let mut events = self.adapter.events().await?;
        let watched = connection.peripheral.id();
        let label = connection.id.clone();

        let watcher = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == watched {
                        debug!(peripheral = %label, "Adapter reported disconnect");
                        sink.notify();
                        break;
                    }
                }
            }
        });

        let previous = lock(&self.disconnect_watchers).insert(connection.id.clone(), watcher);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }
}
