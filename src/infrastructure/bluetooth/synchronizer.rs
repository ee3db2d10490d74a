//! Characteristic Synchronizer
//!
//! Keeps the session's last-known status text and actuator flag in step with
//! the peripheral: one read per characteristic, then a standing subscription,
//! then last-writer-wins updates from notifications.

use crate::infrastructure::bluetooth::error::SessionError;
use crate::infrastructure::bluetooth::protocol::{
    self, CharacteristicDescriptor, CharacteristicKind, CodecError, DecodedValue, WireValue,
    ACTUATOR, REQUIRED_CHARACTERISTICS,
};
use crate::infrastructure::bluetooth::transport::{
    EventIngress, SubscriptionHandle, SubscriptionId, Transport,
};
use tracing::{debug, info, warn};

/// Last-known values mirrored from the peripheral
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncedValues {
    pub status_text: String,
    pub actuator: bool,
}

impl SyncedValues {
    /// Decode `payload` and overwrite the matching field. On a decode error
    /// the field keeps its previous value. Returns whether anything changed.
    pub fn apply(
        &mut self,
        kind: CharacteristicKind,
        payload: &WireValue,
    ) -> Result<bool, CodecError> {
        match protocol::decode(payload, kind)? {
            DecodedValue::Text(text) => {
                let changed = self.status_text != text;
                self.status_text = text;
                Ok(changed)
            }
            DecodedValue::Flag(flag) => {
                let changed = self.actuator != flag;
                self.actuator = flag;
                Ok(changed)
            }
        }
    }
}

/// Active subscription handles, at most one per characteristic
#[derive(Debug, Default)]
pub struct Subscriptions {
    status: Option<SubscriptionHandle>,
    actuator: Option<SubscriptionHandle>,
}

impl Subscriptions {
    fn slot(&mut self, kind: CharacteristicKind) -> &mut Option<SubscriptionHandle> {
        match kind {
            CharacteristicKind::Status => &mut self.status,
            CharacteristicKind::Actuator => &mut self.actuator,
        }
    }

    /// Which characteristic an id belongs to, if it is still active.
    pub fn kind_of(&self, id: SubscriptionId) -> Option<CharacteristicKind> {
        [&self.status, &self.actuator]
            .into_iter()
            .flatten()
            .find(|handle| handle.id() == id)
            .map(|handle| handle.descriptor().kind)
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.actuator.is_none()
    }

    /// Remove every handle; each is returned exactly once.
    pub fn take_all(&mut self) -> Vec<SubscriptionHandle> {
        [self.status.take(), self.actuator.take()]
            .into_iter()
            .flatten()
            .collect()
    }
}

pub struct CharacteristicSynchronizer<'a, T: Transport> {
    transport: &'a T,
    connection: &'a T::Connection,
}

impl<'a, T: Transport> CharacteristicSynchronizer<'a, T> {
    pub fn new(transport: &'a T, connection: &'a T::Connection) -> Self {
        Self {
            transport,
            connection,
        }
    }

    /// Read each characteristic, then subscribe to it.
    ///
    /// Handles are stored as soon as they are installed so that a failure
    /// halfway leaves nothing the caller cannot cancel.
    pub async fn initial_sync(
        &self,
        values: &mut SyncedValues,
        subscriptions: &mut Subscriptions,
        ingress: &mut EventIngress,
    ) -> Result<(), SessionError> {
        for descriptor in &REQUIRED_CHARACTERISTICS {
            let payload = self
                .transport
                .read(self.connection, descriptor)
                .await
                .map_err(|source| SessionError::SyncFailed {
                    characteristic: descriptor.kind,
                    source,
                })?;

            if let Err(e) = values.apply(descriptor.kind, &payload) {
                warn!(characteristic = %descriptor.kind, "Ignoring initial value: {}", e);
            }

            let handle = self
                .transport
                .subscribe(self.connection, descriptor, ingress.notification_sink())
                .await
                .map_err(|source| SessionError::SyncFailed {
                    characteristic: descriptor.kind,
                    source,
                })?;
            debug!(characteristic = %descriptor.kind, subscription = %handle.id(), "Subscribed");
            *subscriptions.slot(descriptor.kind) = Some(handle);
        }

        info!(
            status = %values.status_text,
            actuator = values.actuator,
            "Initial values synchronized"
        );
        Ok(())
    }

    /// Write the actuator flag and wait for the acknowledgement. The local
    /// value only changes once the peripheral has acknowledged.
    pub async fn write_actuator(
        &self,
        values: &mut SyncedValues,
        value: bool,
    ) -> Result<(), SessionError> {
        self.write(&ACTUATOR, &protocol::encode_actuator(value)).await?;
        values.actuator = value;
        info!(actuator = value, "Actuator value changed");
        Ok(())
    }

    async fn write(
        &self,
        descriptor: &CharacteristicDescriptor,
        payload: &WireValue,
    ) -> Result<(), SessionError> {
        self.transport
            .write(self.connection, descriptor, payload)
            .await
            .map_err(|e| {
                warn!(characteristic = %descriptor.kind, "Write failed: {}", e);
                SessionError::WriteFailed(e)
            })
    }
}

/// Cancel every standing subscription. Failures are logged, not returned.
pub async fn cancel_all<T: Transport>(transport: &T, subscriptions: &mut Subscriptions) {
    for handle in subscriptions.take_all() {
        let kind = handle.descriptor().kind;
        match transport.cancel(handle).await {
            Ok(()) => debug!(characteristic = %kind, "Subscription cancelled"),
            Err(e) => warn!(characteristic = %kind, "Failed to cancel subscription: {}", e),
        }
    }
}
