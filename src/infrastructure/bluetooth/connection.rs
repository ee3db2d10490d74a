//! BLE Connection Module
//!
//! Connects to the matched peripheral and checks that its GATT table carries
//! both characteristics the session needs.

use crate::domain::models::PeripheralIdentity;
use crate::infrastructure::bluetooth::error::SessionError;
use crate::infrastructure::bluetooth::protocol::{
    CharacteristicDescriptor, DiscoveredCharacteristic, REQUIRED_CHARACTERISTICS,
};
use crate::infrastructure::bluetooth::transport::{DisconnectSink, Transport};
use tracing::{debug, error, info};

/// Connection handler over a borrowed transport
pub struct BleConnection<'a, T: Transport> {
    transport: &'a T,
}

impl<'a, T: Transport> BleConnection<'a, T> {
    pub fn new(transport: &'a T) -> Self {
        Self { transport }
    }

    /// Open the link and register for unexpected disconnects on it.
    pub async fn connect(
        &self,
        identity: &PeripheralIdentity,
        on_disconnect: DisconnectSink,
    ) -> Result<T::Connection, SessionError> {
        info!(peripheral = %identity, "Connecting");

        let connection = self
            .transport
            .connect(&identity.id)
            .await
            .map_err(|source| SessionError::ConnectFailed {
                peripheral: identity.id.clone(),
                source,
            })?;

        if let Err(source) = self
            .transport
            .on_unexpected_disconnect(&connection, on_disconnect)
            .await
        {
            error!("Could not watch link state: {}", source);
            if let Err(e) = self.transport.disconnect(&connection).await {
                debug!("Disconnect after failed watch registration: {}", e);
            }
            return Err(SessionError::ConnectFailed {
                peripheral: identity.id.clone(),
                source,
            });
        }

        info!(peripheral = %identity, "Link established");
        Ok(connection)
    }

    /// Run service discovery and resolve the required characteristics.
    pub async fn discover(&self, connection: &T::Connection) -> Result<(), SessionError> {
        let discovered = self
            .transport
            .discover(connection)
            .await
            .map_err(|e| SessionError::DiscoveryFailed(e.to_string()))?;
        info!("Found {} characteristics", discovered.len());

        for descriptor in &REQUIRED_CHARACTERISTICS {
            resolve(descriptor, &discovered)?;
        }
        Ok(())
    }
}

fn resolve(
    descriptor: &CharacteristicDescriptor,
    discovered: &[DiscoveredCharacteristic],
) -> Result<(), SessionError> {
    let found = discovered
        .iter()
        .find(|c| c.service == descriptor.service && c.uuid == descriptor.characteristic)
        .ok_or_else(|| {
            SessionError::DiscoveryFailed(format!(
                "{} characteristic {} not found",
                descriptor.kind, descriptor.characteristic
            ))
        })?;

    if !found.capabilities.covers(&descriptor.capabilities) {
        return Err(SessionError::DiscoveryFailed(format!(
            "{} characteristic offers {:?}, needs {:?}",
            descriptor.kind, found.capabilities, descriptor.capabilities
        )));
    }

    debug!(characteristic = %descriptor.kind, "Resolved characteristic");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::{Capabilities, ACTUATOR, STATUS};

    #[test]
    fn test_resolves_full_table() {
        let table: Vec<_> = REQUIRED_CHARACTERISTICS
            .iter()
            .map(|d| DiscoveredCharacteristic::from(*d))
            .collect();
        assert!(resolve(&STATUS, &table).is_ok());
        assert!(resolve(&ACTUATOR, &table).is_ok());
    }

    #[test]
    fn test_missing_characteristic() {
        let table = vec![DiscoveredCharacteristic::from(STATUS)];
        let err = resolve(&ACTUATOR, &table).unwrap_err();
        assert!(matches!(err, SessionError::DiscoveryFailed(msg) if msg.contains("actuator")));
    }

    #[test]
    fn test_wrong_service_does_not_match() {
        let mut foreign = DiscoveredCharacteristic::from(STATUS);
        foreign.service = uuid::Uuid::nil();
        assert!(resolve(&STATUS, &[foreign]).is_err());
    }

    #[test]
    fn test_read_only_actuator_is_rejected() {
        let mut read_only = DiscoveredCharacteristic::from(ACTUATOR);
        read_only.capabilities = Capabilities {
            read: true,
            write: false,
            notify: true,
        };
        let err = resolve(&ACTUATOR, &[read_only]).unwrap_err();
        assert!(matches!(err, SessionError::DiscoveryFailed(_)));
    }
}
