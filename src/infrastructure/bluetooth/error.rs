use crate::domain::models::{PeripheralId, SessionState};
use crate::infrastructure::bluetooth::protocol::{CharacteristicKind, CodecError};
use thiserror::Error;
use uuid::Uuid;

/// Failures reported by the radio/adapter layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),
    #[error("peripheral {0} has not been seen by the adapter")]
    UnknownPeripheral(PeripheralId),
    #[error("characteristic {0} not present on the peripheral")]
    MissingCharacteristic(Uuid),
    #[error("bluetooth error: {0}")]
    Platform(String),
}

impl From<btleplug::Error> for TransportError {
    fn from(e: btleplug::Error) -> Self {
        Self::Platform(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// Adapter-level failure while scanning; the attempt is abandoned.
    #[error("scan aborted: {0}")]
    Transport(#[source] TransportError),
    #[error("failed to connect to {peripheral}: {source}")]
    ConnectFailed {
        peripheral: PeripheralId,
        #[source]
        source: TransportError,
    },
    #[error("service discovery failed: {0}")]
    DiscoveryFailed(String),
    #[error("initial {characteristic} sync failed: {source}")]
    SyncFailed {
        characteristic: CharacteristicKind,
        #[source]
        source: TransportError,
    },
    #[error("actuator write was not acknowledged: {0}")]
    WriteFailed(#[source] TransportError),
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] CodecError),
    #[error("session is busy ({0})")]
    Busy(SessionState),
    #[error("no peripheral connected")]
    NotConnected,
    #[error("bluetooth service has stopped")]
    ServiceStopped,
}
