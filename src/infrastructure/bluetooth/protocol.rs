//! ESP32 Link Protocol
//!
//! GATT identifiers of the peripheral's single service, the two
//! characteristics this client uses, and the codec for their payloads.

use thiserror::Error;
use uuid::Uuid;

/// Custom service exposed by the peripheral
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331914b);

/// Free-form status text (read + notify)
pub const STATUS_CHAR_UUID: Uuid = Uuid::from_u128(0x6d68efe5_04b6_4a85_abc4_c2670b7bf7fd);

/// Actuator flag (read + write-with-response + notify)
pub const ACTUATOR_CHAR_UUID: Uuid = Uuid::from_u128(0xf27b53ad_c63d_49a0_8c0f_9f297e6cc520);

/// Name the peripheral advertises with
pub const DEFAULT_DEVICE_NAME: &str = "ESP32";

/// Wire encoding of the actuator flag
pub const ACTUATOR_ON: u8 = b'1';
pub const ACTUATOR_OFF: u8 = b'0';

/// Operations a characteristic supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capabilities {
    pub read: bool,
    pub write: bool,
    pub notify: bool,
}

impl Capabilities {
    /// True when every capability required by `other` is present here.
    pub fn covers(&self, other: &Capabilities) -> bool {
        (self.read || !other.read) && (self.write || !other.write) && (self.notify || !other.notify)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicKind {
    Status,
    Actuator,
}

impl std::fmt::Display for CharacteristicKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status => f.write_str("status"),
            Self::Actuator => f.write_str("actuator"),
        }
    }
}

/// A characteristic this client depends on. The two instances are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicDescriptor {
    pub kind: CharacteristicKind,
    pub service: Uuid,
    pub characteristic: Uuid,
    pub capabilities: Capabilities,
}

pub const STATUS: CharacteristicDescriptor = CharacteristicDescriptor {
    kind: CharacteristicKind::Status,
    service: SERVICE_UUID,
    characteristic: STATUS_CHAR_UUID,
    capabilities: Capabilities {
        read: true,
        write: false,
        notify: true,
    },
};

pub const ACTUATOR: CharacteristicDescriptor = CharacteristicDescriptor {
    kind: CharacteristicKind::Actuator,
    service: SERVICE_UUID,
    characteristic: ACTUATOR_CHAR_UUID,
    capabilities: Capabilities {
        read: true,
        write: true,
        notify: true,
    },
};

/// Both characteristics, in initial-sync order
pub const REQUIRED_CHARACTERISTICS: [CharacteristicDescriptor; 2] = [STATUS, ACTUATOR];

/// A characteristic as reported by service discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub service: Uuid,
    pub uuid: Uuid,
    pub capabilities: Capabilities,
}

impl From<CharacteristicDescriptor> for DiscoveredCharacteristic {
    fn from(descriptor: CharacteristicDescriptor) -> Self {
        Self {
            service: descriptor.service,
            uuid: descriptor.characteristic,
            capabilities: descriptor.capabilities,
        }
    }
}

/// Opaque payload exactly as the transport delivered it
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WireValue(Vec<u8>);

impl WireValue {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for WireValue {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for WireValue {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<&str> for WireValue {
    fn from(text: &str) -> Self {
        Self(text.as_bytes().to_vec())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedValue {
    Text(String),
    Flag(bool),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("actuator payload must be a single '0' or '1', got {0:02X?}")]
    MalformedActuator(Vec<u8>),
    #[error("status payload is not valid UTF-8 ({0} bytes)")]
    MalformedStatus(usize),
}

/// Decode a payload according to the characteristic it arrived on.
pub fn decode(value: &WireValue, kind: CharacteristicKind) -> Result<DecodedValue, CodecError> {
    match kind {
        CharacteristicKind::Status => decode_status(value).map(DecodedValue::Text),
        CharacteristicKind::Actuator => decode_actuator(value).map(DecodedValue::Flag),
    }
}

pub fn decode_status(value: &WireValue) -> Result<String, CodecError> {
    String::from_utf8(value.as_bytes().to_vec())
        .map_err(|_| CodecError::MalformedStatus(value.len()))
}

/// Anything other than exactly `'0'` or `'1'` is rejected rather than read as `false`.
pub fn decode_actuator(value: &WireValue) -> Result<bool, CodecError> {
    match value.as_bytes() {
        [ACTUATOR_ON] => Ok(true),
        [ACTUATOR_OFF] => Ok(false),
        other => Err(CodecError::MalformedActuator(other.to_vec())),
    }
}

pub fn encode_actuator(value: bool) -> WireValue {
    WireValue(vec![if value { ACTUATOR_ON } else { ACTUATOR_OFF }])
}
