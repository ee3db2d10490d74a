use std::fmt;

/// Transport-assigned identifier of a peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A peripheral that matched the scan filter. Immutable once discovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralIdentity {
    pub id: PeripheralId,
    pub name: String,
}

impl fmt::Display for PeripheralIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// A single advertisement as reported by the transport while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub id: PeripheralId,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

impl Advertisement {
    pub fn named(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: PeripheralId::new(id),
            name: Some(name.into()),
            rssi: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting,
    Discovering,
    Ready,
    Disconnecting,
    Error,
}

impl SessionState {
    /// A new scan may only begin from a resting state.
    pub fn accepts_scan(self) -> bool {
        matches!(self, Self::Idle | Self::Error)
    }

    pub fn is_connected(self) -> bool {
        matches!(self, Self::Ready | Self::Disconnecting)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Connecting => "connecting",
            Self::Discovering => "discovering",
            Self::Ready => "ready",
            Self::Disconnecting => "disconnecting",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// What the presentation layer observes of the live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub peripheral: Option<PeripheralIdentity>,
    pub connected: bool,
    pub status_text: String,
    pub actuator: bool,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            peripheral: None,
            connected: false,
            status_text: String::new(),
            actuator: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    /// The link dropped without being asked to.
    ConnectionLost(PeripheralIdentity),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
