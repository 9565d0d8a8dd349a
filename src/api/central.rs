use std::fmt;

use uuid::Uuid;

/// Transport-assigned identity of a remote peripheral (address or UUID string).
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        PeripheralId(id.into())
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

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        PeripheralId::new(id)
    }
}

impl From<String> for PeripheralId {
    fn from(id: String) -> Self {
        PeripheralId(id)
    }
}

impl From<Uuid> for PeripheralId {
    fn from(id: Uuid) -> Self {
        PeripheralId(id.to_string())
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ScanFilter {
    pub services: Vec<Uuid>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ScanResult {
    pub peripheral: PeripheralId,
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
    pub services: Vec<Uuid>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AdapterState {
    #[default]
    Unknown = 0,
    PoweredOn = 1,
    PoweredOff = 2,
}

/// Lifecycle of the link to one peripheral.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Discovering,
    Ready,
    Disconnecting,
    Error,
}

impl ConnectionState {
    /// A connect attempt is underway but has not reached Ready.
    pub fn is_establishing(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Discovering
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Discovering => "discovering",
            ConnectionState::Ready => "ready",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}
