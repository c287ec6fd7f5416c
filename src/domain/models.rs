use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Hardware address of a remote device, e.g. `00:11:22:AA:BB:CC`.
///
/// Stored upper-cased so that addresses reported by different platform
/// layers compare equal regardless of the case they used.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    pub fn new(address: impl AsRef<str>) -> Self {
        Self(address.as_ref().trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A discoverable remote device.
///
/// Equality and hashing only look at the address; name and raw handle are
/// whatever the platform reported the first time the device was seen.
#[derive(Debug, Clone)]
pub struct Peer {
    pub address: Address,
    pub name: String,
    /// Opaque platform handle, zero when the platform does not provide one
    pub raw: u64,
}

impl Peer {
    pub fn new(address: impl Into<Address>, name: impl Into<String>) -> Self {
        Self::with_raw(address, name, 0)
    }

    pub fn with_raw(address: impl Into<Address>, name: impl Into<String>, raw: u64) -> Self {
        let name = name.into();
        Self {
            address: address.into(),
            name: if name.trim().is_empty() {
                "Unknown".to_string()
            } else {
                name
            },
            raw,
        }
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// Power state reported by the radio adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Off,
    TurningOn,
    On,
    TurningOff,
}

impl AdapterState {
    /// Map a raw platform state code. Unknown codes yield `None`.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            10 => Some(Self::Off),
            11 => Some(Self::TurningOn),
            12 => Some(Self::On),
            13 => Some(Self::TurningOff),
            _ => None,
        }
    }

    /// `Some(true)` for on, `Some(false)` for off, `None` while in transition.
    pub fn as_switch(self) -> Option<bool> {
        match self {
            Self::On => Some(true),
            Self::Off => Some(false),
            Self::TurningOn | Self::TurningOff => None,
        }
    }
}

/// Callback slot categories. Each kind holds at most one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    StateSwitch,
    Scan,
    Connect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
}
