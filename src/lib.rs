//! Classic Bluetooth session management.
//!
//! A [`BluetoothSession`] owns the local radio, the results of the current
//! discovery and at most one active link. Platform notifications enter
//! through an [`EventReceiver`] and are applied one at a time; outcomes are
//! delivered to the callback registered for each operation.

pub mod domain;
pub mod infrastructure;

pub use domain::error::{CbtError, CbtResult};
pub use domain::models::{Address, AdapterState, LinkStatus, OperationKind, Peer};
pub use infrastructure::bluetooth::callbacks::{
    ConnectCallback, ScanCallback, SendCallback, StateSwitchCallback,
};
pub use infrastructure::bluetooth::receiver::{EventReceiver, RadioEvent};
pub use infrastructure::bluetooth::transport::{Link, LinkHandle, Transport};
pub use infrastructure::bluetooth::BluetoothSession;
