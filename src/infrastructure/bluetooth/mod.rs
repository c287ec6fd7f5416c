//! Bluetooth Module
//!
//! Classic (serial profile) radio session: power control, discovery,
//! one active link and payload sending, all reported through callbacks.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   RadioEvent    ┌─────────────────────────────────┐
//! │   Adapter    │ ──────────────▶ │        BluetoothSession         │
//! │ (power, scan)│  EventReceiver  │ peers · link · CallbackRegistry │
//! └──────────────┘        ▲        └────────────────┬────────────────┘
//!                         │                         │ connect / send
//! ┌──────────────┐        │                         ▼
//! │  Transport   │ ───────┘                 caller callbacks
//! │ (links, I/O) │
//! └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`adapter`] - Platform radio seam
//! - [`transport`] - Link and transport seams
//! - [`receiver`] - Typed event intake feeding the session
//! - [`callbacks`] - Callback traits and the per-operation registry
//! - [`session`] - Main coordinator
//! - [`loopback`] - In-memory radio and transport
//! - [`socket`] - TCP bridge transport

pub mod adapter;
pub mod callbacks;
pub mod loopback;
pub mod receiver;
pub mod session;
pub mod socket;
pub mod transport;

// Re-export main session for convenience
pub use session::BluetoothSession;
