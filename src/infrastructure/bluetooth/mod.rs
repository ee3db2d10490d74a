//! Bluetooth Module
//!
//! Maintains a single GATT session with an ESP32 peripheral.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │            BluetoothService  /  SessionHandle             │
//! │   (single owner task - public API for the application)   │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                        Session                            │
//! │  Idle → Scanning → Connecting → Discovering → Ready       │
//! └───────┬──────────────┬──────────────┬───────────────────┘
//!         │              │              │
//!         ▼              ▼              ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────────┐  ┌──────────┐
//! │  Scanner  │  │ Connection │  │ Synchronizer │  │ Protocol │
//! │ - name    │  │ - link     │  │ - read       │  │ - UUIDs  │
//! │   filter  │  │ - GATT     │  │ - subscribe  │  │ - codec  │
//! └─────┬─────┘  └─────┬──────┘  └──────┬───────┘  └──────────┘
//!       └──────────────┼────────────────┘
//!                      ▼
//!              Transport (btleplug)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Service and characteristic identifiers, payload codec
//! - [`transport`] - Radio contract and the event sinks it delivers through
//! - [`btleplug_transport`] - Transport over the host adapter
//! - [`scanner`] - Name-filtered discovery
//! - [`connection`] - Link setup and GATT resolution
//! - [`synchronizer`] - Initial reads, subscriptions, actuator writes
//! - [`session`] - Session state machine
//! - [`service`] - Owner task and presentation handle

pub mod btleplug_transport;
pub mod connection;
pub mod error;
#[cfg(test)]
pub(crate) mod fake;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod session;
pub mod synchronizer;
pub mod transport;

pub use btleplug_transport::BtleplugTransport;
pub use error::{SessionError, TransportError};
pub use service::{BluetoothService, SessionHandle};
pub use session::{ConnectOutcome, DisconnectOutcome, SessionConfig};
