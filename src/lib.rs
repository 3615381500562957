// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # ble-uart-session
//!
//! Session lifecycle management for BLE peripherals exposing a Nordic-style
//! UART service (RX/TX characteristic pair), such as the `ESP32_BLE_UART`
//! firmware.
//!
//! A [`Session`] walks a connect request through peripheral selection, GATT
//! connection, service discovery and notification subscription. Once ready it
//! sends payloads to the RX characteristic and keeps an ordered log of every
//! TX notification. Link loss at any point brings the session back to
//! `Disconnected`, and a step that was still running when the link dropped
//! cannot bring it back to life.
//!
//! ## Features
//!
//! - **Transport boundary**: the [`Transport`] trait, implemented over
//!   btleplug ([`BtleplugTransport`]) and in memory ([`ScriptedTransport`])
//! - **Profiles**: UART by default; Battery and Device Information as
//!   read-only profiles
//! - **Session log**: frames, sent payloads and lifecycle markers in arrival
//!   order, optionally bounded
//! - **Events**: state changes, frames and user-facing notices over a
//!   broadcast channel or callbacks
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ble_uart_session::{BtleplugTransport, Result, Session, SessionConfig, TransportConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let transport = BtleplugTransport::new(TransportConfig::default()).await?;
//!     let session = Session::new(Arc::new(transport), SessionConfig::default());
//!
//!     let _frames = session.on_frame(|frame| println!("<- {}", frame));
//!
//!     let peripheral = session.connect().await?;
//!     println!("Connected to {}", peripheral.display_name());
//!
//!     session.send_text("hello\n").await?;
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!
//!     session.disconnect().await?;
//!     print!("{}", session.log().to_text());
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod config;
pub mod error;
pub mod session;
pub mod utils;

// Re-exports for convenience
pub use config::{SessionConfig, TransportConfig};
pub use error::{Error, Result};
pub use session::{
    CallbackHandle, DisconnectReason, Frame, LogEntry, LogEntryKind, Marker, Notice, NoticeLevel,
    Session, SessionEvent, SessionLog, SessionState,
};
pub use utils::{hex_preview, printable};

// Re-export commonly used types from submodules
pub use ble::{
    BtleplugTransport, CharacteristicHandles, ConnectionHandle, PeripheralCandidate,
    PeripheralChooser, PeripheralFilter, PeripheralHandle, ScriptedTransport, ServiceProfile,
    StrongestSignal, Transport, TransportEvent,
};
